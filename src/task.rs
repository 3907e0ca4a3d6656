//! # Tasks
//!
//! A task is one multi-round protocol operation. Tasks never touch a socket:
//! every callback returns a [`TaskStep`] listing the requests to send and the
//! routing events to apply, and the session carries them out.
//!
//! | Task | Drives |
//! |------|--------|
//! | [`LookupTask`] | iterative FIND_NODE, FIND_VALUE and STORE |
//! | [`ProbeTask`] | liveness ping for a full bucket's stalest contact |
//! | [`BootstrapTask`] | first contact with the bootstrap endpoint |
//! | [`PingTask`] | one-off reachability check of an address |
//!
//! ## Lookup rounds
//!
//! ```text
//! seeding ──► iterating ──► (found | exhausted | storing ──► stored)
//! ```
//!
//! Each round sends at most `alpha` requests to the nearest candidates not yet
//! queried, and the next round starts only once every request of the current
//! one has resolved (response or timeout). The lookup ends once no unqueried
//! candidate is closer than the closest peer that answered.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::{BOOTSTRAP_ROUNDS, INITIAL_CONTACT_RECEIVE_TIMEOUT, MAX_LOOKUP_ROUNDS};
use crate::error::TaskError;
use crate::identity::{Contact, Distance, Identifier};
use crate::messages::{Header, Request, Response};

/// Stable handle of a task in the session's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

/// A request a task wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub addr: SocketAddr,
    /// Identifier the response must come from, when known.
    pub peer_id: Option<Identifier>,
    pub request: Request,
    /// Overrides the session's request timeout.
    pub timeout: Option<Duration>,
}

impl Query {
    pub fn to(contact: &Contact, request: Request) -> Self {
        Self {
            addr: contact.addr,
            peer_id: Some(contact.id),
            request,
            timeout: None,
        }
    }
}

/// Side effects a task asks the session to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// A peer learned from a response; goes through `insert_or_refresh`.
    Discovered(Contact),
    /// Outcome of a full-bucket liveness probe.
    ProbeSettled {
        oldest: Contact,
        candidate: Contact,
        alive: bool,
    },
    /// The bootstrap peer answered; the table is seeded.
    Joined,
    /// No bootstrap endpoint answered.
    BootstrapExhausted,
}

#[derive(Debug, Default)]
pub struct TaskStep {
    pub queries: Vec<Query>,
    pub events: Vec<TaskEvent>,
}

impl TaskStep {
    fn extend(&mut self, other: TaskStep) {
        self.queries.extend(other.queries);
        self.events.extend(other.events);
    }
}

/// Per-peer acknowledgement tally of a STORE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReport {
    pub acknowledged: usize,
    pub attempted: usize,
}

/// One-shot completion continuation. Detached replies drop their result.
#[derive(Debug)]
pub struct Reply<T>(Option<oneshot::Sender<T>>);

impl<T> Reply<T> {
    pub fn new(tx: oneshot::Sender<T>) -> Self {
        Self(Some(tx))
    }

    pub fn detached() -> Self {
        Self(None)
    }

    fn send(&mut self, value: T) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(value);
        }
    }
}

#[derive(Debug)]
pub enum LookupGoal {
    FindNode {
        reply: Reply<Result<Vec<Contact>, TaskError>>,
    },
    FindValue {
        reply: Reply<Result<Vec<u8>, TaskError>>,
    },
    Store {
        data: Vec<u8>,
        reply: Reply<Result<StoreReport, TaskError>>,
    },
}

impl LookupGoal {
    fn name(&self) -> &'static str {
        match self {
            LookupGoal::FindNode { .. } => "find_node",
            LookupGoal::FindValue { .. } => "find_value",
            LookupGoal::Store { .. } => "store",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    Seeding,
    Iterating,
    Storing,
    Found,
    Exhausted,
    Stored,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateStatus {
    Fresh,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    status: CandidateStatus,
}

#[derive(Debug)]
pub struct LookupTask {
    local_id: Identifier,
    target: Identifier,
    k: usize,
    alpha: usize,
    goal: LookupGoal,
    state: LookupState,
    /// Ordered by ascending distance to `target`.
    candidates: Vec<Candidate>,
    queried: HashSet<Identifier>,
    in_flight: usize,
    round: usize,
    store_acks: usize,
    store_attempted: usize,
    finished: bool,
}

impl LookupTask {
    pub fn new(local_id: Identifier, target: Identifier, k: usize, alpha: usize, goal: LookupGoal) -> Self {
        Self {
            local_id,
            target,
            k: k.max(1),
            alpha: alpha.max(1),
            goal,
            state: LookupState::Seeding,
            candidates: Vec::new(),
            queried: HashSet::new(),
            in_flight: 0,
            round: 0,
            store_acks: 0,
            store_attempted: 0,
            finished: false,
        }
    }

    pub fn target(&self) -> &Identifier {
        &self.target
    }

    pub fn state(&self) -> LookupState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Requests currently awaiting resolution.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Seed the candidate set and issue the first round.
    pub fn start(&mut self, seeds: Vec<Contact>) -> TaskStep {
        if self.state != LookupState::Seeding {
            return TaskStep::default();
        }
        self.merge(seeds);
        if self.candidates.is_empty() {
            debug!(goal = self.goal.name(), target = %self.target, "lookup has no contacts to seed from");
            self.fail(LookupState::Exhausted, TaskError::NoContacts);
            return TaskStep::default();
        }
        self.state = LookupState::Iterating;
        self.next_round()
    }

    pub fn on_response(&mut self, peer_id: Option<Identifier>, header: &Header, body: &[u8]) -> TaskStep {
        if self.finished {
            return TaskStep::default();
        }
        match self.state {
            LookupState::Iterating => self.on_lookup_response(peer_id.unwrap_or(header.sender_id), header, body),
            LookupState::Storing => {
                match Response::decode(header.message_type, body) {
                    Ok(Response::Store) => self.store_acks += 1,
                    Ok(other) => trace!(response = ?other.message_type(), "unexpected reply to store"),
                    Err(e) => debug!(error = %e, "dropping malformed store acknowledgement"),
                }
                self.on_store_resolved()
            }
            _ => TaskStep::default(),
        }
    }

    pub fn on_timeout(&mut self, peer_id: Option<Identifier>) -> TaskStep {
        if self.finished {
            return TaskStep::default();
        }
        match self.state {
            LookupState::Iterating => {
                if let Some(id) = peer_id {
                    self.settle(&id, CandidateStatus::Failed);
                }
                self.on_lookup_resolved()
            }
            LookupState::Storing => self.on_store_resolved(),
            _ => TaskStep::default(),
        }
    }

    pub fn abort(&mut self) {
        if !self.finished {
            self.fail(LookupState::Aborted, TaskError::Aborted);
        }
    }

    fn on_lookup_response(&mut self, peer: Identifier, header: &Header, body: &[u8]) -> TaskStep {
        let mut step = TaskStep::default();
        match Response::decode(header.message_type, body) {
            Ok(Response::FindNode { peers }) => {
                if !self.settle(&peer, CandidateStatus::Responded) {
                    return step;
                }
                step.events = self.merge(peers).into_iter().map(TaskEvent::Discovered).collect();
            }
            Ok(Response::FindValue { data }) if matches!(self.goal, LookupGoal::FindValue { .. }) => {
                self.settle(&peer, CandidateStatus::Responded);
                debug!(target = %self.target, round = self.round, "value found");
                if let LookupGoal::FindValue { reply } = &mut self.goal {
                    reply.send(Ok(data));
                }
                self.state = LookupState::Found;
                self.finished = true;
                return step;
            }
            Ok(other) => {
                debug!(response = ?other.message_type(), "dropping unexpected lookup response");
                self.settle(&peer, CandidateStatus::Failed);
            }
            Err(e) => {
                debug!(error = %e, "dropping malformed lookup response");
                self.settle(&peer, CandidateStatus::Failed);
            }
        }
        step.extend(self.on_lookup_resolved());
        step
    }

    /// Mark an in-flight candidate resolved. Returns false if `id` was not
    /// awaiting a response in this round.
    fn settle(&mut self, id: &Identifier, status: CandidateStatus) -> bool {
        let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.contact.id == *id && c.status == CandidateStatus::InFlight)
        else {
            return false;
        };
        candidate.status = status;
        true
    }

    fn on_lookup_resolved(&mut self) -> TaskStep {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight > 0 {
            return TaskStep::default();
        }
        self.end_round()
    }

    /// Add new peers to the candidate set, keeping it sorted. Returns the
    /// peers that were not known to this task before.
    fn merge(&mut self, peers: Vec<Contact>) -> Vec<Contact> {
        let mut added = Vec::new();
        for peer in peers {
            if peer.id == self.local_id
                || self.queried.contains(&peer.id)
                || self.candidates.iter().any(|c| c.contact.id == peer.id)
            {
                continue;
            }
            let distance = peer.id.xor_distance(&self.target);
            let pos = self.candidates.partition_point(|c| c.distance < distance);
            self.candidates.insert(
                pos,
                Candidate {
                    contact: peer,
                    distance,
                    status: CandidateStatus::Fresh,
                },
            );
            added.push(peer);
        }
        added
    }

    fn closest_with(&self, status: CandidateStatus) -> Option<Distance> {
        self.candidates
            .iter()
            .find(|c| c.status == status)
            .map(|c| c.distance)
    }

    fn next_round(&mut self) -> TaskStep {
        self.round += 1;

        let request = match &self.goal {
            LookupGoal::FindValue { .. } => Request::FindValue { key: self.target },
            _ => Request::FindNode { target: self.target },
        };

        let mut step = TaskStep::default();
        for candidate in self
            .candidates
            .iter_mut()
            .filter(|c| c.status == CandidateStatus::Fresh)
            .take(self.alpha)
        {
            candidate.status = CandidateStatus::InFlight;
            self.queried.insert(candidate.contact.id);
            step.queries.push(Query::to(&candidate.contact, request.clone()));
        }
        self.in_flight = step.queries.len();

        trace!(
            goal = self.goal.name(),
            target = %self.target,
            round = self.round,
            queries = self.in_flight,
            "lookup round started"
        );

        if step.queries.is_empty() {
            return self.converge();
        }
        step
    }

    fn end_round(&mut self) -> TaskStep {
        self.candidates.retain(|c| c.status != CandidateStatus::Failed);
        self.candidates.truncate(self.k);

        // Peers that timed out no longer count as the best known.
        let closer_remains = match (
            self.closest_with(CandidateStatus::Fresh),
            self.closest_with(CandidateStatus::Responded),
        ) {
            (Some(fresh), Some(responded)) => fresh < responded,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if closer_remains && self.round < MAX_LOOKUP_ROUNDS {
            self.next_round()
        } else {
            self.converge()
        }
    }

    /// The closest contacts that answered, nearest first.
    fn verified(&self) -> Vec<Contact> {
        self.candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Responded)
            .map(|c| c.contact)
            .take(self.k)
            .collect()
    }

    fn converge(&mut self) -> TaskStep {
        let verified = self.verified();
        debug!(
            goal = self.goal.name(),
            target = %self.target,
            rounds = self.round,
            queried = self.queried.len(),
            found = verified.len(),
            "lookup converged"
        );

        if verified.is_empty() {
            self.fail(LookupState::Exhausted, TaskError::AllUnresponsive);
            return TaskStep::default();
        }

        match &mut self.goal {
            LookupGoal::FindNode { reply } => {
                reply.send(Ok(verified));
                self.state = LookupState::Exhausted;
                self.finished = true;
                TaskStep::default()
            }
            LookupGoal::FindValue { reply } => {
                reply.send(Err(TaskError::ValueNotFound));
                self.state = LookupState::Exhausted;
                self.finished = true;
                TaskStep::default()
            }
            LookupGoal::Store { data, .. } => {
                let request = Request::Store {
                    key: self.target,
                    data: std::mem::take(data),
                };
                let queries: Vec<Query> = verified.iter().map(|c| Query::to(c, request.clone())).collect();
                self.state = LookupState::Storing;
                self.store_attempted = queries.len();
                self.in_flight = queries.len();
                TaskStep {
                    queries,
                    events: Vec::new(),
                }
            }
        }
    }

    fn on_store_resolved(&mut self) -> TaskStep {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight > 0 {
            return TaskStep::default();
        }

        let report = StoreReport {
            acknowledged: self.store_acks,
            attempted: self.store_attempted,
        };
        debug!(
            target = %self.target,
            acknowledged = report.acknowledged,
            attempted = report.attempted,
            "store completed"
        );
        if report.acknowledged == 0 {
            self.fail(LookupState::Exhausted, TaskError::NoAcknowledgement);
        } else {
            if let LookupGoal::Store { reply, .. } = &mut self.goal {
                reply.send(Ok(report));
            }
            self.state = LookupState::Stored;
            self.finished = true;
        }
        TaskStep::default()
    }

    fn fail(&mut self, state: LookupState, error: TaskError) {
        match &mut self.goal {
            LookupGoal::FindNode { reply } => reply.send(Err(error)),
            LookupGoal::FindValue { reply } => reply.send(Err(error)),
            LookupGoal::Store { reply, .. } => reply.send(Err(error)),
        }
        self.state = state;
        self.finished = true;
    }
}

/// Pings a full bucket's least-recently-seen contact on behalf of a newcomer.
#[derive(Debug)]
pub struct ProbeTask {
    oldest: Contact,
    candidate: Contact,
    finished: bool,
}

impl ProbeTask {
    pub fn new(oldest: Contact, candidate: Contact) -> Self {
        Self {
            oldest,
            candidate,
            finished: false,
        }
    }

    pub fn start(&self) -> TaskStep {
        TaskStep {
            queries: vec![Query::to(&self.oldest, Request::Ping)],
            events: Vec::new(),
        }
    }

    fn settle(&mut self, alive: bool) -> TaskStep {
        if self.finished {
            return TaskStep::default();
        }
        self.finished = true;
        TaskStep {
            queries: Vec::new(),
            events: vec![TaskEvent::ProbeSettled {
                oldest: self.oldest,
                candidate: self.candidate,
                alive,
            }],
        }
    }
}

/// Initial contact with the network.
///
/// Sends FIND_NODE(local id) to each resolved bootstrap address in turn,
/// waiting `INITIAL_CONTACT_RECEIVE_TIMEOUT` for an answer. After a full pass
/// without one, the wait doubles and the list is tried again, up to
/// `BOOTSTRAP_ROUNDS` passes.
#[derive(Debug)]
pub struct BootstrapTask {
    local_id: Identifier,
    endpoints: Vec<SocketAddr>,
    next: usize,
    pass: u32,
    timeout: Duration,
    finished: bool,
}

impl BootstrapTask {
    pub fn new(local_id: Identifier, endpoints: Vec<SocketAddr>) -> Self {
        Self {
            local_id,
            endpoints,
            next: 0,
            pass: 0,
            timeout: INITIAL_CONTACT_RECEIVE_TIMEOUT,
            finished: false,
        }
    }

    pub fn start(&mut self) -> TaskStep {
        if self.endpoints.is_empty() {
            self.finished = true;
            return TaskStep {
                queries: Vec::new(),
                events: vec![TaskEvent::BootstrapExhausted],
            };
        }
        self.attempt()
    }

    fn attempt(&self) -> TaskStep {
        let addr = self.endpoints[self.next];
        debug!(peer = %addr, pass = self.pass + 1, timeout_ms = self.timeout.as_millis() as u64, "contacting initial peer");
        TaskStep {
            queries: vec![Query {
                addr,
                peer_id: None,
                request: Request::FindNode { target: self.local_id },
                timeout: Some(self.timeout),
            }],
            events: Vec::new(),
        }
    }

    fn on_response(&mut self, header: &Header, body: &[u8]) -> TaskStep {
        if self.finished {
            return TaskStep::default();
        }
        match Response::decode(header.message_type, body) {
            Ok(Response::FindNode { peers }) => {
                self.finished = true;
                let mut events: Vec<TaskEvent> = peers
                    .into_iter()
                    .filter(|p| p.id != self.local_id)
                    .map(TaskEvent::Discovered)
                    .collect();
                events.push(TaskEvent::Joined);
                TaskStep {
                    queries: Vec::new(),
                    events,
                }
            }
            _ => {
                debug!(sender = %header.sender_id, "initial peer sent an unusable answer");
                self.on_timeout()
            }
        }
    }

    fn on_timeout(&mut self) -> TaskStep {
        if self.finished {
            return TaskStep::default();
        }
        self.next += 1;
        if self.next == self.endpoints.len() {
            self.next = 0;
            self.pass += 1;
            self.timeout *= 2;
        }
        if self.pass >= BOOTSTRAP_ROUNDS {
            self.finished = true;
            return TaskStep {
                queries: Vec::new(),
                events: vec![TaskEvent::BootstrapExhausted],
            };
        }
        self.attempt()
    }
}

/// Single PING to an arbitrary address; answers with the responder's id.
#[derive(Debug)]
pub struct PingTask {
    addr: SocketAddr,
    reply: Reply<Result<Identifier, TaskError>>,
    finished: bool,
}

impl PingTask {
    pub fn new(addr: SocketAddr, reply: Reply<Result<Identifier, TaskError>>) -> Self {
        Self {
            addr,
            reply,
            finished: false,
        }
    }

    pub fn start(&self) -> TaskStep {
        TaskStep {
            queries: vec![Query {
                addr: self.addr,
                peer_id: None,
                request: Request::Ping,
                timeout: None,
            }],
            events: Vec::new(),
        }
    }

    fn finish(&mut self, result: Result<Identifier, TaskError>) -> TaskStep {
        if !self.finished {
            self.reply.send(result);
            self.finished = true;
        }
        TaskStep::default()
    }

    fn on_response(&mut self, header: &Header, body: &[u8]) -> TaskStep {
        match Response::decode(header.message_type, body) {
            Ok(Response::Ping) => self.finish(Ok(header.sender_id)),
            _ => self.finish(Err(TaskError::AllUnresponsive)),
        }
    }
}

#[derive(Debug)]
pub enum Task {
    Lookup(LookupTask),
    Probe(ProbeTask),
    Bootstrap(BootstrapTask),
    Ping(PingTask),
}

impl Task {
    pub fn is_finished(&self) -> bool {
        match self {
            Task::Lookup(t) => t.finished,
            Task::Probe(t) => t.finished,
            Task::Bootstrap(t) => t.finished,
            Task::Ping(t) => t.finished,
        }
    }

    pub fn on_response(&mut self, peer_id: Option<Identifier>, header: &Header, body: &[u8]) -> TaskStep {
        match self {
            Task::Lookup(t) => t.on_response(peer_id, header, body),
            Task::Probe(t) => t.settle(true),
            Task::Bootstrap(t) => t.on_response(header, body),
            Task::Ping(t) => t.on_response(header, body),
        }
    }

    pub fn on_timeout(&mut self, peer_id: Option<Identifier>) -> TaskStep {
        match self {
            Task::Lookup(t) => t.on_timeout(peer_id),
            Task::Probe(t) => t.settle(false),
            Task::Bootstrap(t) => t.on_timeout(),
            Task::Ping(t) => t.finish(Err(TaskError::AllUnresponsive)),
        }
    }

    /// Resolve the task's continuation as aborted. Performs no I/O.
    pub fn abort(&mut self) {
        match self {
            Task::Lookup(t) => t.abort(),
            Task::Probe(t) => t.finished = true,
            Task::Bootstrap(t) => t.finished = true,
            Task::Ping(t) => {
                t.finish(Err(TaskError::Aborted));
            }
        }
    }
}
