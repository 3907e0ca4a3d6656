//! # Session
//!
//! The event loop that owns every piece of node state: subnets, routing
//! table, response dispatcher, local store and the task arena. It is the only
//! place that performs I/O.
//!
//! ```text
//!  SessionHandle ──Command──┐
//!  reader tasks ──Inbound───┼──► select! ──► requests: answered inline
//!  dispatcher wake-up ──────┤              ► responses: dispatcher → task
//!  maintenance interval ────┘              ► task steps: send / route
//! ```
//!
//! A [`SessionHandle`] is cheap to clone and may be used from any task; each
//! call is a command on an mpsc channel answered through a oneshot.
//!
//! Every exit path of [`Session::run`] resolves all outstanding requests and
//! live tasks as aborted before returning.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{COMMAND_CHANNEL_SIZE, MAX_VALUE_SIZE, SessionConfig};
use crate::dispatcher::{Outcome, PendingRequest, RequestId, Resolution, ResponseDispatcher};
use crate::error::{SessionError, TaskError};
use crate::identity::{Contact, Identifier};
use crate::messages::{Header, MAX_PEERS_PER_RESPONSE, Request, Response, decode_header};
use crate::routing::{InsertOutcome, RoutingTable};
use crate::storage::LocalStore;
use crate::task::{
    BootstrapTask, LookupGoal, LookupTask, PingTask, ProbeTask, Query, Reply, StoreReport, Task, TaskEvent,
    TaskId, TaskStep,
};
use crate::transport::{Inbound, Subnets, spawn_reader};

/// Far enough that an idle wake-up never fires.
const IDLE_WAKEUP: Duration = Duration::from_secs(24 * 60 * 60);

type Work = VecDeque<(TaskId, TaskStep)>;

enum Command {
    Save {
        key: Identifier,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<StoreReport, TaskError>>,
    },
    Load {
        key: Identifier,
        reply: oneshot::Sender<Result<Vec<u8>, TaskError>>,
    },
    FindNode {
        target: Identifier,
        reply: oneshot::Sender<Result<Vec<Contact>, TaskError>>,
    },
    Ping {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<Identifier, TaskError>>,
    },
    PeerCount(oneshot::Sender<usize>),
}

/// Client side of a running [`Session`].
#[derive(Clone, Debug)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    abort: Arc<Notify>,
    local_id: Identifier,
    local_addrs: Vec<SocketAddr>,
}

impl SessionHandle {
    pub fn local_id(&self) -> Identifier {
        self.local_id
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Store `data` under `key` on the `k` nodes closest to the key's identifier.
    pub async fn save(&self, key: &[u8], data: Vec<u8>) -> Result<StoreReport, SessionError> {
        if data.len() > MAX_VALUE_SIZE {
            return Err(SessionError::ValueTooLarge {
                size: data.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        let (reply, rx) = oneshot::channel();
        self.send(Command::Save {
            key: Identifier::from_key(key),
            data,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn load(&self, key: &[u8]) -> Result<Vec<u8>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Load {
            key: Identifier::from_key(key),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// The closest live contacts to `target`, nearest first.
    pub async fn find_node(&self, target: Identifier) -> Result<Vec<Contact>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FindNode { target, reply }).await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Ping `addr` and return the identifier of whoever answered.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Identifier, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Ping { addr, reply }).await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn peer_count(&self) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PeerCount(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Ask the session loop to stop. `run` then returns [`SessionError::Aborted`].
    pub fn abort(&self) {
        self.abort.notify_one();
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.cmd_tx.send(command).await.map_err(|_| SessionError::Closed)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Save { key, data, .. } => write!(f, "Save({key}, {} bytes)", data.len()),
            Command::Load { key, .. } => write!(f, "Load({key})"),
            Command::FindNode { target, .. } => write!(f, "FindNode({target})"),
            Command::Ping { addr, .. } => write!(f, "Ping({addr})"),
            Command::PeerCount(_) => f.write_str("PeerCount"),
        }
    }
}

pub struct Session {
    local_id: Identifier,
    config: SessionConfig,
    subnets: Subnets,
    routing: RoutingTable,
    dispatcher: ResponseDispatcher,
    store: LocalStore,
    tasks: HashMap<TaskId, Task>,
    next_task: u64,
    /// Oldest contacts with a liveness probe in flight.
    probing: HashSet<Identifier>,
    bootstrap: Option<Vec<SocketAddr>>,
    cmd_rx: mpsc::Receiver<Command>,
    handle: SessionHandle,
}

impl Session {
    /// Bind the listen sockets and resolve the bootstrap endpoint.
    pub async fn bind(config: SessionConfig) -> Result<Self, SessionError> {
        let config = config.normalized();
        let subnets = Subnets::bind(&config.listen).await?;
        let bootstrap = match &config.bootstrap {
            Some(endpoint) => Some(resolve_bootstrap(endpoint, &subnets).await?),
            None => None,
        };

        let local_id = config.local_id.unwrap_or_else(Identifier::random);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let handle = SessionHandle {
            cmd_tx,
            abort: Arc::new(Notify::new()),
            local_id,
            local_addrs: subnets.local_addrs(),
        };

        info!(
            id = %local_id,
            addrs = ?handle.local_addrs,
            bootstrap = ?config.bootstrap,
            "session bound"
        );

        Ok(Self {
            local_id,
            routing: RoutingTable::new(local_id, config.k),
            dispatcher: ResponseDispatcher::new(),
            store: LocalStore::new(config.store_capacity, config.value_ttl),
            tasks: HashMap::new(),
            next_task: 0,
            probing: HashSet::new(),
            bootstrap,
            subnets,
            config,
            cmd_rx,
            handle,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn local_id(&self) -> Identifier {
        self.local_id
    }

    /// Drive the loop until abort or a fatal failure.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let readers: Vec<_> = self
            .subnets
            .iter()
            .map(|subnet| spawn_reader(subnet.socket(), inbound_tx.clone()))
            .collect();
        drop(inbound_tx);

        let result = self.drive(&mut inbound_rx).await;

        for reader in readers {
            reader.abort();
        }
        self.shutdown();
        match &result {
            Err(SessionError::Aborted) => info!(id = %self.local_id, "session aborted"),
            Err(e) => error!(id = %self.local_id, error = %e, "session stopped"),
            Ok(()) => {}
        }
        result
    }

    async fn drive(&mut self, inbound: &mut mpsc::Receiver<Inbound>) -> Result<(), SessionError> {
        if let Some(endpoints) = self.bootstrap.take() {
            let mut task = BootstrapTask::new(self.local_id, endpoints);
            let step = task.start();
            let id = self.insert_task(Task::Bootstrap(task));
            self.apply(VecDeque::from([(id, step)])).await?;
        } else {
            info!(id = %self.local_id, "no bootstrap peer, starting a new network");
        }

        let abort = self.handle.abort.clone();
        let wakeup = tokio::time::sleep_until(Instant::now() + IDLE_WAKEUP);
        tokio::pin!(wakeup);
        let mut maintenance = tokio::time::interval(self.config.bucket_refresh_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        maintenance.tick().await;

        loop {
            if let Some(deadline) = self.dispatcher.rearm() {
                wakeup.as_mut().reset(deadline);
            }

            tokio::select! {
                _ = abort.notified() => return Err(SessionError::Aborted),
                received = inbound.recv() => match received {
                    Some(Inbound::Datagram { from, bytes }) => self.on_datagram(from, &bytes).await?,
                    Some(Inbound::Failed(e)) => return Err(SessionError::Transport(e)),
                    None => return Err(SessionError::Closed),
                },
                Some(command) = self.cmd_rx.recv() => self.on_command(command).await?,
                _ = &mut wakeup, if self.dispatcher.armed().is_some() => {
                    let mut work = Work::new();
                    for resolution in self.dispatcher.expire(Instant::now()) {
                        work.extend(self.resolve(resolution));
                    }
                    self.apply(work).await?;
                }
                _ = maintenance.tick() => self.maintain().await?,
            }

            self.tasks.retain(|_, task| !task.is_finished());
        }
    }

    async fn on_datagram(&mut self, from: SocketAddr, bytes: &[u8]) -> Result<(), SessionError> {
        let (header, body) = match decode_header(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(peer = %from, len = bytes.len(), error = %e, "dropping undecodable datagram");
                return Ok(());
            }
        };
        if header.sender_id == self.local_id {
            trace!(peer = %from, "dropping datagram carrying our own id");
            return Ok(());
        }

        if header.message_type.is_request() {
            return self.on_request(from, header, body).await;
        }

        match self.dispatcher.dispatch_message(&header, body) {
            Some(resolution) => {
                let work = self.resolve(resolution);
                self.apply(work).await
            }
            None => {
                trace!(peer = %from, request = %header.request_id, "discarding unmatched response");
                Ok(())
            }
        }
    }

    async fn on_request(&mut self, from: SocketAddr, header: Header, body: &[u8]) -> Result<(), SessionError> {
        let request = match Request::decode(header.message_type, body) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %from, error = %e, "dropping malformed request");
                return Ok(());
            }
        };

        let mut work = Work::new();
        work.extend(self.observe(Contact::new(header.sender_id, from)));

        let response = match request {
            Request::Ping => Some(Response::Ping),
            Request::Store { key, data } => {
                trace!(peer = %from, key = %key, size = data.len(), "store request");
                self.store
                    .store(key, data, header.sender_id)
                    .then_some(Response::Store)
            }
            Request::FindNode { target } => Some(Response::FindNode {
                peers: self.closest_peers(&target),
            }),
            Request::FindValue { key } => match self.store.get(&key) {
                Some(data) => Some(Response::FindValue { data }),
                None => Some(Response::FindNode {
                    peers: self.closest_peers(&key),
                }),
            },
        };

        if let Some(response) = response {
            let bytes = response.encode(self.local_id, header.request_id)?;
            if let Err(e) = self.subnets.send(from, &bytes).await {
                debug!(peer = %from, error = %e, "failed to send response");
            }
        }
        self.apply(work).await
    }

    fn closest_peers(&self, target: &Identifier) -> Vec<Contact> {
        self.routing
            .closest_to(target, self.config.k.min(MAX_PEERS_PER_RESPONSE))
    }

    async fn on_command(&mut self, command: Command) -> Result<(), SessionError> {
        trace!(command = ?command, "handle command");
        match command {
            Command::Save { key, data, reply } => {
                self.start_lookup(
                    key,
                    LookupGoal::Store {
                        data,
                        reply: Reply::new(reply),
                    },
                )
                .await
            }
            Command::Load { key, reply } => {
                if let Some(data) = self.store.get(&key) {
                    let _ = reply.send(Ok(data));
                    return Ok(());
                }
                self.start_lookup(key, LookupGoal::FindValue { reply: Reply::new(reply) })
                    .await
            }
            Command::FindNode { target, reply } => {
                self.start_lookup(target, LookupGoal::FindNode { reply: Reply::new(reply) })
                    .await
            }
            Command::Ping { addr, reply } => {
                let task = PingTask::new(addr, Reply::new(reply));
                let step = task.start();
                let id = self.insert_task(Task::Ping(task));
                self.apply(VecDeque::from([(id, step)])).await
            }
            Command::PeerCount(reply) => {
                let _ = reply.send(self.routing.peer_count());
                Ok(())
            }
        }
    }

    async fn start_lookup(&mut self, target: Identifier, goal: LookupGoal) -> Result<(), SessionError> {
        let mut task = LookupTask::new(self.local_id, target, self.config.k, self.config.alpha, goal);
        let step = task.start(self.routing.closest_to(&target, self.config.alpha));
        let id = self.insert_task(Task::Lookup(task));
        self.apply(VecDeque::from([(id, step)])).await
    }

    async fn maintain(&mut self) -> Result<(), SessionError> {
        let expired = self.store.expire();
        if expired > 0 {
            debug!(expired, "expired stored values");
        }

        let stale = self.routing.stale_bucket_indices(self.config.bucket_refresh_interval);
        if stale.is_empty() {
            return Ok(());
        }
        debug!(count = stale.len(), "refreshing stale routing buckets");
        for bucket in stale {
            let target = self.routing.random_id_for_bucket(bucket);
            self.routing.mark_bucket_refreshed(bucket);
            self.start_lookup(target, LookupGoal::FindNode { reply: Reply::detached() })
                .await?;
        }
        Ok(())
    }

    fn insert_task(&mut self, task: Task) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        self.tasks.insert(id, task);
        id
    }

    /// Feed a resolved request back into its task.
    fn resolve(&mut self, resolution: Resolution<'_>) -> Work {
        let Resolution {
            request_id,
            pending,
            outcome,
        } = resolution;
        let mut work = Work::new();

        match outcome {
            Outcome::Response { header, body } => {
                work.extend(self.observe(Contact::new(header.sender_id, pending.peer_addr)));
                if let Some(task) = self.tasks.get_mut(&pending.task) {
                    work.push_back((pending.task, task.on_response(pending.peer_id, &header, body)));
                }
            }
            Outcome::Timeout => {
                trace!(request = %request_id, peer = %pending.peer_addr, "request timed out");
                if let Some(id) = pending.peer_id {
                    if self.routing.record_failure(&id) {
                        debug!(peer = %id, "evicted unresponsive contact");
                    }
                }
                if let Some(task) = self.tasks.get_mut(&pending.task) {
                    work.push_back((pending.task, task.on_timeout(pending.peer_id)));
                }
            }
            Outcome::Aborted => {
                if let Some(task) = self.tasks.get_mut(&pending.task) {
                    task.abort();
                }
            }
        }
        work
    }

    /// Record a live contact. A full bucket starts a probe of its stalest member.
    fn observe(&mut self, contact: Contact) -> Option<(TaskId, TaskStep)> {
        if self.subnets.for_peer(&contact.addr).is_err() {
            trace!(peer = %contact, "ignoring contact of an unbound address family");
            return None;
        }
        match self.routing.insert_or_refresh(contact) {
            InsertOutcome::Inserted => {
                trace!(peer = %contact, "new contact");
                None
            }
            InsertOutcome::Refreshed | InsertOutcome::Ignored => None,
            InsertOutcome::Full { candidate, oldest } => {
                if !self.probing.insert(oldest.id) {
                    return None;
                }
                trace!(oldest = %oldest, candidate = %candidate, "bucket full, probing stalest contact");
                let task = ProbeTask::new(oldest, candidate);
                let step = task.start();
                Some((self.insert_task(Task::Probe(task)), step))
            }
        }
    }

    /// Carry out task steps: apply their events and send their queries.
    /// A query that cannot be sent resolves at once as a failed request; a
    /// correlation defect stops the session.
    async fn apply(&mut self, mut work: Work) -> Result<(), SessionError> {
        while let Some((task_id, step)) = work.pop_front() {
            for event in step.events {
                self.on_event(event, &mut work)?;
            }
            for query in step.queries {
                match self.send_query(task_id, &query).await {
                    Ok(()) => {}
                    Err(e @ SessionError::Dispatch(_)) => return Err(e),
                    Err(e) => {
                        debug!(peer = %query.addr, error = %e, "request not sent");
                        if let Some(task) = self.tasks.get_mut(&task_id) {
                            work.push_back((task_id, task.on_timeout(query.peer_id)));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn on_event(&mut self, event: TaskEvent, work: &mut Work) -> Result<(), SessionError> {
        match event {
            TaskEvent::Discovered(contact) => work.extend(self.observe(contact)),
            TaskEvent::ProbeSettled {
                oldest,
                candidate,
                alive,
            } => {
                self.probing.remove(&oldest.id);
                if !alive {
                    debug!(evicted = %oldest, replacement = %candidate, "stalest contact did not answer probe");
                }
                self.routing.apply_probe_result(&oldest, candidate, alive);
            }
            TaskEvent::Joined => {
                info!(id = %self.local_id, peers = self.routing.peer_count(), "joined network");
                let mut task = LookupTask::new(
                    self.local_id,
                    self.local_id,
                    self.config.k,
                    self.config.alpha,
                    LookupGoal::FindNode { reply: Reply::detached() },
                );
                let step = task.start(self.routing.closest_to(&self.local_id, self.config.alpha));
                work.push_back((self.insert_task(Task::Lookup(task)), step));
            }
            TaskEvent::BootstrapExhausted => {
                warn!(endpoint = ?self.config.bootstrap, "initial peer failed to respond");
                return Err(SessionError::InitialPeerFailedToRespond);
            }
        }
        Ok(())
    }

    async fn send_query(&mut self, task: TaskId, query: &Query) -> Result<(), SessionError> {
        let request_id = self.fresh_request_id();
        self.send_tagged(task, query, request_id).await
    }

    /// Register the association for `request_id`, then send. A send that
    /// fails withdraws the association again.
    async fn send_tagged(&mut self, task: TaskId, query: &Query, request_id: RequestId) -> Result<(), SessionError> {
        let bytes = query.request.encode(self.local_id, request_id)?;
        self.dispatcher.associate(
            request_id,
            PendingRequest {
                task,
                peer_addr: query.addr,
                peer_id: query.peer_id,
            },
            query.timeout.unwrap_or(self.config.request_timeout),
        )?;
        if let Err(e) = self.subnets.send(query.addr, &bytes).await {
            self.dispatcher.cancel(&request_id);
            return Err(e);
        }
        trace!(
            peer = %query.addr,
            request = %request_id,
            kind = ?query.request.message_type(),
            "request sent"
        );
        Ok(())
    }

    fn fresh_request_id(&self) -> RequestId {
        loop {
            let id = Identifier::random();
            if !self.dispatcher.contains(&id) {
                return id;
            }
        }
    }

    fn shutdown(&mut self) {
        for resolution in self.dispatcher.abort_all() {
            if let Some(task) = self.tasks.get_mut(&resolution.pending.task) {
                task.abort();
            }
        }
        for (_, mut task) in self.tasks.drain() {
            task.abort();
        }
        self.probing.clear();
        self.cmd_rx.close();
        while let Ok(command) = self.cmd_rx.try_recv() {
            match command {
                Command::Save { reply, .. } => {
                    let _ = reply.send(Err(TaskError::Aborted));
                }
                Command::Load { reply, .. } => {
                    let _ = reply.send(Err(TaskError::Aborted));
                }
                Command::FindNode { reply, .. } => {
                    let _ = reply.send(Err(TaskError::Aborted));
                }
                Command::Ping { reply, .. } => {
                    let _ = reply.send(Err(TaskError::Aborted));
                }
                Command::PeerCount(reply) => {
                    let _ = reply.send(self.routing.peer_count());
                }
            }
        }
    }
}

/// Resolve `endpoint` and keep the addresses some local subnet can reach.
async fn resolve_bootstrap(endpoint: &str, subnets: &Subnets) -> Result<Vec<SocketAddr>, SessionError> {
    let resolved: Vec<SocketAddr> = lookup_host(endpoint)
        .await
        .map_err(|_| SessionError::UnresolvableEndpoint(endpoint.to_string()))?
        .collect();
    let Some(first) = resolved.first().copied() else {
        return Err(SessionError::UnresolvableEndpoint(endpoint.to_string()));
    };

    let local = subnets.local_addrs();
    let reachable: Vec<SocketAddr> = resolved
        .into_iter()
        .filter(|addr| subnets.for_peer(addr).is_ok() && !local.contains(addr))
        .collect();
    if reachable.is_empty() {
        return Err(SessionError::AddressFamilyMismatch(first));
    }
    debug!(endpoint, resolved = ?reachable, "resolved bootstrap endpoint");
    Ok(reachable)
}
