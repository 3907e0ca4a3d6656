//! # Response Dispatcher
//!
//! Correlates inbound responses to the task that is waiting for them, by the
//! request id carried in the message header, and bounds every wait with a
//! [`Timer`] entry.
//!
//! Every association resolves exactly once: with the matching response, with
//! a timeout, or as aborted when the session shuts down. Whichever comes
//! first removes the association, so the other paths find nothing.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::DispatchError;
use crate::identity::Identifier;
use crate::messages::Header;
use crate::task::TaskId;
use crate::timer::{Timer, TimerHandle};

/// Correlation id carried in every message header.
pub type RequestId = Identifier;

/// What an outstanding request was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub task: TaskId,
    pub peer_addr: SocketAddr,
    /// Expected responder id; `None` while it is still unknown (bootstrap).
    pub peer_id: Option<Identifier>,
}

#[derive(Debug)]
pub enum Outcome<'a> {
    Response { header: Header, body: &'a [u8] },
    Timeout,
    Aborted,
}

#[derive(Debug)]
pub struct Resolution<'a> {
    pub request_id: RequestId,
    pub pending: PendingRequest,
    pub outcome: Outcome<'a>,
}

#[derive(Debug)]
struct Association {
    pending: PendingRequest,
    timer: TimerHandle,
}

#[derive(Debug, Default)]
pub struct ResponseDispatcher {
    associations: HashMap<RequestId, Association>,
    timer: Timer<RequestId>,
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register that `pending.task` awaits a response tagged `request_id`,
    /// failing it with a timeout if nothing arrives within `timeout`.
    pub fn associate(
        &mut self,
        request_id: RequestId,
        pending: PendingRequest,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        match self.associations.entry(request_id) {
            Entry::Occupied(_) => Err(DispatchError::DuplicateRequest(request_id)),
            Entry::Vacant(slot) => {
                let timer = self.timer.schedule(timeout, request_id);
                slot.insert(Association { pending, timer });
                Ok(())
            }
        }
    }

    /// Resolve the association matching `header.request_id`, if any.
    ///
    /// Late, spurious, or already timed-out responses return `None` and leave
    /// all state untouched. So does a response whose sender differs from the
    /// peer the request was sent to.
    pub fn dispatch_message<'a>(&mut self, header: &Header, body: &'a [u8]) -> Option<Resolution<'a>> {
        let association = self.associations.get(&header.request_id)?;
        if association
            .pending
            .peer_id
            .is_some_and(|expected| expected != header.sender_id)
        {
            trace!(
                request = %header.request_id,
                sender = %header.sender_id,
                "response sender does not match the queried peer"
            );
            return None;
        }

        let association = self.associations.remove(&header.request_id)?;
        self.timer.cancel(association.timer);
        Some(Resolution {
            request_id: header.request_id,
            pending: association.pending,
            outcome: Outcome::Response { header: *header, body },
        })
    }

    /// Drop the association for a request that never left the process.
    pub fn cancel(&mut self, request_id: &RequestId) -> Option<PendingRequest> {
        let association = self.associations.remove(request_id)?;
        self.timer.cancel(association.timer);
        Some(association.pending)
    }

    /// Time out every association whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Resolution<'static>> {
        self.timer
            .expire(now)
            .into_iter()
            .filter_map(|request_id| {
                let association = self.associations.remove(&request_id)?;
                Some(Resolution {
                    request_id,
                    pending: association.pending,
                    outcome: Outcome::Timeout,
                })
            })
            .collect()
    }

    /// Resolve every outstanding association as aborted.
    pub fn abort_all(&mut self) -> Vec<Resolution<'static>> {
        self.timer.drain();
        self.associations
            .drain()
            .map(|(request_id, association)| Resolution {
                request_id,
                pending: association.pending,
                outcome: Outcome::Aborted,
            })
            .collect()
    }

    /// See [`Timer::rearm`].
    pub fn rearm(&mut self) -> Option<Instant> {
        self.timer.rearm()
    }

    pub fn armed(&self) -> Option<Instant> {
        self.timer.armed()
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.associations.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }
}
