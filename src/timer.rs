//! # Deadline Timer
//!
//! Keeps any number of pending expirations ordered by absolute deadline and
//! hands them back, earliest first, once they are due.
//!
//! The timer never sleeps by itself. Its owner holds exactly one wake-up with
//! the runtime (a single `tokio::time::Sleep`) and asks [`Timer::rearm`] after
//! every mutation whether that wake-up has to move. `rearm` only reports a
//! deadline when the earliest pending deadline differs from the armed one, so
//! the owner cancels and re-arms its single sleep instead of stacking new ones.
//!
//! ```ignore
//! let sleep = tokio::time::sleep_until(far_future());
//! tokio::pin!(sleep);
//! loop {
//!     if let Some(deadline) = timer.rearm() {
//!         sleep.as_mut().reset(deadline);
//!     }
//!     tokio::select! {
//!         _ = &mut sleep, if timer.armed().is_some() => {
//!             for payload in timer.expire(Instant::now()) { /* fire */ }
//!         }
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Withdrawal token for a scheduled entry. Inert once the entry fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    deadline: Instant,
    seq: u64,
}

impl TimerHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug)]
pub struct Timer<T> {
    // (deadline, registration sequence) keeps ties in registration order.
    entries: BTreeMap<(Instant, u64), T>,
    next_seq: u64,
    armed: Option<Instant>,
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
            armed: None,
        }
    }

    /// Schedule `payload` to expire `timeout` from now.
    pub fn schedule(&mut self, timeout: Duration, payload: T) -> TimerHandle {
        self.schedule_at(Instant::now() + timeout, payload)
    }

    pub fn schedule_at(&mut self, deadline: Instant, payload: T) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), payload);
        TimerHandle { deadline, seq }
    }

    /// Withdraw an entry before it fires. Returns `None` if it already fired
    /// or was already cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        self.entries.remove(&(handle.deadline, handle.seq))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Deadline of the wake-up the owner currently holds, if any.
    pub fn armed(&self) -> Option<Instant> {
        self.armed
    }

    /// Move the single wake-up to the earliest pending deadline.
    ///
    /// Returns the deadline to arm when it changed since the last call, and
    /// `None` when the current wake-up is still correct (or nothing is
    /// pending, in which case [`Timer::armed`] becomes `None`).
    pub fn rearm(&mut self) -> Option<Instant> {
        let next = self.next_deadline();
        if next == self.armed {
            return None;
        }
        self.armed = next;
        next
    }

    /// Remove and return every entry whose deadline is at or before `now`,
    /// in ascending deadline order. Consumes the armed wake-up.
    pub fn expire(&mut self, now: Instant) -> Vec<T> {
        self.armed = None;
        let mut fired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            fired.push(entry.remove());
        }
        fired
    }

    /// Remove every pending entry without firing the wake-up.
    pub fn drain(&mut self) -> Vec<T> {
        self.armed = None;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
