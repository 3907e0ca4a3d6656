//! Session configuration and protocol tuning constants.

use std::net::SocketAddr;
use std::time::Duration;

use crate::identity::Identifier;

/// Default Kademlia bucket size / replication factor.
pub const DEFAULT_K: usize = 20;

/// Largest accepted bucket size; `alpha` is bounded by `k`.
pub const MAX_K: usize = 256;

/// Default lookup concurrency (requests in flight per task round).
pub const DEFAULT_ALPHA: usize = 3;

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 27980;

/// Per-request wait before a correlated request is declared timed out.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Wait for the bootstrap peer's answer on the first attempt round.
pub const INITIAL_CONTACT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Full passes over the resolved bootstrap endpoints before giving up.
/// The per-attempt timeout doubles after each pass.
pub const BOOTSTRAP_ROUNDS: u32 = 3;

/// Consecutive failed requests after which a contact leaves the routing table.
pub const MAX_CONTACT_FAILURES: u8 = 3;

/// Upper bound on rounds in a single lookup.
pub const MAX_LOOKUP_ROUNDS: usize = 20;

/// Interval between stale-bucket refresh sweeps.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Default lifetime of a value stored on behalf of a peer.
pub const DEFAULT_VALUE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of values the local store keeps.
pub const DEFAULT_STORE_CAPACITY: usize = 10_000;

/// Largest value accepted for storage.
pub const MAX_VALUE_SIZE: usize = 32 * 1024;

/// Largest datagram read from or written to a socket.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Depth of the handle → session command queue.
pub const COMMAND_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed node identifier; a random one is drawn when `None`.
    pub local_id: Option<Identifier>,
    /// One socket is bound per address; at most one per address family is used.
    pub listen: Vec<SocketAddr>,
    /// `host:port` of a peer already in the network, or `None` for the first node.
    pub bootstrap: Option<String>,
    pub k: usize,
    pub alpha: usize,
    pub request_timeout: Duration,
    pub bucket_refresh_interval: Duration,
    pub value_ttl: Duration,
    pub store_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_id: None,
            listen: vec![SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))],
            bootstrap: None,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bucket_refresh_interval: BUCKET_REFRESH_INTERVAL,
            value_ttl: DEFAULT_VALUE_TTL,
            store_capacity: DEFAULT_STORE_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn with_listen(mut self, listen: Vec<SocketAddr>) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: impl Into<String>) -> Self {
        self.bootstrap = Some(bootstrap.into());
        self
    }

    pub fn with_local_id(mut self, id: Identifier) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Clamp `k` to `1..=MAX_K` and `alpha` to `1..=k`. Zero intervals fall
    /// back to their defaults.
    pub(crate) fn normalized(mut self) -> Self {
        self.k = self.k.clamp(1, MAX_K);
        self.alpha = self.alpha.clamp(1, self.k);
        if self.bucket_refresh_interval.is_zero() {
            self.bucket_refresh_interval = BUCKET_REFRESH_INTERVAL;
        }
        if self.request_timeout.is_zero() {
            self.request_timeout = DEFAULT_REQUEST_TIMEOUT;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_bounds_sizes_and_intervals() {
        let config = SessionConfig {
            k: usize::MAX,
            alpha: usize::MAX,
            bucket_refresh_interval: Duration::ZERO,
            request_timeout: Duration::ZERO,
            ..SessionConfig::default()
        }
        .normalized();
        assert_eq!(config.k, MAX_K);
        assert_eq!(config.alpha, MAX_K);
        assert_eq!(config.bucket_refresh_interval, BUCKET_REFRESH_INTERVAL);
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);

        let config = SessionConfig {
            k: 0,
            alpha: 0,
            ..SessionConfig::default()
        }
        .normalized();
        assert_eq!((config.k, config.alpha), (1, 1));
    }
}
