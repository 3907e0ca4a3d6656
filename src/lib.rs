//! # kadnode - Kademlia DHT Session Node
//!
//! A single-threaded Kademlia node over UDP: 160-bit identifiers, XOR-metric
//! k-bucket routing, correlated request/response messaging and iterative
//! FIND_NODE / FIND_VALUE / STORE lookups.
//!
//! ## Architecture
//!
//! One [`Session`] actor owns all node state and is the only component that
//! performs I/O. Everything it drives is a plain state machine:
//!
//! - the [`timer::Timer`] orders deadlines behind a single armed wake-up
//! - the [`routing::RoutingTable`] keeps contacts per XOR-distance bucket
//! - the [`dispatcher::ResponseDispatcher`] matches responses to their request
//! - tasks run lookups round by round and emit the requests to send
//!
//! Callers talk to the session through a cloneable [`SessionHandle`].
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | Identifiers, XOR distance, contacts |
//! | `timer` | Deadline-ordered expirations with one armed wake-up |
//! | `routing` | k-bucket routing table and full-bucket probing |
//! | `dispatcher` | request-id correlation with per-request timeouts |
//! | `task` | lookup, probe, ping and bootstrap state machines |
//! | `session` | event loop, inline request handlers, public handle |
//! | `messages` | wire header and bodies |
//! | `transport` | datagram socket seam, one subnet per address family |
//! | `storage` | bounded local value store |
//! | `config` | session configuration and protocol constants |
//! | `error` | error types |

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod messages;
pub mod routing;
mod session;
pub mod storage;
pub mod task;
pub mod timer;
pub mod transport;

pub use config::SessionConfig;
pub use error::{DispatchError, SessionError, TaskError, WireError};
pub use identity::{Contact, Identifier};
pub use session::{Session, SessionHandle};
pub use task::{StoreReport, TaskId};
