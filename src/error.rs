//! Error taxonomy.
//!
//! | Class | Type | Surfaced to |
//! |-------|------|-------------|
//! | Per-request (timeout, malformed reply) | absorbed by tasks | nobody, unless a task runs out of candidates |
//! | Task outcome | [`TaskError`] | the caller of `save` / `load` / `find_node` |
//! | Structural defect | [`DispatchError`] | `Session::run`, which stops |
//! | Boundary / session-fatal | [`SessionError`] | `Session::bind`, `Session::run`, handle calls |
//! | Wire decoding | [`WireError`] | nobody: the datagram is dropped |

use std::net::SocketAddr;

use thiserror::Error;

use crate::dispatcher::RequestId;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport failure: {0}")]
    Transport(std::io::Error),

    #[error("cannot resolve endpoint {0}")]
    UnresolvableEndpoint(String),

    #[error("no local subnet can reach {0}")]
    AddressFamilyMismatch(SocketAddr),

    #[error("no listen address configured")]
    NoListenAddress,

    #[error("initial peer failed to respond")]
    InitialPeerFailedToRespond,

    #[error("value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("cannot encode message: {0}")]
    Encode(#[from] WireError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("session aborted")]
    Aborted,

    #[error("session is not running")]
    Closed,
}

/// Terminal failure of a single task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("routing table is empty")]
    NoContacts,

    #[error("no candidate answered")]
    AllUnresponsive,

    #[error("value not found")]
    ValueNotFound,

    #[error("no peer acknowledged the store")]
    NoAcknowledgement,

    #[error("task aborted")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("request id {0} is already awaiting a response")]
    DuplicateRequest(RequestId),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unexpected body for {0:?}")]
    UnexpectedBody(crate::messages::MessageType),

    #[error("{0} peers exceed the per-response limit")]
    TooManyPeers(usize),
}
