//! Error kinds for the routing core.
//!
//! Parse and verification failures are local: the offending datagram is
//! logged and dropped without disturbing peers or the application.
//! Forwarding-send failures are logged per target and never retried; the
//! overlay assumes redundancy through swarm mode. Application-facing
//! operations report errors through their completion future. No error,
//! local or remote, terminates the process.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoutingError>;

#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown message tag: {0}")]
    UnknownTag(u8),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("no bootstrap peer could be reached")]
    NoBootstrapPeer,

    #[error("transport closed")]
    TransportClosed,

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("routing table full")]
    TableFull,

    #[error("duplicate message")]
    Duplicate,

    #[error("cannot derive an authority for this message")]
    InvalidAuthority,

    #[error("request refused: {0}")]
    Refused(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

impl From<bincode::Error> for RoutingError {
    fn from(err: bincode::Error) -> Self {
        RoutingError::MalformedMessage(err.to_string())
    }
}
