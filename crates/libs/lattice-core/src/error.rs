//! Error taxonomy for the mesh engine.
//!
//! Internal protocol errors are handled locally and never crash the node;
//! only `queue`, `flush`, and configuration setters surface errors to the
//! caller.

/// Link-level failures. Recovery: the registry drops the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("link closed")]
    Closed,

    #[error("frame could not be decoded")]
    Decode,

    #[error("frame exceeds the maximum length")]
    Oversize,

    #[error("connection refused")]
    Refused,
}

/// Routing failures. Recovery: silent drop, debug log only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no neighbor subtree contains the destination")]
    NoRoute,

    #[error("link advertises a subtree containing the local node")]
    LoopDetected,

    #[error("received a packet this node originated")]
    SelfEcho,
}

/// Per-frame protocol failures. The frame is discarded; the link survives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("no handler registered for packet type {0}")]
    UnknownType(u16),

    #[error("bad envelope field: {0}")]
    BadField(String),
}

/// Bridge election failures. Recovery: return to Idle; the next trigger may
/// retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElectionError {
    #[error("node is not eligible to start an election")]
    NotEligible,

    #[error("configured router is not visible")]
    RouterNotVisible,

    #[error("own role changed too recently")]
    RateLimited,
}

/// Message queue failures, surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is saturated with critical messages")]
    Saturated,

    #[error("message queue is not enabled")]
    NotEnabled,

    #[error("no such queued message")]
    NotFound,
}

/// Configuration setter failures. Prior state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for `{0}`")]
    InvalidValue(&'static str),

    #[error("setting is not supported on this build")]
    NotSupported,
}
