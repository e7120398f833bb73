//! # Engine Error Kinds
//!
//! This module defines the error taxonomy used at every engine boundary.
//! Each variant corresponds to a distinct failure condition a caller can
//! act on, so back-pressure (quota, pool exhaustion) is distinguishable
//! from corruption (malformed commands) and from lifecycle races
//! (disconnected peers, shut-down containers).
//!
//! ## Propagation Policy
//!
//! - Unicast failures propagate to the sender.
//! - Per-receiver failures during broadcast fan-out and eavesdropping are
//!   swallowed (logged at debug level, never surfaced).
//! - Notification enqueue failures are logged but never propagate.
//! - Policy denial at a custom endpoint is rewritten to [`Error::NotFound`]
//!   so the existence of a name is not leaked.

use thiserror::Error;

/// Convenience alias used by every fallible engine API.
pub type Result<T> = std::result::Result<T, Error>;

/// Which per-user or per-connection quota was exhausted.
///
/// Surfaced inside [`Error::QuotaExceeded`] so callers can tell transient
/// back-pressure apart from misconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// Total messages queued on one connection reached the bus limit.
    Messages,
    /// Messages queued on one connection from a single sending uid.
    MessagesPerUser,
    /// Outbound requests awaiting a reply on one connection.
    RequestsPending,
    /// Connections created by one uid on the domain.
    Connections,
    /// Buses created by one uid on the domain.
    Buses,
}

impl std::fmt::Display for Quota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Quota::Messages => "messages",
            Quota::MessagesPerUser => "messages-per-user",
            Quota::RequestsPending => "requests-pending",
            Quota::Connections => "connections",
            Quota::Buses => "buses",
        };
        f.write_str(name)
    }
}

/// Errors reported at the engine boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed fields, missing required items, duplicates, bad alignment.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A message is structurally broken where an item is required.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// Name or connection absent. Also the masquerade for policy denial
    /// at a custom endpoint.
    #[error("no such name or connection")]
    NotFound,

    /// Policy denial at a default endpoint or the bus database.
    #[error("permission denied by policy")]
    PermissionDenied,

    /// Duplicate bus, endpoint or name where exclusive creation was requested.
    #[error("already exists")]
    AlreadyExists,

    /// ByeBye while the receive queue is non-empty.
    #[error("receive queue not empty")]
    Busy,

    /// Receive on an empty queue, or a priority floor no entry meets.
    #[error("queue is empty")]
    Empty,

    /// A destination id was supplied together with a name, but the name is
    /// currently owned by a different connection.
    #[error("destination id does not match current name owner")]
    IdMismatch,

    /// The destination name is held by an activator and the message asked
    /// not to auto-start an implementor.
    #[error("name is held by an activator")]
    AddressNotAvailable,

    /// The receiver does not accept transferable file handles.
    #[error("destination refuses file handles")]
    HandlesRefused,

    /// The receiver's pool has no free range large enough.
    #[error("receiver pool out of space")]
    OutOfSpace,

    /// A per-connection or per-user quota was reached.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(Quota),

    /// The destination connection is no longer active.
    #[error("destination connection reset")]
    ConnectionReset,

    /// The peer of a synchronous wait died before replying.
    #[error("peer disconnected before replying")]
    BrokenPipe,

    /// The deadline of a synchronous reply wait expired.
    #[error("reply deadline expired")]
    TimedOut,

    /// The operation was cancelled explicitly or by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// A synchronous wait was interrupted externally; the reply tracker is
    /// preserved so a restarted call with the same cookie can resume it.
    #[error("interrupted")]
    Interrupted,

    /// Redundant ByeBye on an already-disconnected connection.
    #[error("connection already disconnected")]
    AlreadyDone,

    /// An operation was attempted on a disconnected container.
    #[error("container is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Quota variants render distinct, stable labels.
    #[test]
    fn quota_display_is_stable() {
        assert_eq!(Quota::MessagesPerUser.to_string(), "messages-per-user");
        assert_eq!(
            Error::QuotaExceeded(Quota::Buses).to_string(),
            "quota exceeded: buses"
        );
    }
}
