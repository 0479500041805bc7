//! Error types surfaced by the registry and the push transport.

use crate::id::ServerId;

/// Errors returned by registry lookups and mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The id is not enlisted, or its generation does not match the slot.
    #[error("unknown server {0}")]
    UnknownServer(ServerId),

    /// Index-based lookup past the end of the table.
    #[error("index {index} beyond table length {len}")]
    IndexOutOfRange { index: u32, len: usize },
}

/// Failure modes of a membership push RPC.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The target reported it is no longer up; this races with crash/remove
    /// and the dispatcher treats it as "no progress".
    #[error("target server is not up")]
    ServerNotUp,

    /// Any other transport-level failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}
