use thiserror::Error;

/// Errors surfaced internally by the shared segment, ring buffer, and wire
/// codec. Producer-facing API calls (C5) never propagate these to caller
/// code — see [`crate::producer`] — but every fallible step still returns
/// `Result<_, HopError>` so the internal plumbing stays explicit.
#[derive(Debug, Error)]
pub enum HopError {
    #[error("permission denied creating or attaching shared segment")]
    PermissionDenied,

    #[error("no producer has created the shared segment")]
    NotConnected,

    #[error("client version {found} incompatible with segment version {expected}")]
    InvalidVersion { expected: f32, found: f32 },

    #[error("ring buffer has no room for this reservation")]
    RingFull,

    #[error("message of {len} bytes exceeds ring capacity {capacity}")]
    MessageTooLarge { len: usize, capacity: usize },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("unknown connection error")]
    UnknownConnectionError,
}
