use thiserror::Error;

/// Consumer-side errors (§7). Parsing errors are quarantined per message —
/// the intake loop logs and resumes at the next header rather than
/// propagating — but the type still models every outcome explicitly.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("no producer has created the shared segment")]
    NotConnected,

    #[error("permission denied attaching to the shared segment")]
    PermissionDenied,

    #[error("client version {found} incompatible with segment version {expected}")]
    InvalidVersion { expected: f32, found: f32 },

    #[error("malformed message header")]
    MalformedHeader,

    #[error("truncated payload: expected {expected} bytes, got {got}")]
    TruncatedPayload { expected: usize, got: usize },

    #[error("trace index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("unknown thread index {0}")]
    UnknownThread(u32),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("unknown connection error")]
    UnknownConnectionError,
}

impl From<hop::error::HopError> for IntakeError {
    /// Maps a failed [`hop::segment::Segment::attach`] onto the matching
    /// consumer-facing variant; anything below `attach`'s own surface
    /// (e.g. `RingFull`, which an attach can never produce) collapses to
    /// `UnknownConnectionError` rather than panicking on a pattern that
    /// should be unreachable here.
    fn from(err: hop::error::HopError) -> Self {
        use hop::error::HopError;
        match err {
            HopError::NotConnected => IntakeError::NotConnected,
            HopError::PermissionDenied => IntakeError::PermissionDenied,
            HopError::InvalidVersion { expected, found } => IntakeError::InvalidVersion { expected, found },
            HopError::Io(e) => IntakeError::Io(e),
            HopError::RingFull | HopError::MessageTooLarge { .. } | HopError::UnknownConnectionError => {
                IntakeError::UnknownConnectionError
            }
        }
    }
}
