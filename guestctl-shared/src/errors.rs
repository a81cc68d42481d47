//! Error types for guest control.

use crate::constants::error_code;
use crate::protocol::codec::DecodeError;
use thiserror::Error;

/// Result alias used across the guest control crates.
pub type GuestCtlResult<T> = Result<T, GuestCtlError>;

/// Errors surfaced by the host service, the guest agent and the codec.
///
/// Only transport failures are local to the caller. Everything else that
/// happens inside the guest reaches the host as a status report and is turned
/// back into one of these variants by [`GuestCtlError::from_status_code`].
#[derive(Debug, Error)]
pub enum GuestCtlError {
    /// The channel is not connected or the client is gone.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// An explicit cancel request was observed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    /// Protocol bug or version skew.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A receive slot is smaller than the queued field; the message was not consumed.
    #[error("buffer too small: parameter {index} needs {needed} bytes")]
    BufferTooSmall { index: usize, needed: usize },

    /// The guest could not start the process (OS error code or protocol code).
    #[error("failed to spawn process (code {code:#x}): {message}")]
    Spawn { code: u32, message: String },

    #[error("input overflow: {0}")]
    Overflow(String),

    /// Input was sent after EOF or after the process terminated.
    #[error("input channel of process {0} is closed")]
    InputClosed(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Error code reported by the guest that has no closer mapping.
    #[error("guest reported error code {code:#x}")]
    Guest { code: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GuestCtlError {
    /// Code reported on the wire in the `flags` word of an error status.
    pub fn status_code(&self) -> u32 {
        match self {
            Self::Spawn { code, .. } | Self::Guest { code } => *code,
            Self::Io(e) => e
                .raw_os_error()
                .and_then(|c| u32::try_from(c).ok())
                .unwrap_or(error_code::INTERNAL),
            Self::Decode(_) | Self::BufferTooSmall { .. } | Self::Config(_) => {
                error_code::INVALID_PARAMETER
            }
            Self::Unsupported(_) => error_code::NOT_SUPPORTED,
            Self::NotFound(_) => error_code::NOT_FOUND,
            Self::Timeout(_) => error_code::TIMEOUT,
            Self::Cancelled => error_code::CANCELLED,
            Self::Overflow(_) => error_code::BUFFER_OVERFLOW,
            Self::InputClosed(_) | Self::InvalidState(_) => error_code::INVALID_STATE,
            Self::TransportUnavailable(_) | Self::Internal(_) => error_code::INTERNAL,
        }
    }

    /// Rebuild an error from a code reported by the guest.
    pub fn from_status_code(code: u32) -> Self {
        match code {
            error_code::NOT_FOUND => Self::NotFound("reported by guest".into()),
            error_code::NOT_SUPPORTED => Self::Unsupported("rejected by guest".into()),
            error_code::CANCELLED => Self::Cancelled,
            error_code::TIMEOUT => Self::Timeout("reported by guest".into()),
            error_code::BUFFER_OVERFLOW => Self::Overflow("reported by guest".into()),
            _ => Self::Guest { code },
        }
    }

    /// Whether the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportUnavailable(_) | Self::Timeout(_))
    }
}
