//! Error types for host interactions.

use thiserror::Error;

/// Message LXD returns when stopping an instance that is not running.
const ALREADY_STOPPED: &str = "The instance is already stopped";

#[derive(Debug, Error)]
pub enum LxdError {
    /// Connecting to the host did not finish within the connect deadline.
    #[error("timeout connecting to LXD host")]
    ConnectTimeout,

    /// The instance (or other object) does not exist on the host.
    #[error("not found")]
    NotFound,

    /// The host rejected an update because the version token did not match.
    #[error("version token mismatch")]
    PreconditionFailed,

    /// The host answered with an API-level error payload.
    #[error("LXD API error ({code}): {message}")]
    Api { code: i64, message: String },

    /// A background operation on the host finished unsuccessfully.
    #[error("operation failed: {0}")]
    Operation(String),

    /// Transport-level failure talking to the host.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The host answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A value supplied by configuration or by the host was malformed.
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl LxdError {
    /// Whether this is the benign "stop an already-stopped instance" error.
    pub fn is_already_stopped(&self) -> bool {
        match self {
            LxdError::Operation(message) | LxdError::Api { message, .. } => {
                message.eq_ignore_ascii_case(ALREADY_STOPPED)
            }
            _ => false,
        }
    }
}
