//! Pluto streaming error types

use thiserror::Error;

/// Result type for Pluto streaming operations
pub type PlutoResult<T> = Result<T, PlutoError>;

/// SoapySDR stream status codes, as returned to the streaming framework.
pub mod status {
    pub const TIMEOUT: i32 = -1;
    pub const STREAM_ERROR: i32 = -2;
    pub const CORRUPTION: i32 = -3;
    pub const OVERFLOW: i32 = -4;
    pub const NOT_SUPPORTED: i32 = -5;
    pub const TIME_ERROR: i32 = -6;
    pub const UNDERFLOW: i32 = -7;
}

/// Errors that can occur while streaming to or from the Pluto
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlutoError {
    /// IIO device missing from the context
    #[error("{0} not found!")]
    DeviceNotFound(String),

    /// Requested wire format is not one of the supported ones
    #[error(
        "setupStream invalid format '{0}' -- Only CS8, CS12, CS16 and CF32 are supported by the PlutoSDR streamer."
    )]
    UnsupportedFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Hardware ring buffer could not be allocated
    #[error("Unable to create buffer on {device} ({samples} samples): {reason}")]
    BufferCreation {
        device: String,
        samples: usize,
        reason: String,
    },

    /// Refill or push did not complete
    #[error("Timeout waiting for hardware buffer")]
    Timeout,

    /// Operation not supported on this handle or with these flags
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// errno-style failure reported by the IIO layer
    #[error("IIO {op} failed with code {code}")]
    Hardware { op: &'static str, code: i32 },

    /// libiio could not be loaded at runtime
    #[error("libiio not found - install the libiio package")]
    LibraryNotFound,
}

impl PlutoError {
    /// Check if this error is recoverable by retrying the call
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PlutoError::Timeout | PlutoError::Hardware { .. })
    }

    /// SoapySDR status code for this error
    pub fn status_code(&self) -> i32 {
        match self {
            PlutoError::Timeout => status::TIMEOUT,
            PlutoError::NotSupported(_) => status::NOT_SUPPORTED,
            _ => status::STREAM_ERROR,
        }
    }
}
