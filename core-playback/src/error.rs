//! # Driver Error Types
//!
//! The error taxonomy every driver operation reports, and the translation
//! from raw sound-server error codes into it.

use bridge_traits::{BridgeError, ServerErrorCode};
use thiserror::Error;

/// Errors reported by driver operations and delivered to completions.
///
/// Errors carry no payload so the same value can be delivered to every
/// request a connection failure takes down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverError {
    /// The server does not support the requested operation.
    #[error("Operation not supported")]
    NotSupported,

    /// Bad argument or unparseable property value.
    #[error("Invalid argument")]
    Invalid,

    /// Operation invoked on a driver in the wrong lifecycle phase.
    #[error("Invalid state")]
    State,

    #[error("Out of memory")]
    Oom,

    /// The requested driver is not available.
    #[error("No such driver")]
    NoDriver,

    #[error("File or data too large")]
    TooBig,

    /// The named sample or sound does not exist.
    #[error("Not found")]
    NotFound,

    /// The owning driver or connection was torn down.
    #[error("Destroyed")]
    Destroyed,

    /// The request was killed by an explicit cancel.
    #[error("Canceled")]
    Canceled,

    /// The server could not be reached.
    #[error("Not available")]
    NotAvailable,

    #[error("Access forbidden")]
    Access,

    /// Generic protocol or transport fault.
    #[error("I/O error")]
    Io,
}

impl DriverError {
    /// Stable numeric code for hosts that report errors as integers.
    pub fn code(self) -> i32 {
        match self {
            DriverError::NotSupported => -1,
            DriverError::Invalid => -2,
            DriverError::State => -3,
            DriverError::Oom => -4,
            DriverError::NoDriver => -5,
            DriverError::TooBig => -8,
            DriverError::NotFound => -9,
            DriverError::Destroyed => -10,
            DriverError::Canceled => -11,
            DriverError::NotAvailable => -12,
            DriverError::Access => -13,
            DriverError::Io => -14,
        }
    }

    /// Returns `true` if uploading the sample and retrying may succeed.
    pub fn is_retryable_with_cache(self) -> bool {
        self == DriverError::NotFound
    }

    /// Map a server error code. Unknown and unmapped codes become [`DriverError::Io`].
    pub fn from_server(code: ServerErrorCode) -> Self {
        match code {
            ServerErrorCode::ACCESS | ServerErrorCode::AUTH_KEY => DriverError::Access,
            ServerErrorCode::INVALID | ServerErrorCode::INVALID_SERVER => DriverError::Invalid,
            ServerErrorCode::NO_ENTITY => DriverError::NotFound,
            ServerErrorCode::CONNECTION_REFUSED => DriverError::NotAvailable,
            ServerErrorCode::KILLED => DriverError::Destroyed,
            ServerErrorCode::MODULE_INIT_FAILED => DriverError::NoDriver,
            ServerErrorCode::BAD_STATE => DriverError::State,
            ServerErrorCode::VERSION => DriverError::NotSupported,
            ServerErrorCode::TOO_LARGE => DriverError::TooBig,
            _ => DriverError::Io,
        }
    }
}

/// Translate a server error code, treating `OK` as success.
pub fn translate(code: ServerErrorCode) -> Result<()> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(DriverError::from_server(code))
    }
}

impl From<BridgeError> for DriverError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NotFound(_) => DriverError::NotFound,
            BridgeError::InvalidArgument(_) => DriverError::Invalid,
            BridgeError::NotAvailable(_) => DriverError::NotAvailable,
            BridgeError::OperationFailed(_) | BridgeError::Io(_) => DriverError::Io,
        }
    }
}

impl From<ServerErrorCode> for DriverError {
    fn from(code: ServerErrorCode) -> Self {
        DriverError::from_server(code)
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;
