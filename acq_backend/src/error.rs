//! Error kinds shared by every layer of the acquisition stack.
//!
//! All fallible operations return [`Result`], whose error type is the [`Error`] enum below.
//! Each variant corresponds to one value-level [`ErrorKind`]; callers that only care about
//! the category (retry on `Contended`, mark incomplete on `StoppedEarly`, ...) match on
//! [`Error::kind`] instead of the full variant.

use std::fmt;
use std::path::PathBuf;

/// Convenience alias used throughout `acq_backend` and `acqctrl_backend`.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error carried by [`Error::DeviceFailure`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Invalid parameters for '{device}': {reason}")]
    InvalidParams { device: String, reason: String },

    #[error("Device '{device}' is reserved by '{holder}'")]
    Contended { device: String, holder: String },

    #[error("Clock mismatch on '{device}': {reason}")]
    ClockMismatch { device: String, reason: String },

    #[error("Schema mismatch writing {path:?}: {reason}")]
    SchemaMismatch { path: PathBuf, reason: String },

    #[error("Timed out after {0:.3} s")]
    Timeout(f64),

    #[error("Aborted")]
    Aborted,

    #[error("Device '{device}' failed: {source}")]
    DeviceFailure {
        device: String,
        #[source]
        source: BoxError,
    },

    #[error("Not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Device '{device}' stopped early ({acquired} of {expected} samples)")]
    StoppedEarly {
        device: String,
        acquired: usize,
        expected: usize,
    },

    #[error("Sequence parameters of {0:?} are fixed once children exist")]
    SequenceLocked(PathBuf),

    #[error("Stop requested")]
    StopRequested,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Value-level classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownDevice,
    InvalidParams,
    Contended,
    ClockMismatch,
    SchemaMismatch,
    Timeout,
    Aborted,
    DeviceFailure,
    NotFound,
    StoppedEarly,
    SequenceLocked,
    StopRequested,
    Io,
    Json,
}

impl ErrorKind {
    /// Lower-case tag used in audit log entries (`"aborted"`, `"timeout"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownDevice => "unknown_device",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::Contended => "contended",
            ErrorKind::ClockMismatch => "clock_mismatch",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::DeviceFailure => "device_failure",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StoppedEarly => "stopped_early",
            ErrorKind::SequenceLocked => "sequence_locked",
            ErrorKind::StopRequested => "stop_requested",
            ErrorKind::Io => "io",
            ErrorKind::Json => "json",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownDevice(_) => ErrorKind::UnknownDevice,
            Error::InvalidParams { .. } => ErrorKind::InvalidParams,
            Error::Contended { .. } => ErrorKind::Contended,
            Error::ClockMismatch { .. } => ErrorKind::ClockMismatch,
            Error::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Aborted => ErrorKind::Aborted,
            Error::DeviceFailure { .. } => ErrorKind::DeviceFailure,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::StoppedEarly { .. } => ErrorKind::StoppedEarly,
            Error::SequenceLocked(_) => ErrorKind::SequenceLocked,
            Error::StopRequested => ErrorKind::StopRequested,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Json,
        }
    }

    /// Shortcut for [`Error::InvalidParams`].
    pub fn invalid(device: &str, reason: impl Into<String>) -> Self {
        Error::InvalidParams {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    /// Wraps a hardware-layer error as [`Error::DeviceFailure`].
    pub fn device_failure(device: &str, source: impl Into<BoxError>) -> Self {
        Error::DeviceFailure {
            device: device.to_string(),
            source: source.into(),
        }
    }
}
