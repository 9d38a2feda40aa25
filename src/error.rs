//! Custom error types for the acquisition layer.
//!
//! This module defines the primary error type, `CameraError`, used by every
//! component from the device handle down to the frame sinks. It is built with
//! `thiserror` so the `?` operator converts I/O and configuration failures
//! automatically.
//!
//! ## Error Hierarchy
//!
//! - **`Device`**: any non-success status code returned by the driver. The
//!   operation name and the raw code are kept for diagnostics.
//! - **`Parameter`**: the driver rejected a parameter value (AOI dimensions,
//!   subsampling factor, ...).
//! - **`ResourceBusy`**: buffer re-allocation attempted while a frame is still
//!   locked by a consumer.
//! - **`InvalidState`**: operation attempted in the wrong device, session or
//!   worker state (double start, AOI change while capturing, ...).
//! - **`Io`** / **`Codec`**: file output failures inside a sink.
//! - **`Configuration`** / **`Config`**: semantic and parsing configuration errors.
//! - **`SinkPanicked`** / **`WorkerJoin`**: failures escaping the background worker.
//!
//! A missed frame (wait timeout) is deliberately *not* represented here: it is
//! an expected condition reported as [`crate::session::FetchOutcome::Missed`].

use crate::driver::StatusCode;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Primary error type for camera control and acquisition.
#[derive(Error, Debug)]
pub enum CameraError {
    /// The driver returned a non-success status code.
    ///
    /// Fatal to the call that produced it. A failed `open` leaves the device
    /// handle unusable.
    #[error("Driver call '{operation}' failed with status {code}")]
    Device {
        /// Driver operation that failed.
        operation: &'static str,
        /// Raw status code returned by the driver.
        code: StatusCode,
    },

    /// The driver (or local validation) rejected a parameter value.
    #[error("Parameter rejected by '{operation}' (status {code})")]
    Parameter {
        /// Parameter operation that failed.
        operation: &'static str,
        /// Raw status code returned by the driver.
        code: StatusCode,
    },

    /// Buffer pool re-allocation attempted while buffers are still locked.
    ///
    /// Recoverable: release every in-flight frame and retry.
    #[error("Buffer pool busy: {locked} buffer(s) still locked")]
    ResourceBusy {
        /// Number of buffers locked at the time of the call.
        locked: usize,
    },

    /// Operation attempted in the wrong state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File output failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration values parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A frame sink panicked while handling a frame.
    #[error("Frame sink '{0}' panicked")]
    SinkPanicked(String),

    /// The background worker task could not be joined.
    #[error("Worker task failed: {0}")]
    WorkerJoin(String),
}

impl CameraError {
    /// Build a `Device` error from a driver status code.
    pub fn device(operation: &'static str, code: StatusCode) -> Self {
        Self::Device { operation, code }
    }

    /// Build a `Parameter` error from a driver status code.
    pub fn parameter(operation: &'static str, code: StatusCode) -> Self {
        Self::Parameter { operation, code }
    }

    /// Whether the caller can reasonably retry after this error.
    ///
    /// Sink output failures and panics stop the worker and are not
    /// recoverable; busy pools, state errors and rejected parameters are.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CameraError::ResourceBusy { .. }
            | CameraError::InvalidState(_)
            | CameraError::Parameter { .. } => true,
            CameraError::Device { .. }
            | CameraError::Io(_)
            | CameraError::Codec(_)
            | CameraError::Configuration(_)
            | CameraError::Config(_)
            | CameraError::SinkPanicked(_)
            | CameraError::WorkerJoin(_) => false,
        }
    }
}

impl From<figment::Error> for CameraError {
    fn from(value: figment::Error) -> Self {
        CameraError::Config(Box::new(value))
    }
}

impl From<image::ImageError> for CameraError {
    fn from(value: image::ImageError) -> Self {
        match value {
            image::ImageError::IoError(err) => CameraError::Io(err),
            other => CameraError::Codec(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_reports_operation_and_code() {
        let err = CameraError::device("is_AllocImageMem", -1);
        assert_eq!(
            err.to_string(),
            "Driver call 'is_AllocImageMem' failed with status -1"
        );
        assert!(!err.is_recoverable());
    }

    #[test]
    fn busy_and_state_errors_are_recoverable() {
        assert!(CameraError::ResourceBusy { locked: 2 }.is_recoverable());
        assert!(CameraError::InvalidState("double start".into()).is_recoverable());
        assert!(CameraError::parameter("is_AOI", 125).is_recoverable());
    }

    #[test]
    fn image_io_error_maps_to_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: CameraError = image::ImageError::IoError(io).into();
        assert!(matches!(err, CameraError::Io(_)));
    }

    #[test]
    fn sink_failures_are_fatal() {
        assert!(!CameraError::SinkPanicked("cube".into()).is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(!CameraError::from(io).is_recoverable());
    }
}
