//! Error types for the camera engine.
//!
//! Errors are plain values built with `thiserror` and grouped by the layer
//! that produces them:
//!
//! - [`TransportError`]: the byte channel to the device failed. Never retried
//!   here; a half-read device buffer would corrupt every subsequent command,
//!   so the failure is surfaced to the capture orchestrator instead.
//! - [`ProtocolError`]: the bytes moved but did not match the wire contract
//!   (wrong response length, unknown opcode).
//! - [`DeviceError`]: the request was well-formed but the device or its
//!   current state cannot satisfy it.
//! - [`ReconstructError`]: raw field buffers with geometry the weave passes
//!   do not support.
//! - [`CameraError`]: the umbrella type the public API returns. Cancellation
//!   is a variant of its own so callers can treat it as a clean, non-fatal
//!   outcome rather than a failure.

use thiserror::Error;

/// Convenience alias for results using the umbrella error type.
pub type CamResult<T> = std::result::Result<T, CameraError>;

/// Failures of the raw byte channel to the device.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("transport timed out")]
    Timeout,

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
}

/// Violations of the vendor wire format.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("response length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unsupported opcode {0:#04x}")]
    UnsupportedOpcode(u8),
}

/// Errors reported by the device layer before or during an exposure.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device is busy with another exposure")]
    Busy,

    #[error("invalid exposure region: {0}")]
    InvalidRegion(String),

    #[error("sensor temperature did not converge within the timeout")]
    TemperatureTimeout,

    #[error("device has no internal exposure timer")]
    TimerUnsupported,

    #[error("device has no {0}")]
    Unsupported(&'static str),
}

/// Geometry problems handed to the frame reconstructor.
///
/// The weave passes only support even dimensions; see `reconstruct` for the
/// exact per-binning preconditions.
#[derive(Error, Debug)]
pub enum ReconstructError {
    #[error("unsupported frame geometry: {0}")]
    UnsupportedGeometry(String),

    #[error("field buffer length mismatch: expected {expected} samples, got {actual}")]
    FieldLength { expected: usize, actual: usize },
}

/// Umbrella error type returned by the public camera API.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Reconstruct(#[from] ReconstructError),

    #[error("capture cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("guider error: {0}")]
    Guider(#[source] anyhow::Error),

    #[error("cooler error: {0}")]
    Cooler(#[source] anyhow::Error),
}

impl CameraError {
    /// True for the clean cancellation outcome, which terminates a capture
    /// session without marking it failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CameraError::Cancelled)
    }
}
