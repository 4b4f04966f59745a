//! Error types for the beehive pipeline
//!
//! Each stage owns its own error type so callers can tell a dead bus from a
//! garbled payload. [`PipelineError`] wraps them all for code that drives
//! several stages at once.

use embedded_hal::i2c::ErrorKind;
use thiserror::Error;

use crate::types::BusAddress;

/// I/O failure reaching a device or the multiplexer.
///
/// Non-fatal: the affected channel or device is skipped for the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("Invalid multiplexer channel {0} (expected 0-7)")]
    InvalidChannel(u8),

    #[error("Multiplexer at 0x{address:02x} did not accept channel {channel}: {kind}")]
    Select {
        address: u8,
        channel: u8,
        kind: ErrorKind,
    },

    #[error("Bus transaction with 0x{address:02x} failed: {kind}")]
    Device { address: u8, kind: ErrorKind },
}

/// A payload, identifier or calibration record that does not parse.
///
/// The whole unit is rejected; there is no partial decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("Payload is empty")]
    Empty,

    #[error("Payload is not ASCII")]
    NotAscii,

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Invalid sequence number: {0}")]
    InvalidSequence(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Malformed sensor entry: {0}")]
    MalformedEntry(String),

    #[error("Invalid sensor address: {0}")]
    InvalidAddress(String),

    #[error("Invalid {tag} field in entry '{entry}'")]
    InvalidField { entry: String, tag: char },

    #[error("Sensor {0} appears more than once")]
    DuplicateSensor(BusAddress),

    #[error("Reference sensor {0} must not appear in the per-device calibrations")]
    ReferenceCalibrated(String),

    #[error("Topic '{0}' does not carry sensor payloads")]
    UnexpectedTopic(String),
}

/// Degenerate calibration input or a missing calibration chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("Need at least 2 samples for a regression, got {0}")]
    TooFewSamples(usize),

    #[error("Series length mismatch: {measured} measured vs {reference} reference")]
    MismatchedSeries { measured: usize, reference: usize },

    #[error("All measured values are identical; slope is undefined")]
    DegenerateInput,

    #[error("Samples contain non-finite values")]
    NonFinite,

    #[error("No calibration chain for sensor {0}")]
    UnknownSensor(BusAddress),
}

/// Failure reported by the message transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Transport failed publishing to '{topic}': {reason}")]
pub struct TransportError {
    pub topic: String,
    pub reason: String,
}

impl TransportError {
    pub fn new(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur anywhere in the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Bus(#[from] BusFault),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
