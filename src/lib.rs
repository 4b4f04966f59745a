//! Beehive Pipeline - Sensor acquisition and calibration for instrumented beehives
//!
//! Temperature and humidity sensors sit behind an I2C channel multiplexer.
//! Readings travel as a compact ASCII payload to a calibration stage, which
//! corrects each sensor against a reference and republishes the values:
//! bus scan → measurement → wire payload → calibration → outbound messages.
//!
//! ## Modules
//!
//! - **Acquisition**: [`mux`], [`sensors`] and [`Acquisition`] on the hive side
//! - **Calibration**: [`codec`], [`calibration`], [`router`] and [`CalibrationService`]
//!   next to the broker

pub mod calibration;
pub mod codec;
pub mod config;
pub mod error;
pub mod mux;
pub mod pipeline;
pub mod router;
pub mod sensors;
pub mod transport;
pub mod types;

pub use calibration::{
    CalibrationChain, CalibrationParams, CalibrationRecord, CalibrationTable, SensorCalibration,
};
pub use codec::PayloadCodec;
pub use config::{Config, RouterConfig};
pub use error::{BusFault, CalibrationError, FormatError, PipelineError, TransportError};
pub use mux::{BusMultiplexer, MuxConfig, SharedMultiplexer};
pub use pipeline::{Acquisition, CalibrationService, LocalClock, TimestampSource};
pub use router::MessageRouter;
pub use transport::{publish_all, Transport};
pub use types::{BusAddress, OutboundMessage, Payload, PhysicalReading, RawReading};

/// Crate version, reported by the CLI
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");
