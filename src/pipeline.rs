//! Pipeline orchestration
//!
//! Two halves meet at the wire format:
//! - [`Acquisition`] runs on the hive: scan the bus once, then turn every
//!   cycle into one raw payload
//! - [`CalibrationService`] runs next to the broker: take a raw payload,
//!   calibrate it and fan it out through the [`MessageRouter`]

use chrono::{DateTime, FixedOffset, Local};
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use tracing::{debug, info, warn};

use crate::calibration::CalibrationTable;
use crate::codec::PayloadCodec;
use crate::config::RouterConfig;
use crate::error::{BusFault, FormatError, PipelineError};
use crate::mux::BusMultiplexer;
use crate::router::MessageRouter;
use crate::sensors::{discover, DiscoveredSensor, Discovery, SensorDriver};
use crate::transport::{publish_all, Transport};
use crate::types::{OutboundMessage, RawReading, Readings};

/// Wait after each reset and clear command before talking to the sensor again
pub const COMMAND_SETTLE_MS: u32 = 20;

/// Wall-clock source for payload timestamps
pub trait TimestampSource {
    fn now(&mut self) -> DateTime<FixedOffset>;
}

/// Local time including the current UTC offset
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl TimestampSource for LocalClock {
    fn now(&mut self) -> DateTime<FixedOffset> {
        let now = Local::now();
        now.with_timezone(now.offset())
    }
}

/// Sensor-side loop: owns the bus, the sensors found on it and the sequence counter.
///
/// Discovery runs once, at construction. Sensors that fault during a cycle
/// are left out of that cycle's payload; the next cycle tries them again.
pub struct Acquisition<I2C, D, C> {
    mux: BusMultiplexer<I2C, D>,
    discovery: Discovery,
    clock: C,
    sequence: u32,
    topic: String,
}

impl<I2C: I2c, D: DelayNs, C: TimestampSource> Acquisition<I2C, D, C> {
    /// Scan the bus and set up publishing under `{prefix}/{system_name}`
    pub fn new(
        mut mux: BusMultiplexer<I2C, D>,
        clock: C,
        config: &RouterConfig,
        system_name: &str,
    ) -> Self {
        let discovery = discover(&mut mux);
        if discovery.is_empty() {
            warn!("no sensors found on any channel");
        } else {
            info!(sensors = discovery.len(), "discovery complete");
        }
        Self {
            mux,
            discovery,
            clock,
            sequence: 0,
            topic: config.inbound_topic(system_name),
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Sequence number of the last payload produced, 0 before the first
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn multiplexer(&mut self) -> &mut BusMultiplexer<I2C, D> {
        &mut self.mux
    }

    /// Reset and clear every discovered sensor.
    ///
    /// Returns how many sensors acknowledged both commands.
    pub fn prepare(&mut self) -> usize {
        let mut ready = 0;
        for sensor in &self.discovery.sensors {
            match prepare_sensor(&mut self.mux, sensor) {
                Ok(()) => ready += 1,
                Err(e) => warn!(address = %sensor.address, error = %e, "sensor prepare failed"),
            }
        }
        ready
    }

    /// Measure every discovered sensor once, skipping faulted ones
    pub fn measure(&mut self) -> Readings {
        let mut readings = Readings::new();
        for sensor in &self.discovery.sensors {
            match measure_sensor(&mut self.mux, sensor) {
                Ok(reading) => {
                    readings.insert(sensor.address, reading);
                }
                Err(e) => warn!(address = %sensor.address, error = %e, "skipping sensor this cycle"),
            }
        }
        readings
    }

    /// One acquisition cycle: measure, stamp and encode
    pub fn run_cycle(&mut self) -> OutboundMessage {
        let readings = self.measure();
        self.sequence = self.sequence.wrapping_add(1);
        let timestamp = self.clock.now();
        debug!(
            sequence = self.sequence,
            sensors = readings.len(),
            "cycle complete"
        );
        OutboundMessage::new(
            self.topic.clone(),
            PayloadCodec::encode(self.sequence, &timestamp, &readings),
        )
    }

    /// Run one cycle and hand the payload to `transport`
    pub fn run_and_publish<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<u32, PipelineError> {
        let message = self.run_cycle();
        transport.publish(&message.topic, &message.body)?;
        Ok(self.sequence)
    }

    /// Give back the bus and delay provider
    pub fn release(self) -> (I2C, D) {
        self.mux.release()
    }
}

fn prepare_sensor<I2C: I2c, D: DelayNs>(
    mux: &mut BusMultiplexer<I2C, D>,
    sensor: &DiscoveredSensor,
) -> Result<(), BusFault> {
    let mut bus = mux.channel(sensor.address.channel())?;
    let (i2c, delay) = bus.split()?;
    sensor.sensor.reset(i2c)?;
    delay.delay_ms(COMMAND_SETTLE_MS);
    sensor.sensor.clear(i2c)?;
    delay.delay_ms(COMMAND_SETTLE_MS);
    Ok(())
}

fn measure_sensor<I2C: I2c, D: DelayNs>(
    mux: &mut BusMultiplexer<I2C, D>,
    sensor: &DiscoveredSensor,
) -> Result<RawReading, BusFault> {
    let mut bus = mux.channel(sensor.address.channel())?;
    let (i2c, delay) = bus.split()?;
    sensor.sensor.raw_measure(i2c, delay)
}

/// Broker-side stage: raw payloads in, calibrated messages out
#[derive(Debug, Clone)]
pub struct CalibrationService {
    router: MessageRouter,
    calibrations: CalibrationTable,
}

impl CalibrationService {
    pub fn new(config: RouterConfig, calibrations: CalibrationTable) -> Self {
        Self {
            router: MessageRouter::new(config),
            calibrations,
        }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn calibrations(&self) -> &CalibrationTable {
        &self.calibrations
    }

    /// Route a payload received on `topic`; the device name is taken from the topic
    pub fn handle(&self, topic: &str, payload: &[u8]) -> Result<Vec<OutboundMessage>, PipelineError> {
        let device_name = self
            .router
            .config()
            .device_from_topic(topic)
            .ok_or_else(|| FormatError::UnexpectedTopic(topic.to_string()))?;
        self.handle_device(device_name, payload)
    }

    /// Route a payload for a device known out of band
    pub fn handle_device(
        &self,
        device_name: &str,
        payload: &[u8],
    ) -> Result<Vec<OutboundMessage>, PipelineError> {
        self.router.route(payload, &self.calibrations, device_name)
    }

    /// Route and publish; nothing is published if routing fails
    pub fn handle_and_publish<T: Transport + ?Sized>(
        &self,
        topic: &str,
        payload: &[u8],
        transport: &mut T,
    ) -> Result<usize, PipelineError> {
        let messages = self.handle(topic, payload)?;
        Ok(publish_all(&messages, transport)?)
    }
}
