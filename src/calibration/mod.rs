//! Linear calibration of physical readings
//!
//! Every sensor is corrected with an affine transform fitted offline against
//! a designated reference sensor. The reference sensor may itself be corrected
//! against an external instrument, and that correction is chained after every
//! other sensor's own transform:
//!
//! ```text
//! device value -> device transform -> reference transform -> calibrated value
//! ```
//!
//! Chains are stored as explicit ordered lists of slope/intercept pairs and
//! applied by iterating over them.

pub mod regression;

pub use regression::{fit, fit_sensor, fit_series};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{CalibrationError, FormatError, PipelineError};
use crate::types::{BusAddress, CalibratedReadings, PhysicalReading, Readings};

/// Slope/intercept pair with optional regression diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub slope: f64,
    pub intercept: f64,
    /// Pearson correlation of the fit
    #[serde(default, alias = "rvalue", skip_serializing_if = "Option::is_none")]
    pub correlation: Option<f64>,
    /// Two-sided p-value for a zero slope
    #[serde(default, alias = "pvalue", skip_serializing_if = "Option::is_none")]
    pub p_value: Option<f64>,
    /// Standard error of the slope
    #[serde(default, alias = "stderr", skip_serializing_if = "Option::is_none")]
    pub std_err: Option<f64>,
}

impl CalibrationParams {
    pub const IDENTITY: Self = Self::new(1.0, 0.0);

    pub const fn new(slope: f64, intercept: f64) -> Self {
        Self {
            slope,
            intercept,
            correlation: None,
            p_value: None,
            std_err: None,
        }
    }

    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        value * self.slope + self.intercept
    }

    pub fn affine(&self) -> Affine {
        Affine {
            slope: self.slope,
            intercept: self.intercept,
        }
    }
}

/// Temperature and humidity calibration of one sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorCalibration {
    pub temperature: CalibrationParams,
    pub humidity: CalibrationParams,
}

impl SensorCalibration {
    pub const IDENTITY: Self = Self {
        temperature: CalibrationParams::IDENTITY,
        humidity: CalibrationParams::IDENTITY,
    };

    pub fn apply(&self, reading: PhysicalReading) -> PhysicalReading {
        PhysicalReading {
            temperature_c: self.temperature.apply(reading.temperature_c),
            humidity_pct: self.humidity.apply(reading.humidity_pct),
        }
    }
}

/// Bare slope/intercept pair used inside a chain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine {
    pub slope: f64,
    pub intercept: f64,
}

impl Affine {
    #[inline]
    pub fn apply(&self, value: f64) -> f64 {
        value * self.slope + self.intercept
    }
}

/// One link of a chain: a transform per measured quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub temperature: Affine,
    pub humidity: Affine,
}

impl From<&SensorCalibration> for ChainStep {
    fn from(calibration: &SensorCalibration) -> Self {
        Self {
            temperature: calibration.temperature.affine(),
            humidity: calibration.humidity.affine(),
        }
    }
}

/// Ordered composition of affine corrections; an empty chain is the identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationChain {
    steps: Vec<ChainStep>,
}

impl CalibrationChain {
    pub fn identity() -> Self {
        Self::default()
    }

    /// Device transform first, then the shared reference transform if any
    pub fn compose(device: &SensorCalibration, reference: Option<&SensorCalibration>) -> Self {
        let mut steps = vec![ChainStep::from(device)];
        steps.extend(reference.map(ChainStep::from));
        Self { steps }
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn apply(&self, reading: PhysicalReading) -> PhysicalReading {
        self.steps
            .iter()
            .fold(reading, |value, step| PhysicalReading {
                temperature_c: step.temperature.apply(value.temperature_c),
                humidity_pct: step.humidity.apply(value.humidity_pct),
            })
    }
}

/// Persisted calibration document.
///
/// `reference_id` names the sensor every other sensor was fitted against. It
/// must not also appear in `calibrations`; it is corrected only through the
/// optional external reference transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub reference_id: String,
    #[serde(
        rename = "testo-calibration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reference_calibration: Option<SensorCalibration>,
    pub calibrations: BTreeMap<String, SensorCalibration>,
}

impl CalibrationRecord {
    /// Assemble a record from fitted calibrations
    pub fn new(
        reference_id: BusAddress,
        reference_calibration: Option<SensorCalibration>,
        calibrations: BTreeMap<BusAddress, SensorCalibration>,
    ) -> Result<Self, FormatError> {
        if calibrations.contains_key(&reference_id) {
            return Err(FormatError::ReferenceCalibrated(reference_id.to_string()));
        }
        Ok(Self {
            reference_id: reference_id.to_string(),
            reference_calibration,
            calibrations: calibrations
                .into_iter()
                .map(|(id, calibration)| (id.to_string(), calibration))
                .collect(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Startup-loaded, immutable mapping from sensor to calibration chain
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    reference: BusAddress,
    chains: BTreeMap<BusAddress, CalibrationChain>,
}

impl CalibrationTable {
    /// Build chains from a record, enforcing the reference-exclusion rule
    pub fn load(record: &CalibrationRecord) -> Result<Self, FormatError> {
        let reference: BusAddress = record.reference_id.parse()?;
        let reference_calibration = record.reference_calibration.as_ref();

        let mut chains = BTreeMap::new();
        let reference_chain = match reference_calibration {
            Some(calibration) => CalibrationChain {
                steps: vec![ChainStep::from(calibration)],
            },
            None => CalibrationChain::identity(),
        };
        chains.insert(reference, reference_chain);

        for (id, calibration) in &record.calibrations {
            let address: BusAddress = id.parse()?;
            if address == reference {
                return Err(FormatError::ReferenceCalibrated(id.clone()));
            }
            debug!(%address, "loaded calibration chain");
            chains.insert(
                address,
                CalibrationChain::compose(calibration, reference_calibration),
            );
        }

        info!(
            %reference,
            sensors = chains.len(),
            external_reference = reference_calibration.is_some(),
            "calibration table loaded"
        );
        Ok(Self { reference, chains })
    }

    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let record = CalibrationRecord::from_json(json)?;
        Ok(Self::load(&record)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn reference(&self) -> BusAddress {
        self.reference
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn sensors(&self) -> impl Iterator<Item = &BusAddress> {
        self.chains.keys()
    }

    pub fn chain(&self, address: &BusAddress) -> Result<&CalibrationChain, CalibrationError> {
        self.chains
            .get(address)
            .ok_or(CalibrationError::UnknownSensor(*address))
    }

    /// Convert raw readings to physical units and calibrate each one.
    ///
    /// Fails if any sensor in the cycle has no chain.
    pub fn apply(&self, readings: &Readings) -> Result<CalibratedReadings, CalibrationError> {
        readings
            .iter()
            .map(|(address, raw)| {
                let chain = self.chain(address)?;
                Ok((*address, chain.apply(raw.to_physical())))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawReading;
    use pretty_assertions::assert_eq;

    fn address(id: &str) -> BusAddress {
        id.parse().unwrap()
    }

    fn calibration(t: (f64, f64), h: (f64, f64)) -> SensorCalibration {
        SensorCalibration {
            temperature: CalibrationParams::new(t.0, t.1),
            humidity: CalibrationParams::new(h.0, h.1),
        }
    }

    fn close(a: PhysicalReading, b: PhysicalReading) -> bool {
        (a.temperature_c - b.temperature_c).abs() < 1e-9 && (a.humidity_pct - b.humidity_pct).abs() < 1e-9
    }

    #[test]
    fn test_apply() {
        assert_eq!(CalibrationParams::new(2.0, 5.0).apply(3.0), 11.0);
    }

    #[test]
    fn test_compose_applies_device_then_reference() {
        let device = calibration((2.0, 1.0), (1.0, -3.0));
        let reference = calibration((1.0, 10.0), (0.5, 0.0));
        let value = PhysicalReading::new(20.0, 60.0);

        let chained = CalibrationChain::compose(&device, Some(&reference)).apply(value);
        assert!(close(chained, reference.apply(device.apply(value))));
        assert!(close(chained, PhysicalReading::new(51.0, 28.5)));

        // Order matters: the opposite order gives a different answer
        assert!(!close(chained, device.apply(reference.apply(value))));
    }

    #[test]
    fn test_compose_without_reference() {
        let device = calibration((2.0, 1.0), (1.0, -3.0));
        let value = PhysicalReading::new(20.0, 60.0);
        let chain = CalibrationChain::compose(&device, None);
        assert_eq!(chain.steps().len(), 1);
        assert!(close(chain.apply(value), device.apply(value)));
    }

    #[test]
    fn test_identity_chain() {
        let value = PhysicalReading::new(-3.5, 99.0);
        assert_eq!(CalibrationChain::identity().apply(value), value);
    }

    #[test]
    fn test_load_record_from_json() {
        let json = r#"{
            "reference_id": "0444",
            "testo-calibration": {
                "temperature": {"slope": 1.0, "intercept": -0.5, "rvalue": 0.99},
                "humidity": {"slope": 1.0, "intercept": 2.0}
            },
            "calibrations": {
                "0545": {
                    "temperature": {"slope": 1.1, "intercept": 0.0, "p_value": 0.001, "std_err": 0.01},
                    "humidity": {"slope": 0.9, "intercept": 1.0}
                }
            }
        }"#;
        let table = CalibrationTable::from_json(json).unwrap();

        assert_eq!(table.reference(), address("0444"));
        assert_eq!(table.len(), 2);

        let value = PhysicalReading::new(20.0, 50.0);
        let reference = table.chain(&address("0444")).unwrap().apply(value);
        assert!(close(reference, PhysicalReading::new(19.5, 52.0)));

        let other = table.chain(&address("0545")).unwrap().apply(value);
        assert!(close(other, PhysicalReading::new(21.5, 48.0)));
    }

    #[test]
    fn test_reference_without_external_calibration_is_identity() {
        let table = CalibrationTable::from_json(r#"{"reference_id": "0444", "calibrations": {}}"#).unwrap();
        let value = PhysicalReading::new(20.0, 50.0);
        assert_eq!(table.chain(&address("0444")).unwrap().apply(value), value);
    }

    #[test]
    fn test_reference_in_calibrations_is_rejected() {
        let json = r#"{
            "reference_id": "0444",
            "calibrations": {
                "0444": {
                    "temperature": {"slope": 1.0, "intercept": 0.0},
                    "humidity": {"slope": 1.0, "intercept": 0.0}
                }
            }
        }"#;
        assert!(matches!(
            CalibrationTable::from_json(json),
            Err(PipelineError::Format(FormatError::ReferenceCalibrated(id))) if id == "0444"
        ));
    }

    #[test]
    fn test_malformed_records_are_rejected() {
        assert!(matches!(
            CalibrationTable::from_json(r#"{"reference_id": "0444"}"#),
            Err(PipelineError::Json(_))
        ));
        assert!(matches!(
            CalibrationTable::from_json(r#"{"reference_id": "bogus", "calibrations": {}}"#),
            Err(PipelineError::Format(FormatError::InvalidAddress(_)))
        ));
    }

    #[test]
    fn test_record_new_enforces_reference_exclusion() {
        let mut calibrations = BTreeMap::new();
        calibrations.insert(address("0444"), SensorCalibration::IDENTITY);
        assert!(CalibrationRecord::new(address("0444"), None, calibrations).is_err());
    }

    #[test]
    fn test_record_survives_serialization() {
        let mut calibrations = BTreeMap::new();
        calibrations.insert(address("0545"), calibration((1.1, 0.2), (0.9, 1.0)));
        let record = CalibrationRecord::new(address("0444"), Some(SensorCalibration::IDENTITY), calibrations)
            .unwrap();

        let json = record.to_json().unwrap();
        assert!(json.contains("\"testo-calibration\""));
        assert_eq!(CalibrationRecord::from_json(&json).unwrap(), record);
    }

    #[test]
    fn test_apply_table_to_readings() {
        let table = CalibrationTable::from_json(r#"{"reference_id": "0444", "calibrations": {}}"#).unwrap();
        let mut readings = Readings::new();
        readings.insert(address("0444"), RawReading::new(0, 65535));

        let calibrated = table.apply(&readings).unwrap();
        assert!(close(calibrated[&address("0444")], PhysicalReading::new(130.0, 0.0)));

        readings.insert(address("0745"), RawReading::new(0, 0));
        assert_eq!(
            table.apply(&readings),
            Err(CalibrationError::UnknownSensor(address("0745")))
        );
    }
}
