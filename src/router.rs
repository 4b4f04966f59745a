//! Fan-out of calibrated readings to outbound message formats
//!
//! One inbound payload becomes:
//! - one aggregate message per configured column, all on the shared column
//!   topic, body `SYSTEM,SEQ:alias,temperature,humidity[:...]`
//! - one native message on `{prefix}-{suffix}/{device}` re-using the wire
//!   codec with calibrated values mapped back onto the raw scale
//!
//! Routing is a pure function of its inputs; nothing here talks to a transport.

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::calibration::CalibrationTable;
use crate::codec::PayloadCodec;
use crate::config::RouterConfig;
use crate::error::PipelineError;
use crate::types::{CalibratedReadings, OutboundMessage, Payload, Readings};

/// Separates the system header and the per-sensor groups of a column message
const COLUMN_SEPARATOR: char = ':';

/// Turns decoded, calibrated payloads into outbound messages
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Decode, calibrate and fan out one raw payload
    pub fn route(
        &self,
        payload: &[u8],
        calibrations: &CalibrationTable,
        device_name: &str,
    ) -> Result<Vec<OutboundMessage>, PipelineError> {
        let payload = PayloadCodec::decode(payload)?;
        self.route_decoded(&payload, calibrations, device_name)
    }

    /// Calibrate and fan out an already decoded payload
    pub fn route_decoded(
        &self,
        payload: &Payload,
        calibrations: &CalibrationTable,
        device_name: &str,
    ) -> Result<Vec<OutboundMessage>, PipelineError> {
        let calibrated = calibrations.apply(&payload.readings)?;

        let mut messages = self.group_by_column(device_name, payload.sequence, &calibrated);
        messages.push(self.encode_native(
            device_name,
            &payload.timestamp,
            payload.sequence,
            &calibrated,
        ));
        debug!(
            device = device_name,
            sequence = payload.sequence,
            messages = messages.len(),
            "routed payload"
        );
        Ok(messages)
    }

    /// One aggregate message per column.
    ///
    /// Sensors absent from this cycle are left out of their column; a column
    /// with none of its sensors present produces no message.
    pub fn group_by_column(
        &self,
        device_name: &str,
        sequence: u32,
        readings: &CalibratedReadings,
    ) -> Vec<OutboundMessage> {
        let mut messages = Vec::with_capacity(self.config.columns.len());
        for (column, entries) in self.config.columns.columns() {
            let mut body = format!("{},{}", self.config.system_name(device_name, column), sequence);
            let mut present = 0;
            for entry in entries {
                let Some(reading) = readings.get(entry.sensor()) else {
                    warn!(
                        column,
                        sensor = %entry.sensor(),
                        sequence,
                        "sensor missing from payload"
                    );
                    continue;
                };
                body.push(COLUMN_SEPARATOR);
                body.push_str(&format!(
                    "{},{},{}",
                    entry.alias(),
                    reading.temperature_c,
                    reading.humidity_pct
                ));
                present += 1;
            }
            if present > 0 {
                messages.push(OutboundMessage::new(self.config.column_topic.clone(), body));
            }
        }
        messages
    }

    /// Re-encode calibrated values in the wire format, in bus order.
    ///
    /// Values outside the sensor range saturate at the raw bounds.
    pub fn encode_native(
        &self,
        device_name: &str,
        timestamp: &NaiveDateTime,
        sequence: u32,
        readings: &CalibratedReadings,
    ) -> OutboundMessage {
        let raw: Readings = readings
            .iter()
            .map(|(address, reading)| (*address, reading.to_raw()))
            .collect();
        OutboundMessage::new(
            self.config.native_topic(device_name),
            PayloadCodec::encode_naive(sequence, timestamp, &raw),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnEntry, ColumnMapping};
    use crate::error::CalibrationError;
    use crate::types::{BusAddress, PhysicalReading};
    use pretty_assertions::assert_eq;

    fn address(id: &str) -> BusAddress {
        id.parse().unwrap()
    }

    fn router(columns: ColumnMapping) -> MessageRouter {
        MessageRouter::new(RouterConfig {
            columns,
            ..RouterConfig::default()
        })
    }

    fn identity_table(reference: &str) -> CalibrationTable {
        CalibrationTable::from_json(&format!(
            r#"{{"reference_id": "{reference}", "calibrations": {{}}}}"#
        ))
        .unwrap()
    }

    fn timestamp() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_column_message_body() {
        let columns = ColumnMapping::new().with_column(
            "klima",
            vec![
                ColumnEntry::new(address("0545"), "oben"),
                ColumnEntry::new(address("0444"), "unten"),
            ],
        );
        let mut readings = CalibratedReadings::new();
        readings.insert(address("0444"), PhysicalReading::new(20.5, 60.25));
        readings.insert(address("0545"), PhysicalReading::new(21.0, 55.5));

        let messages = router(columns).group_by_column("hive1", 17, &readings);
        assert_eq!(
            messages,
            vec![OutboundMessage::new(
                "B-value",
                "hive1-klima-calibrated,17:oben,21,55.5:unten,20.5,60.25"
            )]
        );
    }

    #[test]
    fn test_columns_skip_absent_sensors() {
        let columns = ColumnMapping::hive_default();
        let mut readings = CalibratedReadings::new();
        readings.insert(address("0444"), PhysicalReading::new(20.0, 50.0));

        let messages = router(columns).group_by_column("hive1", 1, &readings);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hive1-klima-calibrated,1:unten,20,50");
    }

    #[test]
    fn test_native_message_saturates_and_orders() {
        let mut readings = CalibratedReadings::new();
        readings.insert(address("0745"), PhysicalReading::new(500.0, -10.0));
        readings.insert(address("0444"), PhysicalReading::new(-100.0, 150.0));

        let message = router(ColumnMapping::new()).encode_native("hive1", &timestamp(), 3, &readings);
        assert_eq!(message.topic, "beehive-calibrated/hive1");
        assert_eq!(
            message.body,
            "3,2024-01-01T00:00:00;0444,T0000,Hffff;0745,Tffff,H0000"
        );
    }

    #[test]
    fn test_route_reference_payload() {
        let columns = ColumnMapping::new()
            .with_column("klima", vec![ColumnEntry::new(address("0444"), "unten")]);
        let messages = router(columns)
            .route(
                b"1,2024-01-01T00:00:00;0444,T8000,H8000",
                &identity_table("0444"),
                "hive1",
            )
            .unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].topic, "B-value");
        assert!(messages[0].body.starts_with("hive1-klima-calibrated,1:unten,42.50"));
        assert_eq!(messages[1].topic, "beehive-calibrated/hive1");
        assert_eq!(messages[1].body, "1,2024-01-01T00:00:00;0444,T8000,H8000");
    }

    #[test]
    fn test_route_rejects_uncalibrated_sensor() {
        let result = router(ColumnMapping::new()).route(
            b"1,2024-01-01T00:00:00;0444,T8000,H8000;0545,T8000,H8000",
            &identity_table("0444"),
            "hive1",
        );
        assert!(matches!(
            result,
            Err(PipelineError::Calibration(CalibrationError::UnknownSensor(a))) if a == address("0545")
        ));
    }

    #[test]
    fn test_route_rejects_malformed_payload() {
        let result = router(ColumnMapping::new()).route(
            b"1,2024-01-01T00:00:00;0444,T800,H8000",
            &identity_table("0444"),
            "hive1",
        );
        assert!(matches!(result, Err(PipelineError::Format(_))));
    }
}
