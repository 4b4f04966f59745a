//! ASCII wire format for raw sensor payloads
//!
//! ```text
//! SEQ,TIMESTAMP[+TZ];ADDRID,T####,H####[;ADDRID,T####,H####...]
//! ```
//!
//! `ADDRID` is the four-hex-digit [`BusAddress`]; `T` and `H` carry the raw
//! temperature and humidity words as exactly four hex digits. Decoding is
//! all-or-nothing: one bad entry rejects the payload. The UTC offset on the
//! timestamp is dropped during decode.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use std::collections::btree_map::Entry;
use std::fmt::Display;
use tracing::debug;

use crate::error::FormatError;
use crate::types::{BusAddress, Payload, RawReading, Readings};

/// Separates the header and each sensor entry
pub const RECORD_SEPARATOR: char = ';';

/// Separates fields within the header or an entry
pub const FIELD_SEPARATOR: char = ',';

/// Timestamp layout written by acquiring devices, e.g. `2024-01-01T12:00:00+0200`
pub const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Offset-free timestamp layout, e.g. `2024-01-01T12:00:00`
pub const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

const TEMPERATURE_TAG: char = 'T';
const HUMIDITY_TAG: char = 'H';
const HEX_WIDTH: usize = 4;

/// Encoder/decoder for the sensor wire format
pub struct PayloadCodec;

impl PayloadCodec {
    /// Encode one cycle with an offset-aware timestamp
    pub fn encode(
        sequence: u32,
        timestamp: &DateTime<FixedOffset>,
        readings: &Readings,
    ) -> String {
        Self::write(sequence, timestamp.format(WIRE_TIMESTAMP_FORMAT), readings)
    }

    /// Encode one cycle with a local timestamp that carries no offset
    pub fn encode_naive(sequence: u32, timestamp: &NaiveDateTime, readings: &Readings) -> String {
        Self::write(sequence, timestamp.format(NAIVE_TIMESTAMP_FORMAT), readings)
    }

    /// Decode a payload received from the wire
    pub fn decode(bytes: &[u8]) -> Result<Payload, FormatError> {
        if !bytes.is_ascii() {
            return Err(FormatError::NotAscii);
        }
        let text = std::str::from_utf8(bytes).map_err(|_| FormatError::NotAscii)?;
        Self::decode_str(text)
    }

    pub fn decode_str(text: &str) -> Result<Payload, FormatError> {
        let text = text.trim_end();
        if text.is_empty() {
            return Err(FormatError::Empty);
        }

        let mut records = text.split(RECORD_SEPARATOR);
        let header = records.next().unwrap_or_default();
        let (sequence, timestamp) = parse_header(header)?;

        let entries: Vec<&str> = records.collect();
        let mut readings = Readings::new();
        // A bare trailing separator is what a device with no sensors sends
        if entries != [""] {
            for entry in entries {
                let (address, reading) = parse_entry(entry)?;
                match readings.entry(address) {
                    Entry::Occupied(_) => return Err(FormatError::DuplicateSensor(address)),
                    Entry::Vacant(slot) => {
                        slot.insert(reading);
                    }
                }
            }
        }

        debug!(sequence, sensors = readings.len(), "decoded payload");
        Ok(Payload {
            sequence,
            timestamp,
            readings,
        })
    }

    fn write(sequence: u32, timestamp: impl Display, readings: &Readings) -> String {
        let mut out = format!("{sequence}{FIELD_SEPARATOR}{timestamp}");
        for (address, reading) in readings {
            out.push(RECORD_SEPARATOR);
            out.push_str(&format_entry(address, reading));
        }
        out
    }
}

fn format_entry(address: &BusAddress, reading: &RawReading) -> String {
    format!(
        "{address}{FIELD_SEPARATOR}{TEMPERATURE_TAG}{:04x}{FIELD_SEPARATOR}{HUMIDITY_TAG}{:04x}",
        reading.temperature_raw, reading.humidity_raw
    )
}

fn parse_header(header: &str) -> Result<(u32, NaiveDateTime), FormatError> {
    let mut fields = header.split(FIELD_SEPARATOR);
    let (Some(sequence), Some(timestamp), None) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(FormatError::MalformedHeader(header.to_string()));
    };

    let sequence = sequence
        .parse::<u32>()
        .map_err(|_| FormatError::InvalidSequence(sequence.to_string()))?;
    Ok((sequence, parse_timestamp(timestamp)?))
}

/// Parse an ISO-8601 timestamp, discarding any trailing UTC offset
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, FormatError> {
    let local = strip_offset(text);
    NaiveDateTime::parse_from_str(local, NAIVE_TIMESTAMP_FORMAT)
        .map_err(|_| FormatError::InvalidTimestamp(text.to_string()))
}

fn strip_offset(text: &str) -> &str {
    let Some(time_start) = text.find('T') else {
        return text;
    };
    if let Some(stripped) = text.strip_suffix('Z') {
        return stripped;
    }
    match text[time_start..].rfind(['+', '-']) {
        Some(offset) => &text[..time_start + offset],
        None => text,
    }
}

fn parse_entry(entry: &str) -> Result<(BusAddress, RawReading), FormatError> {
    let mut fields = entry.split(FIELD_SEPARATOR);
    let (Some(id), Some(first), Some(second), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(FormatError::MalformedEntry(entry.to_string()));
    };

    let address: BusAddress = id.parse()?;
    let mut temperature = None;
    let mut humidity = None;
    for field in [first, second] {
        let (tag, value) = parse_tagged(entry, field)?;
        let slot = match tag {
            TEMPERATURE_TAG => &mut temperature,
            _ => &mut humidity,
        };
        if slot.replace(value).is_some() {
            return Err(FormatError::InvalidField {
                entry: entry.to_string(),
                tag,
            });
        }
    }

    match (temperature, humidity) {
        (Some(temperature_raw), Some(humidity_raw)) => Ok((
            address,
            RawReading {
                humidity_raw,
                temperature_raw,
            },
        )),
        _ => Err(FormatError::MalformedEntry(entry.to_string())),
    }
}

fn parse_tagged(entry: &str, field: &str) -> Result<(char, u16), FormatError> {
    let mut chars = field.chars();
    let tag = match chars.next() {
        Some(tag @ (TEMPERATURE_TAG | HUMIDITY_TAG)) => tag,
        _ => return Err(FormatError::MalformedEntry(entry.to_string())),
    };
    let digits = chars.as_str();
    let invalid = || FormatError::InvalidField {
        entry: entry.to_string(),
        tag,
    };
    if digits.len() != HEX_WIDTH || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let value = u16::from_str_radix(digits, 16).map_err(|_| invalid())?;
    Ok((tag, value))
}
