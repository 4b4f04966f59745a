//! Pipeline configuration
//!
//! Loaded once from JSON at startup. Every field has a default, so a file only
//! needs to name what it changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PipelineError;
use crate::mux::MuxConfig;
use crate::types::BusAddress;

/// Topic prefix devices publish raw payloads under
pub const DEFAULT_PREFIX: &str = "beehive";

/// Marks topics and system names carrying calibrated values
pub const DEFAULT_SUFFIX: &str = "calibrated";

/// Shared topic for the per-column aggregate messages
pub const DEFAULT_COLUMN_TOPIC: &str = "B-value";

/// One sensor in a column, written as `["0444", "unten"]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnEntry(pub BusAddress, pub String);

impl ColumnEntry {
    pub fn new(sensor: BusAddress, alias: impl Into<String>) -> Self {
        Self(sensor, alias.into())
    }

    pub fn sensor(&self) -> &BusAddress {
        &self.0
    }

    pub fn alias(&self) -> &str {
        &self.1
    }
}

/// Named groups of sensors for aggregate reporting, independent of bus layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping(BTreeMap<String, Vec<ColumnEntry>>);

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column; sensors keep the order given
    pub fn with_column(mut self, name: impl Into<String>, entries: Vec<ColumnEntry>) -> Self {
        self.0.insert(name.into(), entries);
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[ColumnEntry])> {
        self.0.iter().map(|(name, entries)| (name.as_str(), entries.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The two stock hive columns, four sensors each from top to bottom
    pub fn hive_default() -> Self {
        let column = |entries: [(u8, u8, &str); 4]| -> Vec<ColumnEntry> {
            entries
                .into_iter()
                .filter_map(|(channel, device, alias)| {
                    BusAddress::new(channel, device)
                        .ok()
                        .map(|address| ColumnEntry::new(address, alias))
                })
                .collect()
        };
        Self::new()
            .with_column(
                "klima",
                column([
                    (5, 0x45, "oben"),
                    (5, 0x44, "mitte-oben"),
                    (4, 0x45, "mitte-unten"),
                    (4, 0x44, "unten"),
                ]),
            )
            .with_column(
                "kontrolle",
                column([
                    (7, 0x45, "oben"),
                    (7, 0x44, "mitte-oben"),
                    (6, 0x45, "mitte-unten"),
                    (6, 0x44, "unten"),
                ]),
            )
    }
}

/// Topic layout and column grouping for outbound messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub prefix: String,
    pub suffix: String,
    pub column_topic: String,
    pub columns: ColumnMapping,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            suffix: DEFAULT_SUFFIX.to_string(),
            column_topic: DEFAULT_COLUMN_TOPIC.to_string(),
            columns: ColumnMapping::hive_default(),
        }
    }
}

impl RouterConfig {
    /// Topic a device publishes raw payloads to: `{prefix}/{device}`
    pub fn inbound_topic(&self, device_name: &str) -> String {
        format!("{}/{}", self.prefix, device_name)
    }

    /// Topic for re-encoded calibrated payloads: `{prefix}-{suffix}/{device}`
    pub fn native_topic(&self, device_name: &str) -> String {
        format!("{}-{}/{}", self.prefix, self.suffix, device_name)
    }

    /// System name carried in a column message body
    pub fn system_name(&self, device_name: &str, column: &str) -> String {
        format!("{}-{}-{}", device_name, column, self.suffix)
    }

    /// Device name from an inbound topic, if the topic is one of ours
    pub fn device_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty())
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub router: RouterConfig,
    pub mux: MuxConfig,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
