//! ==============================================================================
//! domain.rs - readings as they move from the pins to the remote table
//! ==============================================================================
//!
//! lifecycle:
//!     RawSample        -> produced every sampling tick, never stored
//!     NewReading       -> a sample the filter accepted, about to be appended
//!     PersistedReading -> a row in the local queue (synced flag false -> true)
//!     CanonicalReading -> wire-bound projection built at sync time
//!
//! ==============================================================================

use serde::{Serialize, Serializer};

/// logical sensor category. each group owns one table in the local store
/// and one slot in the filter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelGroup {
    TemperatureHumidity,
    SoilMoisture,
    WaterLevel,
    LightLevel,
}

impl ChannelGroup {
    pub const ALL: [ChannelGroup; 4] = [
        ChannelGroup::TemperatureHumidity,
        ChannelGroup::SoilMoisture,
        ChannelGroup::WaterLevel,
        ChannelGroup::LightLevel,
    ];

    /// stable position used to index per-group arrays
    pub fn index(self) -> usize {
        match self {
            ChannelGroup::TemperatureHumidity => 0,
            ChannelGroup::SoilMoisture => 1,
            ChannelGroup::WaterLevel => 2,
            ChannelGroup::LightLevel => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelGroup::TemperatureHumidity => "temperature-humidity",
            ChannelGroup::SoilMoisture => "soil-moisture",
            ChannelGroup::WaterLevel => "water-level",
            ChannelGroup::LightLevel => "light-level",
        }
    }
}

impl std::fmt::Display for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// the value(s) carried by one sample.
///
/// only the temperature-humidity group has a secondary value:
/// primary = humidity, secondary = temperature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Values {
    pub primary: f64,
    pub secondary: Option<f64>,
}

impl Values {
    pub fn single(value: f64) -> Self {
        Self { primary: value, secondary: None }
    }

    pub fn pair(primary: f64, secondary: f64) -> Self {
        Self { primary, secondary: Some(secondary) }
    }
}

/// one capture of one channel group.
///
/// `values` is `None` when the upstream read failed (decoder retries
/// exhausted, adc unavailable, ...). such samples are never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub group: ChannelGroup,
    pub values: Option<Values>,
    /// seconds since the unix epoch
    pub captured_at: i64,
}

impl RawSample {
    pub fn ok(group: ChannelGroup, values: Values, captured_at: i64) -> Self {
        Self { group, values: Some(values), captured_at }
    }

    pub fn failed(group: ChannelGroup, captured_at: i64) -> Self {
        Self { group, values: None, captured_at }
    }
}

/// a sample accepted by the filter, ready to append
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewReading {
    pub group: ChannelGroup,
    pub values: Values,
    pub timestamp: i64,
}

/// identity of a stored row. ids are only unique within a group's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadingKey {
    pub group: ChannelGroup,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedReading {
    pub key: ReadingKey,
    pub value1: f64,
    pub value2: Option<f64>,
    pub timestamp: i64,
    pub synced: bool,
}

/// one record of the remote readings table.
///
/// the wire body only carries `sensor_id`, `value`, `ts` and optional
/// `metadata`; `unit` stays on the host side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalReading {
    pub sensor_id: String,
    pub value: f64,
    #[serde(skip_serializing)]
    pub unit: String,
    #[serde(rename = "ts", serialize_with = "serialize_iso8601")]
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// format unix seconds as `YYYY-MM-DDTHH:MM:SSZ`
pub fn iso8601(timestamp: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn serialize_iso8601<S: Serializer>(timestamp: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    match iso8601(*timestamp) {
        Some(ts) => serializer.serialize_str(&ts),
        None => Err(serde::ser::Error::custom(format!(
            "timestamp {} is out of range",
            timestamp
        ))),
    }
}
