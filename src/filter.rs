//! ==============================================================================
//! filter.rs - deadband / heartbeat filter
//! ==============================================================================
//!
//! purpose:
//!     decides per channel group whether a fresh sample is worth a row in
//!     the local queue. a sample is kept when any tracked value moved by at
//!     least its threshold since the last kept sample, or when the last kept
//!     sample is at least one heartbeat interval old.
//!
//! state:
//!     `FilterState` is a plain value threaded through each sampling tick.
//!     it starts "unknown" for every group so the first good sample is always
//!     kept, and it only changes when a sample is accepted.
//!
//! ==============================================================================

use crate::domain::{ChannelGroup, Values};
use serde::Deserialize;

/// minimum change that counts as significant, per tracked value
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub temperature: f64,
    pub humidity: f64,
    pub soil_moisture: f64,
    pub water_level: f64,
    pub light_level: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            humidity: 2.0,
            soil_moisture: 5.0,
            water_level: 1.0,
            light_level: 10.0,
        }
    }
}

impl Thresholds {
    /// (primary, secondary) thresholds for a group
    fn for_group(&self, group: ChannelGroup) -> (f64, f64) {
        match group {
            ChannelGroup::TemperatureHumidity => (self.humidity, self.temperature),
            ChannelGroup::SoilMoisture => (self.soil_moisture, f64::INFINITY),
            ChannelGroup::WaterLevel => (self.water_level, f64::INFINITY),
            ChannelGroup::LightLevel => (self.light_level, f64::INFINITY),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub heartbeat_seconds: i64,
    pub thresholds: Thresholds,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { heartbeat_seconds: 300, thresholds: Thresholds::default() }
    }
}

/// what the filter remembers about one group: the last accepted values
/// and when they were accepted. `None` means nothing accepted yet.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelState {
    pub last: Option<(Values, i64)>,
}

/// the accept/reject rule. pure: never touches `state`.
pub fn should_persist(
    group: ChannelGroup,
    values: &Values,
    now: i64,
    state: &ChannelState,
    config: &FilterConfig,
) -> bool {
    let Some((last, last_at)) = state.last else {
        return true;
    };

    if now.saturating_sub(last_at) >= config.heartbeat_seconds {
        return true;
    }

    let (primary, secondary) = config.thresholds.for_group(group);
    if (values.primary - last.primary).abs() >= primary {
        return true;
    }
    match (values.secondary, last.secondary) {
        (Some(new), Some(old)) => (new - old).abs() >= secondary,
        (None, None) => false,
        // a value appearing or disappearing is a change in itself
        _ => true,
    }
}

/// filter memory for every channel group
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FilterState {
    channels: [ChannelState; 4],
}

impl FilterState {
    pub fn channel(&self, group: ChannelGroup) -> &ChannelState {
        &self.channels[group.index()]
    }

    /// offer a sample. `None` values (upstream read failure) are always
    /// rejected and leave the state untouched.
    pub fn should_persist(&self, group: ChannelGroup, values: Option<&Values>, now: i64, config: &FilterConfig) -> bool {
        match values {
            Some(values) => should_persist(group, values, now, self.channel(group), config),
            None => false,
        }
    }

    /// record an accepted sample. only call after the sample was stored.
    pub fn accept(&mut self, group: ChannelGroup, values: Values, now: i64) {
        self.channels[group.index()].last = Some((values, now));
    }
}
