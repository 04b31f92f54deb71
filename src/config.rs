//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults, then lets the
//!     SUPABASE_* environment variables override the remote settings.
//!
//! structure:
//!     - PollingConfig: sampling and sync periods.
//!     - StorageConfig: where the sqlite queue lives, fetch bound per group.
//!     - SensorsConfig: dht pin/variant/retries, adc bus, water level source.
//!     - FilterConfig: heartbeat + deadband thresholds (see filter.rs).
//!     - RemoteConfig: endpoint, key, device id, per-channel sensor ids.
//!     - LoggingConfig: default log level, per-tick sample logging.
//!
//!     every section has defaults, so a partial file (or none) is fine.
//!
//! ==============================================================================

use crate::dht::{RetryPolicy, Timing, Variant};
use crate::filter::FilterConfig;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// explicit config path, checked before the default locations
pub const CONFIG_PATH_ENV: &str = "PHYTO_HOST_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostConfig {
    pub polling: PollingConfig,
    pub storage: StorageConfig,
    pub sensors: SensorsConfig,
    pub filter: FilterConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub sample_interval_seconds: u64,
    pub sync_interval_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { sample_interval_seconds: 2, sync_interval_seconds: 60 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub max_unsynced_per_group: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("sensor_data.db"), max_unsynced_per_group: 100 }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SensorsConfig {
    pub dht: DhtConfig,
    pub adc: AdcConfig,
    pub water_level: WaterLevelConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DhtConfig {
    pub enabled: bool,
    pub gpio_pin: u8,
    pub variant: Variant,
    /// a data-bit high phase longer than this is a one
    pub one_threshold_us: u64,
    pub attempts: u32,
    pub cooldown_ms: u64,
    pub elevate_priority: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gpio_pin: 21,
            variant: Variant::Dht11,
            one_threshold_us: 40,
            attempts: 3,
            cooldown_ms: 2_000,
            elevate_priority: true,
        }
    }
}

impl DhtConfig {
    pub fn timing(&self) -> Timing {
        Timing { one_threshold_us: self.one_threshold_us, ..Timing::default() }
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy { attempts: self.attempts, cooldown: Duration::from_millis(self.cooldown_ms) }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdcConfig {
    pub enabled: bool,
    pub i2c_bus: u8,
    /// accepts a number (`75`) or a hex string (`"0x4b"`)
    #[serde(deserialize_with = "deserialize_address")]
    pub i2c_address: u8,
    pub soil_moisture_channel: u8,
    pub light_level_channel: u8,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            i2c_bus: 1,
            i2c_address: 0x4b,
            soil_moisture_channel: 0,
            light_level_channel: 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum WaterLevelConfig {
    /// digital float switch, high = water present
    Gpio { pin: u8 },
    /// analog probe on an adc channel
    Adc { channel: u8 },
    Disabled,
}

impl Default for WaterLevelConfig {
    fn default() -> Self {
        WaterLevelConfig::Gpio { pin: 26 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub device_id: Option<String>,
    pub readings_path: String,
    pub timeout_seconds: u64,
    pub batch_size: usize,
    pub sensors: SensorIds,
    pub units: Units,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            device_id: None,
            readings_path: "/rest/v1/readings".to_string(),
            timeout_seconds: 10,
            batch_size: 50,
            sensors: SensorIds::default(),
            units: Units::default(),
        }
    }
}

/// remote sensor identifiers, one per tracked value
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SensorIds {
    pub humidity: Option<String>,
    pub temperature: Option<String>,
    pub soil_moisture: Option<String>,
    pub water_level: Option<String>,
    pub light_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Units {
    pub humidity: String,
    pub temperature: String,
    pub soil_moisture: String,
    pub water_level: String,
    pub light_level: String,
}

impl Default for Units {
    fn default() -> Self {
        Self {
            humidity: "percent".to_string(),
            temperature: "celsius".to_string(),
            soil_moisture: "percent".to_string(),
            water_level: "boolean".to_string(),
            light_level: "raw".to_string(),
        }
    }
}

impl RemoteConfig {
    /// endpoint and key, if both are set. `None` means local-only mode.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.api_url.as_deref(), self.api_key.as_deref()) {
            (Some(url), Some(key)) => Some((url, key)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

fn deserialize_address<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Address {
        Number(u8),
        Text(String),
    }

    match Address::deserialize(deserializer)? {
        Address::Number(n) => Ok(n),
        Address::Text(s) => {
            let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
            u8::from_str_radix(digits, 16)
                .map_err(|e| serde::de::Error::custom(format!("bad i2c address {:?}: {}", s, e)))
        }
    }
}

// ==============================================================================
// loading
// ==============================================================================

/// where the active configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigOrigin {
    File(PathBuf),
    Defaults,
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load with default fallback
    ///
    /// runs before the subscriber exists, so problems are handed back as
    /// warnings for the caller to log.
    pub fn load_or_default() -> (Self, ConfigOrigin, Vec<String>) {
        let mut warnings = Vec::new();
        let mut paths = Vec::new();
        if let Some(explicit) = std::env::var_os(CONFIG_PATH_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("host.toml"));
        paths.push(PathBuf::from("..").join("config").join("host.toml"));

        for path in paths {
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return (config, ConfigOrigin::File(path), warnings),
                    Err(e) => warnings.push(format!("{:#}", e)),
                }
            }
        }

        warnings.push("No config file found - using defaults".to_string());
        (Self::default(), ConfigOrigin::Defaults, warnings)
    }

    /// apply SUPABASE_* overrides. empty values count as unset and do not
    /// clear what the file configured.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let remote = &mut self.remote;

        let slots: [(&str, &mut Option<String>); 8] = [
            ("SUPABASE_URL", &mut remote.api_url),
            ("SUPABASE_ANON_KEY", &mut remote.api_key),
            ("SUPABASE_DEVICE_ID", &mut remote.device_id),
            ("SUPABASE_HUMIDITY_SENSOR_ID", &mut remote.sensors.humidity),
            ("SUPABASE_TEMPERATURE_SENSOR_ID", &mut remote.sensors.temperature),
            ("SUPABASE_SOIL_MOISTURE_SENSOR_ID", &mut remote.sensors.soil_moisture),
            ("SUPABASE_WATER_LEVEL_SENSOR_ID", &mut remote.sensors.water_level),
            ("SUPABASE_LIGHT_LEVEL_SENSOR_ID", &mut remote.sensors.light_level),
        ];
        for (name, slot) in slots {
            if let Some(value) = get(name) {
                *slot = Some(value);
            }
        }

        // an empty string in the file means "not configured" as well
        for slot in [
            &mut remote.api_url,
            &mut remote.api_key,
            &mut remote.device_id,
            &mut remote.sensors.humidity,
            &mut remote.sensors.temperature,
            &mut remote.sensors.soil_moisture,
            &mut remote.sensors.water_level,
            &mut remote.sensors.light_level,
        ] {
            if slot.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *slot = None;
            }
        }
    }

    /// Log configuration summary
    pub fn log_summary(&self, origin: &ConfigOrigin) {
        match origin {
            ConfigOrigin::File(path) => tracing::info!("[CONFIG] Loaded from {}", path.display()),
            ConfigOrigin::Defaults => tracing::info!("[CONFIG] Using built-in defaults"),
        }
        tracing::info!(
            sample_s = self.polling.sample_interval_seconds,
            sync_s = self.polling.sync_interval_seconds,
            db = %self.storage.path.display(),
            "[CONFIG] polling and storage"
        );
        tracing::info!(
            dht_pin = self.sensors.dht.gpio_pin,
            dht_variant = ?self.sensors.dht.variant,
            adc = self.sensors.adc.enabled,
            water = ?self.sensors.water_level,
            "[CONFIG] sensors"
        );
        tracing::info!(
            heartbeat_s = self.filter.heartbeat_seconds,
            thresholds = ?self.filter.thresholds,
            "[CONFIG] filter"
        );
        match self.remote.credentials() {
            Some((url, _)) => tracing::info!(
                endpoint = url,
                device = self.remote.device_id.as_deref().unwrap_or("-"),
                "[CONFIG] remote sync enabled"
            ),
            None => tracing::info!("[CONFIG] remote sync disabled (no endpoint/key)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = HostConfig::parse("").unwrap();
        assert_eq!(config.polling.sample_interval_seconds, 2);
        assert_eq!(config.polling.sync_interval_seconds, 60);
        assert_eq!(config.storage.max_unsynced_per_group, 100);
        assert_eq!(config.sensors.dht.gpio_pin, 21);
        assert_eq!(config.sensors.adc.i2c_address, 0x4b);
        assert_eq!(config.sensors.water_level, WaterLevelConfig::Gpio { pin: 26 });
        assert_eq!(config.filter.heartbeat_seconds, 300);
        assert_eq!(config.remote.readings_path, "/rest/v1/readings");
        assert_eq!(config.remote.batch_size, 50);
        assert_eq!(config.remote.units.water_level, "boolean");
        assert!(config.remote.credentials().is_none());
    }

    #[test]
    fn test_partial_file() {
        let config = HostConfig::parse(
            r#"
            [polling]
            sample_interval_seconds = 5

            [sensors.dht]
            variant = "dht22"
            gpio_pin = 4

            [sensors.adc]
            i2c_address = "0x48"

            [sensors.water_level]
            source = "adc"
            channel = 2

            [filter.thresholds]
            soil_moisture = 3.0

            [remote]
            api_url = "https://example.supabase.co"
            api_key = "anon"
            batch_size = 10

            [remote.sensors]
            temperature = "t-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.polling.sample_interval_seconds, 5);
        assert_eq!(config.polling.sync_interval_seconds, 60);
        assert_eq!(config.sensors.dht.variant, Variant::Dht22);
        assert_eq!(config.sensors.dht.gpio_pin, 4);
        assert_eq!(config.sensors.adc.i2c_address, 0x48);
        assert_eq!(config.sensors.water_level, WaterLevelConfig::Adc { channel: 2 });
        assert_eq!(config.filter.thresholds.soil_moisture, 3.0);
        assert_eq!(config.filter.thresholds.light_level, 10.0);
        assert_eq!(config.remote.credentials(), Some(("https://example.supabase.co", "anon")));
        assert_eq!(config.remote.batch_size, 10);
        assert_eq!(config.remote.sensors.temperature.as_deref(), Some("t-1"));
        assert_eq!(config.remote.sensors.humidity, None);
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = HostConfig::parse(include_str!("../config/host.toml")).unwrap();
        assert_eq!(config.sensors.water_level, WaterLevelConfig::Gpio { pin: 26 });
        assert_eq!(config.sensors.adc.i2c_address, 0x4b);
        assert!(config.remote.credentials().is_none());
    }

    #[test]
    fn test_water_level_can_be_disabled() {
        let config = HostConfig::parse("[sensors.water_level]\nsource = \"disabled\"\n").unwrap();
        assert_eq!(config.sensors.water_level, WaterLevelConfig::Disabled);
    }

    #[test]
    fn test_bad_address_is_rejected() {
        assert!(HostConfig::parse("[sensors.adc]\ni2c_address = \"0xZZ\"\n").is_err());
    }

    #[test]
    fn test_env_overrides_and_empty_values() {
        let mut config = HostConfig::parse(
            "[remote]\napi_url = \"https://file.example\"\ndevice_id = \"\"\n[remote.sensors]\nhumidity = \"h-file\"\n",
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("SUPABASE_ANON_KEY", "env-key"),
            ("SUPABASE_URL", ""),
            ("SUPABASE_LIGHT_LEVEL_SENSOR_ID", "light-env"),
            ("SUPABASE_HUMIDITY_SENSOR_ID", "  "),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        // empty env var leaves the file value alone
        assert_eq!(config.remote.api_url.as_deref(), Some("https://file.example"));
        assert_eq!(config.remote.api_key.as_deref(), Some("env-key"));
        assert_eq!(config.remote.device_id, None);
        assert_eq!(config.remote.sensors.humidity.as_deref(), Some("h-file"));
        assert_eq!(config.remote.sensors.light_level.as_deref(), Some("light-env"));
        assert!(config.remote.credentials().is_some());
    }

    #[test]
    fn test_dht_policy_from_config() {
        let dht = DhtConfig { attempts: 5, cooldown_ms: 250, one_threshold_us: 50, ..DhtConfig::default() };
        assert_eq!(dht.retry(), RetryPolicy { attempts: 5, cooldown: Duration::from_millis(250) });
        assert_eq!(dht.timing().one_threshold_us, 50);
        assert_eq!(dht.timing().bit_timeout_us, Timing::default().bit_timeout_us);
    }

    #[test]
    fn test_load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[polling\n").unwrap();
        let err = HostConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("host.toml"));
    }
}
