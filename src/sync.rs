//! ==============================================================================
//! sync.rs - sync engine
//! ==============================================================================
//!
//! purpose:
//!     drains the local queue to the remote readings table.
//!
//! one cycle:
//!     1. fetch unsynced rows (bounded per group)
//!     2. map each row to one or two canonical records; rows whose group has
//!        no remote sensor id configured are left out, and stay unsynced
//!     3. cut the records into fixed-size batches
//!     4. send batches in order, stop at the first failure
//!     5. only if every batch went through, mark the delivered rows synced
//!        (one transaction)
//!
//!     a failure anywhere means nothing is marked, so the same rows go out
//!     again next cycle. duplicates on the remote side are possible,
//!     losses are not.
//!
//! ==============================================================================

use crate::config::{RemoteConfig, Units};
use crate::domain::{CanonicalReading, ChannelGroup, PersistedReading, ReadingKey};
use crate::store::{Store, StoreError};
use crate::transport::TransportError;
use std::future::Future;
use thiserror::Error;

/// anything that can deliver one batch of canonical records
pub trait Transport {
    fn send_batch(&self, batch: &[CanonicalReading]) -> impl Future<Output = Result<(), TransportError>>;
}

// ==============================================================================
// mapping
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSensor {
    pub id: String,
    pub unit: String,
}

/// remote sensor for every tracked value, `None` when unconfigured
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorMap {
    pub humidity: Option<RemoteSensor>,
    pub temperature: Option<RemoteSensor>,
    pub soil_moisture: Option<RemoteSensor>,
    pub water_level: Option<RemoteSensor>,
    pub light_level: Option<RemoteSensor>,
}

impl SensorMap {
    pub fn from_config(remote: &RemoteConfig) -> Self {
        let Units { humidity, temperature, soil_moisture, water_level, light_level } = &remote.units;
        let sensor = |id: &Option<String>, unit: &String| {
            id.as_ref().map(|id| RemoteSensor { id: id.clone(), unit: unit.clone() })
        };
        Self {
            humidity: sensor(&remote.sensors.humidity, humidity),
            temperature: sensor(&remote.sensors.temperature, temperature),
            soil_moisture: sensor(&remote.sensors.soil_moisture, soil_moisture),
            water_level: sensor(&remote.sensors.water_level, water_level),
            light_level: sensor(&remote.sensors.light_level, light_level),
        }
    }

    /// groups whose rows cannot currently be delivered in full
    pub fn unmapped_groups(&self) -> Vec<ChannelGroup> {
        ChannelGroup::ALL
            .into_iter()
            .filter(|&group| match group {
                ChannelGroup::TemperatureHumidity => self.humidity.is_none() || self.temperature.is_none(),
                ChannelGroup::SoilMoisture => self.soil_moisture.is_none(),
                ChannelGroup::WaterLevel => self.water_level.is_none(),
                ChannelGroup::LightLevel => self.light_level.is_none(),
            })
            .collect()
    }
}

/// canonical records for one stored row.
///
/// temperature-humidity yields humidity and temperature records sharing the
/// row's timestamp. the row is all or nothing: if any value it carries has no
/// sensor id configured, no record is built and the row stays unsynced.
/// every other group yields at most one record.
pub fn to_canonical(
    reading: &PersistedReading,
    sensors: &SensorMap,
    metadata: Option<&serde_json::Value>,
) -> Vec<CanonicalReading> {
    let record = |sensor: &RemoteSensor, value: f64| CanonicalReading {
        sensor_id: sensor.id.clone(),
        value,
        unit: sensor.unit.clone(),
        timestamp: reading.timestamp,
        metadata: metadata.cloned(),
    };

    let mut records = Vec::with_capacity(2);
    match reading.key.group {
        ChannelGroup::TemperatureHumidity => {
            let Some(humidity) = &sensors.humidity else {
                return records;
            };
            match (&sensors.temperature, reading.value2) {
                (Some(temperature), Some(value)) => {
                    records.push(record(humidity, reading.value1));
                    records.push(record(temperature, value));
                }
                (_, None) => records.push(record(humidity, reading.value1)),
                (None, Some(_)) => {}
            }
        }
        ChannelGroup::SoilMoisture => records.extend(sensors.soil_moisture.as_ref().map(|s| record(s, reading.value1))),
        ChannelGroup::WaterLevel => records.extend(sensors.water_level.as_ref().map(|s| record(s, reading.value1))),
        ChannelGroup::LightLevel => records.extend(sensors.light_level.as_ref().map(|s| record(s, reading.value1))),
    }
    records
}

// ==============================================================================
// engine
// ==============================================================================

#[derive(Debug, Error)]
pub enum SyncFailure {
    #[error("batch {batch} of {total} failed: {error}")]
    Transport {
        batch: usize,
        total: usize,
        #[source]
        error: TransportError,
    },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// outcome of one cycle
#[derive(Debug, Default)]
pub struct SyncReport {
    /// unsynced rows fetched from the queue
    pub fetched: usize,
    /// rows skipped because their group has no remote sensor
    pub unmapped: usize,
    /// canonical records built
    pub records: usize,
    pub batches_sent: usize,
    pub batches_total: usize,
    /// rows flipped to synced
    pub marked: usize,
    pub failure: Option<SyncFailure>,
}

pub struct SyncEngine {
    sensors: SensorMap,
    batch_size: usize,
    max_per_group: usize,
    metadata: Option<serde_json::Value>,
}

impl SyncEngine {
    pub fn new(sensors: SensorMap, batch_size: usize, max_per_group: usize, device_id: Option<&str>) -> Self {
        Self {
            sensors,
            batch_size: batch_size.max(1),
            max_per_group: max_per_group.max(1),
            metadata: device_id.map(|id| serde_json::json!({ "device_id": id })),
        }
    }

    pub fn from_config(remote: &RemoteConfig, max_per_group: usize) -> Self {
        Self::new(SensorMap::from_config(remote), remote.batch_size, max_per_group, remote.device_id.as_deref())
    }

    pub fn sensors(&self) -> &SensorMap {
        &self.sensors
    }

    pub async fn sync_once<T: Transport>(&self, store: &mut Store, transport: &T) -> SyncReport {
        let mut report = SyncReport::default();

        let pending = match store.list_unsynced(self.max_per_group) {
            Ok(pending) => pending,
            Err(e) => {
                report.failure = Some(e.into());
                return report;
            }
        };
        report.fetched = pending.len();

        let mut records = Vec::new();
        let mut delivered: Vec<ReadingKey> = Vec::new();
        for reading in &pending {
            let mapped = to_canonical(reading, &self.sensors, self.metadata.as_ref());
            if mapped.is_empty() {
                report.unmapped += 1;
                continue;
            }
            delivered.push(reading.key);
            records.extend(mapped);
        }
        report.records = records.len();

        if records.is_empty() {
            return report;
        }

        let batches: Vec<&[CanonicalReading]> = records.chunks(self.batch_size).collect();
        report.batches_total = batches.len();
        for (i, batch) in batches.iter().enumerate() {
            if let Err(error) = transport.send_batch(batch).await {
                report.failure = Some(SyncFailure::Transport { batch: i + 1, total: batches.len(), error });
                return report;
            }
            report.batches_sent += 1;
        }

        match store.mark_synced_all(&delivered) {
            Ok(marked) => report.marked = marked,
            Err(e) => report.failure = Some(e.into()),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewReading, Values};
    use std::cell::RefCell;

    /// records every batch; fails the batches whose 1-based index is listed
    #[derive(Default)]
    struct MockTransport {
        sent: RefCell<Vec<Vec<CanonicalReading>>>,
        attempts: RefCell<usize>,
        fail_on: Vec<usize>,
    }

    impl MockTransport {
        fn failing_on(batches: &[usize]) -> Self {
            Self { fail_on: batches.to_vec(), ..Self::default() }
        }
    }

    impl Transport for MockTransport {
        async fn send_batch(&self, batch: &[CanonicalReading]) -> Result<(), TransportError> {
            let attempt = {
                let mut attempts = self.attempts.borrow_mut();
                *attempts += 1;
                *attempts
            };
            if self.fail_on.contains(&attempt) {
                return Err(TransportError::Status { status: 503, body: "unavailable".to_string() });
            }
            self.sent.borrow_mut().push(batch.to_vec());
            Ok(())
        }
    }

    fn sensor(id: &str, unit: &str) -> Option<RemoteSensor> {
        Some(RemoteSensor { id: id.to_string(), unit: unit.to_string() })
    }

    fn all_sensors() -> SensorMap {
        SensorMap {
            humidity: sensor("hum", "percent"),
            temperature: sensor("temp", "celsius"),
            soil_moisture: sensor("soil", "percent"),
            water_level: sensor("water", "boolean"),
            light_level: sensor("light", "raw"),
        }
    }

    fn fill(store: &Store, group: ChannelGroup, count: i64) {
        for ts in 0..count {
            let values = match group {
                ChannelGroup::TemperatureHumidity => Values::pair(50.0, 20.0),
                _ => Values::single(ts as f64),
            };
            store.append(&NewReading { group, values, timestamp: 1_000 + ts }).unwrap();
        }
    }

    #[tokio::test]
    async fn test_successful_cycle_marks_everything() {
        let mut store = Store::open_in_memory().unwrap();
        fill(&store, ChannelGroup::SoilMoisture, 3);
        fill(&store, ChannelGroup::TemperatureHumidity, 1);
        let engine = SyncEngine::new(all_sensors(), 50, 100, Some("pi-1"));
        let transport = MockTransport::default();

        let report = engine.sync_once(&mut store, &transport).await;

        assert!(report.failure.is_none());
        assert_eq!((report.fetched, report.records, report.marked), (4, 5, 4));
        assert_eq!(store.unsynced_count().unwrap(), 0);
        let sent = transport.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].iter().all(|r| r.metadata == Some(serde_json::json!({"device_id": "pi-1"}))));
    }

    #[tokio::test]
    async fn test_failed_middle_batch_marks_nothing() {
        let mut store = Store::open_in_memory().unwrap();
        fill(&store, ChannelGroup::LightLevel, 5);
        let before = store.list_unsynced(100).unwrap();
        // batch size 2 -> batches of 2, 2, 1
        let engine = SyncEngine::new(all_sensors(), 2, 100, None);
        let transport = MockTransport::failing_on(&[2]);

        let report = engine.sync_once(&mut store, &transport).await;

        assert_eq!(report.batches_total, 3);
        assert_eq!(report.batches_sent, 1);
        assert_eq!(report.marked, 0);
        assert!(matches!(report.failure, Some(SyncFailure::Transport { batch: 2, total: 3, .. })));
        // batch 3 was never attempted
        assert_eq!(*transport.attempts.borrow(), 2);
        assert_eq!(store.list_unsynced(100).unwrap(), before);
    }

    #[tokio::test]
    async fn test_next_cycle_resends_the_same_rows() {
        let mut store = Store::open_in_memory().unwrap();
        fill(&store, ChannelGroup::WaterLevel, 3);
        let engine = SyncEngine::new(all_sensors(), 2, 100, None);

        let first = engine.sync_once(&mut store, &MockTransport::failing_on(&[1])).await;
        assert!(first.failure.is_some());

        let transport = MockTransport::default();
        let second = engine.sync_once(&mut store, &transport).await;
        assert!(second.failure.is_none());
        assert_eq!(second.marked, 3);
        let values: Vec<f64> = transport.sent.borrow().iter().flatten().map(|r| r.value).collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_unmapped_rows_stay_unsynced() {
        let mut store = Store::open_in_memory().unwrap();
        fill(&store, ChannelGroup::SoilMoisture, 2);
        fill(&store, ChannelGroup::LightLevel, 2);
        let sensors = SensorMap { light_level: None, ..all_sensors() };
        let engine = SyncEngine::new(sensors, 50, 100, None);

        for _ in 0..3 {
            let report = engine.sync_once(&mut store, &MockTransport::default()).await;
            assert!(report.failure.is_none());
            assert_eq!(report.unmapped, 2);
        }

        let left = store.list_unsynced(100).unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|r| r.key.group == ChannelGroup::LightLevel));
    }

    #[tokio::test]
    async fn test_nothing_to_send_touches_no_transport() {
        let mut store = Store::open_in_memory().unwrap();
        let engine = SyncEngine::new(all_sensors(), 50, 100, None);
        let transport = MockTransport::default();

        let report = engine.sync_once(&mut store, &transport).await;

        assert!(report.failure.is_none());
        assert_eq!(report.batches_total, 0);
        assert_eq!(*transport.attempts.borrow(), 0);
    }

    #[test]
    fn test_temperature_humidity_yields_two_records() {
        let reading = PersistedReading {
            key: ReadingKey { group: ChannelGroup::TemperatureHumidity, id: 1 },
            value1: 51.0,
            value2: Some(23.0),
            timestamp: 1_700_000_000,
            synced: false,
        };

        let records = to_canonical(&reading, &all_sensors(), None);
        let pairs: Vec<(&str, f64, &str, i64)> = records
            .iter()
            .map(|r| (r.sensor_id.as_str(), r.value, r.unit.as_str(), r.timestamp))
            .collect();
        assert_eq!(
            pairs,
            vec![("hum", 51.0, "percent", 1_700_000_000), ("temp", 23.0, "celsius", 1_700_000_000)]
        );

        let humidity_only = SensorMap { temperature: None, ..all_sensors() };
        assert!(to_canonical(&reading, &humidity_only, None).is_empty());
        let temperature_only = SensorMap { humidity: None, ..all_sensors() };
        assert!(to_canonical(&reading, &temperature_only, None).is_empty());
    }

    #[tokio::test]
    async fn test_half_mapped_temperature_humidity_stays_unsynced() {
        for sensors in [
            SensorMap { humidity: None, ..all_sensors() },
            SensorMap { temperature: None, ..all_sensors() },
        ] {
            let mut store = Store::open_in_memory().unwrap();
            store
                .append(&NewReading {
                    group: ChannelGroup::TemperatureHumidity,
                    values: Values::pair(55.0, 21.0),
                    timestamp: 1_000,
                })
                .unwrap();
            let transport = MockTransport::default();

            let report = SyncEngine::new(sensors.clone(), 50, 100, None).sync_once(&mut store, &transport).await;

            assert!(report.failure.is_none());
            assert_eq!((report.unmapped, report.marked), (1, 0));
            assert!(transport.sent.borrow().is_empty());
            assert_eq!(store.unsynced_count().unwrap(), 1);
            assert_eq!(sensors.unmapped_groups(), vec![ChannelGroup::TemperatureHumidity]);

            // once the missing id is configured the row goes out whole
            let transport = MockTransport::default();
            let report = SyncEngine::new(all_sensors(), 50, 100, None).sync_once(&mut store, &transport).await;
            assert_eq!(report.marked, 1);
            let values: Vec<f64> = transport.sent.borrow().iter().flatten().map(|r| r.value).collect();
            assert_eq!(values, vec![55.0, 21.0]);
        }
    }

    #[test]
    fn test_sensor_map_from_config() {
        let mut remote = RemoteConfig::default();
        remote.sensors.water_level = Some("w-1".to_string());
        remote.units.water_level = "state".to_string();

        let map = SensorMap::from_config(&remote);
        assert_eq!(map.water_level, sensor("w-1", "state"));
        assert_eq!(
            map.unmapped_groups(),
            vec![ChannelGroup::TemperatureHumidity, ChannelGroup::SoilMoisture, ChannelGroup::LightLevel]
        );
    }
}
