//! ==============================================================================
//! store.rs - durable local queue (sqlite)
//! ==============================================================================
//!
//! purpose:
//!     every accepted sample becomes a row here before anything is sent
//!     anywhere. rows start unsynced and are flipped to synced only after
//!     the remote side confirmed the whole sync cycle.
//!
//! layout:
//!     one table per channel group, compatible with databases written by the
//!     earlier controller builds:
//!
//!         temp_hum_data       (id, humidity, temperature, timestamp, synced)
//!         soil_moisture_data  (id, humidity, timestamp, synced)
//!         water_level_data    (id, has_water, timestamp, synced)
//!         light_level_data    (id, light, timestamp, synced)
//!
//!     tables created before the synced column existed get it added with a
//!     default of 0: nothing old is assumed delivered.
//!
//! durability:
//!     WAL journal + synchronous=FULL. a single INSERT is atomic, so a crash
//!     leaves either the whole row or nothing.
//!
//! ==============================================================================

use crate::domain::{ChannelGroup, NewReading, PersistedReading, ReadingKey};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// table and value columns for a group
struct TableLayout {
    table: &'static str,
    value1: &'static str,
    value2: Option<&'static str>,
}

fn table_layout(group: ChannelGroup) -> TableLayout {
    match group {
        ChannelGroup::TemperatureHumidity => TableLayout {
            table: "temp_hum_data",
            value1: "humidity",
            value2: Some("temperature"),
        },
        ChannelGroup::SoilMoisture => TableLayout {
            table: "soil_moisture_data",
            value1: "humidity",
            value2: None,
        },
        ChannelGroup::WaterLevel => TableLayout {
            table: "water_level_data",
            value1: "has_water",
            value2: None,
        },
        ChannelGroup::LightLevel => TableLayout {
            table: "light_level_data",
            value1: "light",
            value2: None,
        },
    }
}

/// number of rows flipped (0 or 1)
fn mark_row(conn: &Connection, key: ReadingKey) -> Result<usize, rusqlite::Error> {
    let layout = table_layout(key.group);
    conn.execute(
        &format!("UPDATE {} SET synced = 1 WHERE id = ?1 AND synced = 0", layout.table),
        [key.id],
    )
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        tracing::debug!(journal_mode = %mode, "store opened");

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        for group in ChannelGroup::ALL {
            let layout = table_layout(group);
            let value_columns = match layout.value2 {
                Some(v2) => format!("{} REAL, {} REAL", layout.value1, v2),
                None => format!("{} REAL", layout.value1),
            };
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    {value_columns},
                    timestamp INTEGER NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0
                );",
                table = layout.table,
            ))?;

            if !self.has_column(layout.table, "synced")? {
                tracing::info!(table = layout.table, "adding synced column to legacy table");
                self.conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN synced INTEGER NOT NULL DEFAULT 0;",
                    layout.table
                ))?;
            }

            self.conn.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table}(synced);",
                table = layout.table
            ))?;
        }
        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let mut names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        Ok(names.any(|name| name.map(|n| n == column).unwrap_or(false)))
    }

    /// insert a new unsynced row and return its id
    pub fn append(&self, reading: &NewReading) -> Result<i64, StoreError> {
        let layout = table_layout(reading.group);
        match layout.value2 {
            Some(v2) => self.conn.execute(
                &format!(
                    "INSERT INTO {} ({}, {}, timestamp, synced) VALUES (?1, ?2, ?3, 0)",
                    layout.table, layout.value1, v2
                ),
                params![reading.values.primary, reading.values.secondary, reading.timestamp],
            )?,
            None => self.conn.execute(
                &format!(
                    "INSERT INTO {} ({}, timestamp, synced) VALUES (?1, ?2, 0)",
                    layout.table, layout.value1
                ),
                params![reading.values.primary, reading.timestamp],
            )?,
        };
        Ok(self.conn.last_insert_rowid())
    }

    /// unsynced rows of every group, oldest first within a group, at most
    /// `max_per_group` rows per group
    pub fn list_unsynced(&self, max_per_group: usize) -> Result<Vec<PersistedReading>, StoreError> {
        let mut readings = Vec::new();
        for group in ChannelGroup::ALL {
            let layout = table_layout(group);
            let value2 = layout.value2.unwrap_or("NULL");
            let mut stmt = self.conn.prepare(&format!(
                "SELECT id, {}, {}, timestamp FROM {} WHERE synced = 0 ORDER BY timestamp, id LIMIT ?1",
                layout.value1, value2, layout.table
            ))?;
            let rows = stmt.query_map([max_per_group as i64], |row| {
                Ok(PersistedReading {
                    key: ReadingKey { group, id: row.get(0)? },
                    value1: row.get::<_, Option<f64>>(1)?.unwrap_or_default(),
                    value2: row.get(2)?,
                    timestamp: row.get(3)?,
                    synced: false,
                })
            })?;
            for row in rows {
                readings.push(row?);
            }
        }
        Ok(readings)
    }

    /// flip one row to synced. marking an already-synced (or missing) row
    /// is a no-op. single-row form of `mark_synced_all`, used by tests.
    #[cfg(test)]
    pub fn mark_synced(&self, key: ReadingKey) -> Result<(), StoreError> {
        mark_row(&self.conn, key)?;
        Ok(())
    }

    /// mark several rows in one transaction; all or none
    pub fn mark_synced_all(&mut self, keys: &[ReadingKey]) -> Result<usize, StoreError> {
        let tx = self.conn.transaction()?;
        let mut changed = 0;
        for key in keys {
            changed += mark_row(&tx, *key)?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// rows still waiting for delivery, across all groups
    pub fn unsynced_count(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for group in ChannelGroup::ALL {
            let layout = table_layout(group);
            let count: i64 = self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE synced = 0", layout.table),
                [],
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }

    /// look a row up regardless of its synced flag
    #[cfg(test)]
    pub fn get(&self, key: ReadingKey) -> Result<Option<PersistedReading>, StoreError> {
        use rusqlite::OptionalExtension;

        let layout = table_layout(key.group);
        let value2 = layout.value2.unwrap_or("NULL");
        let reading = self
            .conn
            .query_row(
                &format!(
                    "SELECT {}, {}, timestamp, synced FROM {} WHERE id = ?1",
                    layout.value1, value2, layout.table
                ),
                [key.id],
                |row| {
                    Ok(PersistedReading {
                        key,
                        value1: row.get::<_, Option<f64>>(0)?.unwrap_or_default(),
                        value2: row.get(1)?,
                        timestamp: row.get(2)?,
                        synced: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(reading)
    }
}
