//! # Local key-value caches.
//!
//! Two cache classes, both namespaced by cache name (one SQLite file per
//! cache) and conventionally keyed per experiment:
//!
//! - [`Storage::ephemeral`] — lives under the tmp dir; cleared on device
//!   reboot. Used for last-known duty cycles and similar transient hardware
//!   state.
//! - [`Storage::persistent`] — survives reboot. Used for calibrations and the
//!   vial-volume/throughput accumulators.
//!
//! A [`Cache`] handle is opened per logical operation and dropped after, the
//! same short-lived-transaction discipline the process registry uses, so
//! concurrent access from multiple jobs in one process serializes cleanly.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::error::StorageError;

/// Handle to the two local cache directories. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Storage {
    ephemeral_dir: PathBuf,
    persistent_dir: PathBuf,
}

impl Storage {
    pub fn new(config: &Config) -> Self {
        Self {
            ephemeral_dir: config.ephemeral_dir.clone(),
            persistent_dir: config.persistent_dir.clone(),
        }
    }

    pub fn with_dirs(ephemeral_dir: impl Into<PathBuf>, persistent_dir: impl Into<PathBuf>) -> Self {
        Self {
            ephemeral_dir: ephemeral_dir.into(),
            persistent_dir: persistent_dir.into(),
        }
    }

    /// Opens the reboot-cleared cache `name`.
    pub fn ephemeral(&self, name: &str) -> Result<Cache, StorageError> {
        Cache::open(&self.ephemeral_dir, name)
    }

    /// Opens the reboot-surviving cache `name`.
    pub fn persistent(&self, name: &str) -> Result<Cache, StorageError> {
        Cache::open(&self.persistent_dir, name)
    }

    /// Path of the process registry database (shared by all jobs on a device;
    /// survives individual job crashes).
    pub fn registry_db_path(&self) -> PathBuf {
        self.ephemeral_dir.join("job_metadata.sqlite")
    }
}

/// One open key-value cache.
pub struct Cache {
    conn: Connection,
}

impl Cache {
    fn open(dir: &Path, name: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(format!("{name}.sqlite")))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self { conn })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StorageError::Decode {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    /// Like [`Cache::get`], but falls back to `default` when the key is absent.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, StorageError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|source| StorageError::Decode {
            key: key.to_string(),
            source,
        })?;
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, raw],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}
