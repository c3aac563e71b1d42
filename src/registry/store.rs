//! SQLite store for job metadata and settings snapshots.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::bus::BusClient;
use crate::error::StorageError;
use crate::storage::Storage;

use super::kill::{BusKill, SignalKill, REMOTE_STOPPABLE_JOBS};

/// Row id of a job in the registry.
pub type JobId = i64;

/// Which running jobs an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Experiment(String),
    JobSource(String),
    JobName(String),
}

/// A currently-running job, as reported by [`ProcessRegistry::running_jobs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJob {
    pub job_name: String,
    pub pid: u32,
}

/// Durable registry of jobs on this device.
///
/// Cheap to clone; access goes through one connection with short-lived
/// transactions (one logical operation per call), so concurrent use from
/// multiple jobs in the same process serializes without external locking.
#[derive(Clone)]
pub struct ProcessRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl ProcessRegistry {
    /// Opens (creating if needed) the registry at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens the registry at its standard per-device location
    /// ([`Storage::registry_db_path`]), shared by every job on the device.
    pub fn open_default(storage: &Storage) -> Result<Self, StorageError> {
        Self::open(storage.registry_db_path())
    }

    /// In-memory registry, for tests and ephemeral tooling.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS job_metadata (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                unit        TEXT NOT NULL,
                experiment  TEXT NOT NULL,
                job_name    TEXT NOT NULL,
                job_source  TEXT NOT NULL,
                pid         INTEGER NOT NULL,
                is_running  INTEGER NOT NULL,
                started_at  TEXT NOT NULL,
                ended_at    TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_job_metadata_is_running
                ON job_metadata(is_running);
            CREATE INDEX IF NOT EXISTS idx_job_metadata_job_name
                ON job_metadata(job_name);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_job_metadata_identity
                ON job_metadata(unit, experiment, job_name);

            CREATE TABLE IF NOT EXISTS job_settings (
                job_id   INTEGER NOT NULL,
                setting  TEXT NOT NULL,
                value    TEXT,
                FOREIGN KEY(job_id) REFERENCES job_metadata(id),
                UNIQUE(setting, job_id)
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Registers a job as running, upserting by identity tuple.
    ///
    /// A stale row with the same `(unit, experiment, job_name)` is updated in
    /// place — same id, fresh `started_at`, cleared `ended_at` — so re-entry
    /// after a crash never duplicates the logical job.
    pub fn register_and_set_running(
        &self,
        unit: &str,
        experiment: &str,
        job_name: &str,
        job_source: &str,
        pid: u32,
    ) -> Result<JobId, StorageError> {
        let conn = self.lock_conn();
        let now = timestamp();

        let existing: Option<JobId> = conn
            .query_row(
                "SELECT id FROM job_metadata
                 WHERE unit = ?1 AND experiment = ?2 AND job_name = ?3",
                params![unit, experiment, job_name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE job_metadata
                     SET is_running = 1, pid = ?1, job_source = ?2,
                         started_at = ?3, ended_at = NULL
                     WHERE id = ?4",
                    params![pid, job_source, now, id],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO job_metadata
                        (unit, experiment, job_name, job_source, pid,
                         is_running, started_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, NULL)",
                    params![unit, experiment, job_name, job_source, pid, now],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    /// Marks the row not-running and stamps `ended_at`. The row stays for audit.
    pub fn set_not_running(&self, job_id: JobId) -> Result<(), StorageError> {
        self.lock_conn().execute(
            "UPDATE job_metadata SET is_running = 0, ended_at = ?1 WHERE id = ?2",
            params![timestamp(), job_id],
        )?;
        Ok(())
    }

    /// Whether any running row carries `job_name`.
    pub fn is_running(&self, job_name: &str) -> Result<bool, StorageError> {
        let count: i64 = self.lock_conn().query_row(
            "SELECT COUNT(*) FROM job_metadata WHERE job_name = ?1 AND is_running = 1",
            params![job_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Batched [`ProcessRegistry::is_running`], one answer per input name.
    pub fn is_running_batch(&self, job_names: &[&str]) -> Result<Vec<bool>, StorageError> {
        job_names.iter().map(|name| self.is_running(name)).collect()
    }

    /// Records the current value of `setting` in the snapshot table.
    /// `None` deletes the row (the setting became unset).
    pub fn upsert_setting(
        &self,
        job_id: JobId,
        setting: &str,
        value: Option<&str>,
    ) -> Result<(), StorageError> {
        let conn = self.lock_conn();
        match value {
            None => {
                conn.execute(
                    "DELETE FROM job_settings WHERE setting = ?1 AND job_id = ?2",
                    params![setting, job_id],
                )?;
            }
            Some(value) => {
                conn.execute(
                    "INSERT INTO job_settings (setting, value, job_id)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT (setting, job_id) DO UPDATE SET value = excluded.value",
                    params![setting, value, job_id],
                )?;
            }
        }
        Ok(())
    }

    /// Last snapshotted value of `setting` for `job_id`.
    pub fn setting(&self, job_id: JobId, setting: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .lock_conn()
            .query_row(
                "SELECT value FROM job_settings WHERE setting = ?1 AND job_id = ?2",
                params![setting, job_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// All running jobs matching `filter`, as `(job_name, pid)` pairs.
    pub fn running_jobs(&self, filter: &JobFilter) -> Result<Vec<RunningJob>, StorageError> {
        let conn = self.lock_conn();
        let (sql, arg): (&str, Option<&str>) = match filter {
            JobFilter::All => (
                "SELECT job_name, pid FROM job_metadata WHERE is_running = 1",
                None,
            ),
            JobFilter::Experiment(e) => (
                "SELECT job_name, pid FROM job_metadata
                 WHERE is_running = 1 AND experiment = ?1",
                Some(e),
            ),
            JobFilter::JobSource(s) => (
                "SELECT job_name, pid FROM job_metadata
                 WHERE is_running = 1 AND job_source = ?1",
                Some(s),
            ),
            JobFilter::JobName(n) => (
                "SELECT job_name, pid FROM job_metadata
                 WHERE is_running = 1 AND job_name = ?1",
                Some(n),
            ),
        };

        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(RunningJob {
                job_name: row.get(0)?,
                pid: row.get::<_, i64>(1)? as u32,
            })
        };
        let rows = match arg {
            Some(arg) => stmt.query_map(params![arg], map_row)?,
            None => stmt.query_map([], map_row)?,
        };
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Attempts to terminate every running job matching `filter`.
    ///
    /// Pump-type jobs are stopped with a `disconnected` bus command (the final
    /// publish is awaited for acknowledgement); everything else gets SIGTERM.
    /// Returns the number of jobs a termination action was *attempted* against,
    /// not a confirmation of clean shutdown.
    pub async fn kill(
        &self,
        filter: &JobFilter,
        client: &BusClient,
        topic_root: &str,
        unit: &str,
    ) -> Result<usize, StorageError> {
        let mut bus_kill = BusKill::new(topic_root, unit, client.clone());
        let mut signal_kill = SignalKill::new();

        for job in self.running_jobs(filter)? {
            if REMOTE_STOPPABLE_JOBS.contains(&job.job_name.as_str()) {
                bus_kill.append(job.job_name);
            } else {
                signal_kill.append(job.pid);
            }
        }

        Ok(bus_kill.kill_all().await + signal_kill.kill_all())
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
