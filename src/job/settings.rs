//! # Published settings of a background job.
//!
//! Each job declares its settings up front as a map of key →
//! [`SettingSpec`]. Publishing a value does three things atomically from the
//! caller's point of view:
//!
//! 1. retained publish on `{root}/{unit}/{experiment}/{job_name}/{key}`, so
//!    late observers see the current value immediately;
//! 2. snapshot upsert into the process registry's `job_settings` table;
//! 3. for `persist` settings, a write to the reboot-surviving cache so the
//!    value is recovered on the next run.
//!
//! Settings are versioned in **epochs**: any change to a non-`$state` setting
//! closes the current epoch, re-publishes a consolidated JSON snapshot of all
//! current values on the `{job_name}_settings` topic (exactly-once tier), and
//! opens a new epoch. Consumers that want a consistent view read the snapshot
//! instead of stitching individual topics together.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use log::warn;
use serde_json::json;

use crate::bus::{setting_topic, BusClient, QoS, STATE_SETTING};
use crate::error::JobError;
use crate::registry::{JobId, ProcessRegistry};
use crate::storage::Storage;

use super::state::JobState;

/// Declaration of one published setting.
#[derive(Debug, Clone, Copy)]
pub struct SettingSpec {
    /// Wire datatype hint for UIs ("float", "string", "boolean", "json").
    pub datatype: &'static str,
    /// Whether remote `/set` commands may change it.
    pub settable: bool,
    /// Whether the value is written to the persistent cache and recovered on
    /// the next run.
    pub persist: bool,
}

struct ChannelState {
    values: BTreeMap<String, String>,
    epoch_started_at: String,
}

struct Inner {
    client: BusClient,
    registry: ProcessRegistry,
    job_id: JobId,
    storage: Storage,
    topic_root: String,
    unit: String,
    experiment: String,
    job_name: String,
    specs: BTreeMap<String, SettingSpec>,
    state: Mutex<ChannelState>,
}

/// Handle to a job's published settings. Cheap to clone; all clones share
/// the same epoch and value state.
#[derive(Clone)]
pub struct SettingsChannel {
    inner: Arc<Inner>,
}

impl SettingsChannel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: BusClient,
        registry: ProcessRegistry,
        job_id: JobId,
        storage: Storage,
        topic_root: &str,
        unit: &str,
        experiment: &str,
        job_name: &str,
        specs: BTreeMap<String, SettingSpec>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                registry,
                job_id,
                storage,
                topic_root: topic_root.to_string(),
                unit: unit.to_string(),
                experiment: experiment.to_string(),
                job_name: job_name.to_string(),
                specs,
                state: Mutex::new(ChannelState {
                    values: BTreeMap::new(),
                    epoch_started_at: timestamp(),
                }),
            }),
        }
    }

    pub fn spec(&self, key: &str) -> Option<&SettingSpec> {
        self.inner.specs.get(key)
    }

    /// Whether `key` is declared and accepts remote `/set` commands.
    pub fn is_settable(&self, key: &str) -> bool {
        self.inner.specs.get(key).is_some_and(|s| s.settable)
    }

    /// Current in-memory value of `key`, if it has been published.
    pub fn current(&self, key: &str) -> Option<String> {
        self.lock_state().values.get(key).cloned()
    }

    /// Recovered value of a `persist` setting from the reboot-surviving cache,
    /// if one was written by a previous run.
    pub(crate) fn recover_persisted(&self, key: &str) -> Result<Option<String>, JobError> {
        let cache = self.inner.storage.persistent(&self.inner.job_name)?;
        Ok(cache.get(&self.persist_key(key))?)
    }

    /// Publishes `value` on `key` and rotates the settings epoch.
    ///
    /// Undeclared keys are rejected with [`JobError::InvalidSetting`].
    pub fn publish(&self, key: &str, value: &str) -> Result<(), JobError> {
        self.write(key, value)?;
        self.rotate_epoch()?;
        Ok(())
    }

    /// Publishes `value` on `key` without rotating the epoch. Used at startup
    /// to populate initial values inside the first epoch.
    pub(crate) fn seed(&self, key: &str, value: &str) -> Result<(), JobError> {
        self.write(key, value)
    }

    /// Publishes the retained `$state` value. State changes do not rotate the
    /// settings epoch.
    pub(crate) fn publish_state(&self, state: JobState) -> Result<(), JobError> {
        let topic = setting_topic(
            &self.inner.topic_root,
            &self.inner.unit,
            &self.inner.experiment,
            &self.inner.job_name,
            STATE_SETTING,
        );
        self.inner
            .client
            .publish(topic, state.as_str(), QoS::ExactlyOnce, true);
        self.inner
            .registry
            .upsert_setting(self.inner.job_id, STATE_SETTING, Some(state.as_str()))
            .map_err(JobError::from)
    }

    /// Clears retained values for every declared setting (empty retained
    /// payload removes the slot). `$state` is left alone: the final
    /// `disconnected` must stay observable.
    pub(crate) fn clear_retained(&self) {
        for key in self.inner.specs.keys() {
            let topic = self.topic_for(key);
            self.inner.client.publish(topic, "", QoS::AtLeastOnce, true);
        }
        let snapshot_topic = self.snapshot_topic();
        self.inner
            .client
            .publish(snapshot_topic, "", QoS::AtLeastOnce, true);
    }

    fn write(&self, key: &str, value: &str) -> Result<(), JobError> {
        let Some(spec) = self.inner.specs.get(key) else {
            return Err(JobError::InvalidSetting {
                key: key.to_string(),
                reason: "not a declared setting".to_string(),
            });
        };

        self.inner
            .client
            .publish(self.topic_for(key), value, QoS::AtLeastOnce, true);
        self.inner
            .registry
            .upsert_setting(self.inner.job_id, key, Some(value))?;

        if spec.persist {
            let cache = self.inner.storage.persistent(&self.inner.job_name)?;
            cache.set(&self.persist_key(key), value)?;
        }

        self.lock_state()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Closes the current epoch and opens a new one, publishing the
    /// consolidated snapshot of all current values.
    fn rotate_epoch(&self) -> Result<(), JobError> {
        let now = timestamp();
        let snapshot = {
            let mut state = self.lock_state();
            let snapshot = json!({
                "settings": state.values,
                "started_at": state.epoch_started_at,
                "ended_at": now,
            });
            state.epoch_started_at = now;
            snapshot
        };

        let payload = serde_json::to_string(&snapshot).unwrap_or_else(|err| {
            warn!(
                "settings snapshot for `{}` failed to serialize: {err}",
                self.inner.job_name
            );
            String::new()
        });
        self.inner
            .client
            .publish(self.snapshot_topic(), payload, QoS::ExactlyOnce, true);
        Ok(())
    }

    fn topic_for(&self, key: &str) -> String {
        setting_topic(
            &self.inner.topic_root,
            &self.inner.unit,
            &self.inner.experiment,
            &self.inner.job_name,
            key,
        )
    }

    fn snapshot_topic(&self) -> String {
        setting_topic(
            &self.inner.topic_root,
            &self.inner.unit,
            &self.inner.experiment,
            &self.inner.job_name,
            &format!("{}_settings", self.inner.job_name),
        )
    }

    fn persist_key(&self, key: &str) -> String {
        format!("{}:{key}", self.inner.experiment)
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use tempfile::TempDir;

    fn channel() -> (TempDir, Bus, ProcessRegistry, JobId, SettingsChannel) {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::with_dirs(dir.path().join("tmp"), dir.path().join("data"));
        let bus = Bus::new(32);
        let registry = ProcessRegistry::open_in_memory().expect("registry");
        let job_id = registry
            .register_and_set_running("u1", "exp01", "stirring", "user", 42)
            .expect("register");

        let mut specs = BTreeMap::new();
        specs.insert(
            "target_rpm".to_string(),
            SettingSpec {
                datatype: "float",
                settable: true,
                persist: true,
            },
        );
        specs.insert(
            "measured_rpm".to_string(),
            SettingSpec {
                datatype: "float",
                settable: false,
                persist: false,
            },
        );

        let channel = SettingsChannel::new(
            bus.client(),
            registry.clone(),
            job_id,
            storage,
            "biovisor",
            "u1",
            "exp01",
            "stirring",
            specs,
        );
        (dir, bus, registry, job_id, channel)
    }

    #[tokio::test]
    async fn publish_retains_and_snapshots() {
        let (_dir, bus, registry, job_id, channel) = channel();

        channel.publish("target_rpm", "500").expect("publish");

        assert_eq!(
            bus.retained("biovisor/u1/exp01/stirring/target_rpm")
                .as_deref(),
            Some("500")
        );
        assert_eq!(
            registry.setting(job_id, "target_rpm").expect("get").as_deref(),
            Some("500")
        );
        assert_eq!(channel.current("target_rpm").as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn undeclared_key_is_rejected() {
        let (_dir, bus, _registry, _job_id, channel) = channel();

        let err = channel.publish("volume", "2.0").expect_err("undeclared");
        assert_eq!(err.as_label(), "invalid_setting");
        assert!(bus.retained("biovisor/u1/exp01/stirring/volume").is_none());
    }

    #[tokio::test]
    async fn change_rotates_epoch_with_consolidated_snapshot() {
        let (_dir, bus, _registry, _job_id, channel) = channel();

        channel.publish("target_rpm", "500").expect("publish");
        let first: serde_json::Value = serde_json::from_str(
            &bus.retained("biovisor/u1/exp01/stirring/stirring_settings")
                .expect("snapshot"),
        )
        .expect("json");
        assert_eq!(first["settings"]["target_rpm"], "500");

        channel.publish("target_rpm", "650").expect("publish");
        let second: serde_json::Value = serde_json::from_str(
            &bus.retained("biovisor/u1/exp01/stirring/stirring_settings")
                .expect("snapshot"),
        )
        .expect("json");
        assert_eq!(second["settings"]["target_rpm"], "650");

        // The second epoch opened when the first closed.
        assert_eq!(second["started_at"], first["ended_at"]);
    }

    #[tokio::test]
    async fn persisted_setting_recovers_across_channels() {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::with_dirs(dir.path().join("tmp"), dir.path().join("data"));
        let bus = Bus::new(32);
        let registry = ProcessRegistry::open_in_memory().expect("registry");
        let job_id = registry
            .register_and_set_running("u1", "exp01", "stirring", "user", 42)
            .expect("register");

        let mut specs = BTreeMap::new();
        specs.insert(
            "target_rpm".to_string(),
            SettingSpec {
                datatype: "float",
                settable: true,
                persist: true,
            },
        );

        let make = || {
            SettingsChannel::new(
                bus.client(),
                registry.clone(),
                job_id,
                storage.clone(),
                "biovisor",
                "u1",
                "exp01",
                "stirring",
                specs.clone(),
            )
        };

        make().publish("target_rpm", "725").expect("publish");

        let recovered = make()
            .recover_persisted("target_rpm")
            .expect("recover")
            .expect("present");
        assert_eq!(recovered, "725");
    }

    #[tokio::test]
    async fn clear_retained_removes_values_but_not_state() {
        let (_dir, bus, _registry, _job_id, channel) = channel();

        channel.publish_state(JobState::Ready).expect("state");
        channel.publish("target_rpm", "500").expect("publish");
        channel.clear_retained();

        assert!(bus
            .retained("biovisor/u1/exp01/stirring/target_rpm")
            .is_none());
        assert!(bus
            .retained("biovisor/u1/exp01/stirring/stirring_settings")
            .is_none());
        assert_eq!(
            bus.retained("biovisor/u1/exp01/stirring/$state").as_deref(),
            Some("ready")
        );
    }
}
