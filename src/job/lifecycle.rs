//! # Background job lifecycle.
//!
//! A [`BackgroundJob`] owns the full contract a long-running device job must
//! honor:
//!
//! ```text
//!                 init ──► ready ◄──► sleeping
//!                            │           │
//!                            ▼           ▼
//!                         disconnecting ──► disconnected
//! ```
//!
//! On entry the job registers in the [`ProcessRegistry`], installs a
//! `$state = "lost"` last-will (so an unclean death is observable as a
//! retained `lost`), seeds its declared settings, and starts a command
//! listener on the `/set` topics. Remote controllers drive the job entirely
//! over the bus: `$state/set` transitions it, `{setting}/set` updates
//! settable values through the [`JobHooks::on_set`] hook.
//!
//! `ready ⇄ sleeping` pauses owned schedulers without cancelling them, so the
//! phase grid survives a nap. Disconnecting cancels schedulers with join
//! semantics, releases every held hardware claim, clears retained settings,
//! and marks the registry row not-running. Disconnect is idempotent and may
//! arrive concurrently from the local API and a remote command.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bus::{
    set_topic, setting_topic, Bus, BusClient, BusMessage, LastWill, QoS, STATE_SETTING,
    UNIVERSAL_EXPERIMENT, UNIVERSAL_UNIT,
};
use crate::config::Config;
use crate::error::JobError;
use crate::locks::{LockGuard, LockSet};
use crate::registry::{JobId, ProcessRegistry};
use crate::storage::Storage;
use crate::timer::PeriodicScheduler;

use super::settings::{SettingSpec, SettingsChannel};
use super::state::JobState;

/// Behavior a job plugs into the lifecycle.
///
/// All hooks have reasonable defaults; a settings-only job can use `()`.
#[async_trait]
pub trait JobHooks: Send + Sync {
    /// Runs between registration and `ready`. Claim hardware channels and
    /// start schedulers here. An error aborts startup: schedulers are
    /// cancelled, claims released, and the registry row marked not-running.
    async fn on_init(&self, job: &Arc<BackgroundJob>) -> Result<(), JobError> {
        let _ = job;
        Ok(())
    }

    /// Runs after every transition into `ready` (startup and wake-up).
    async fn on_ready(&self, job: &BackgroundJob) {
        let _ = job;
    }

    /// Runs after the job enters `sleeping`. Halt actuation here; owned
    /// schedulers are already paused.
    async fn on_sleeping(&self, job: &BackgroundJob) {
        let _ = job;
    }

    /// Runs at the start of disconnection, before schedulers are cancelled.
    async fn on_disconnecting(&self, job: &BackgroundJob) {
        let _ = job;
    }

    /// Handles a remote write to a settable key. The default accepts the
    /// value verbatim; override to validate or to trigger side effects.
    async fn on_set(&self, job: &BackgroundJob, key: &str, value: &str) -> Result<(), JobError> {
        job.settings().publish(key, value)
    }
}

#[async_trait]
impl JobHooks for () {}

/// Configures and enters a [`BackgroundJob`].
pub struct JobBuilder {
    topic_root: String,
    name: String,
    unit: String,
    experiment: String,
    job_source: String,
    specs: BTreeMap<String, SettingSpec>,
    defaults: BTreeMap<String, String>,
}

impl JobBuilder {
    pub fn new(config: &Config, name: &str, unit: &str, experiment: &str) -> Self {
        Self {
            topic_root: config.topic_root.clone(),
            name: name.to_string(),
            unit: unit.to_string(),
            experiment: experiment.to_string(),
            job_source: "user".to_string(),
            specs: BTreeMap::new(),
            defaults: BTreeMap::new(),
        }
    }

    /// Who started this job ("user", "experiment_profile", ...). Recorded in
    /// the registry for filtered kills.
    pub fn with_job_source(mut self, job_source: &str) -> Self {
        self.job_source = job_source.to_string();
        self
    }

    /// Declares a published setting.
    pub fn with_setting(mut self, key: &str, spec: SettingSpec) -> Self {
        self.specs.insert(key.to_string(), spec);
        self
    }

    /// Declares a published setting with an initial value. For `persist`
    /// settings a cached value from a previous run wins over the default.
    pub fn with_setting_default(mut self, key: &str, spec: SettingSpec, default: &str) -> Self {
        self.specs.insert(key.to_string(), spec);
        self.defaults.insert(key.to_string(), default.to_string());
        self
    }

    /// Registers, initializes, and brings the job to `ready`.
    pub async fn enter(
        self,
        bus: &Bus,
        registry: &ProcessRegistry,
        locks: &LockSet,
        storage: &Storage,
        hooks: Arc<dyn JobHooks>,
    ) -> Result<Arc<BackgroundJob>, JobError> {
        let job_id = registry.register_and_set_running(
            &self.unit,
            &self.experiment,
            &self.name,
            &self.job_source,
            std::process::id(),
        )?;

        // The will is installed before anything can fail mid-lifecycle: from
        // here on, an unclean death leaves a retained "lost".
        let will_topic = setting_topic(
            &self.topic_root,
            &self.unit,
            &self.experiment,
            &self.name,
            STATE_SETTING,
        );
        let client = bus.client_with_will(LastWill {
            topic: will_topic,
            payload: JobState::Lost.as_str().to_string(),
            qos: QoS::ExactlyOnce,
            retain: true,
        });

        let settings = SettingsChannel::new(
            client.clone(),
            registry.clone(),
            job_id,
            storage.clone(),
            &self.topic_root,
            &self.unit,
            &self.experiment,
            &self.name,
            self.specs.clone(),
        );

        if let Err(err) = self.seed_settings(&settings) {
            client.disconnect();
            if let Err(err) = registry.set_not_running(job_id) {
                warn!("{}: failed to deregister after aborted startup: {err}", self.name);
            }
            return Err(err);
        }

        let (state_tx, _state_rx) = watch::channel(JobState::Init);
        let filters = self.command_filters();

        let job = Arc::new(BackgroundJob {
            name: self.name,
            unit: self.unit,
            experiment: self.experiment,
            settings,
            registry: registry.clone(),
            job_id,
            client: client.clone(),
            locks: locks.clone(),
            hooks,
            state_tx,
            claims: Mutex::new(Vec::new()),
            schedulers: tokio::sync::Mutex::new(Vec::new()),
            interrupt: CancellationToken::new(),
            disconnect_started: AtomicBool::new(false),
        });

        if let Err(err) = job.transition(JobState::Init) {
            job.abort_startup().await;
            return Err(err);
        }

        // The listener holds only a weak reference: if every caller handle is
        // dropped without a clean disconnect, the job drops, the client drops,
        // and the last-will fires — the crash contract.
        let mut sub = client.subscribe(filters);
        let weak = Arc::downgrade(&job);
        let interrupt = job.interrupt();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interrupt.cancelled() => break,
                    msg = sub.recv() => match msg {
                        Some(msg) => {
                            let Some(job) = weak.upgrade() else { break };
                            job.handle_command(&msg).await;
                        }
                        None => break,
                    },
                }
            }
        });

        let hooks = Arc::clone(&job.hooks);
        if let Err(err) = hooks.on_init(&job).await {
            error!("{}: init hook failed ({})", job.name, err.as_label());
            job.abort_startup().await;
            return Err(err);
        }

        if let Err(err) = job.transition(JobState::Ready) {
            job.abort_startup().await;
            return Err(err);
        }
        hooks.on_ready(&job).await;
        info!("{}: ready", job.name);
        Ok(job)
    }

    fn seed_settings(&self, settings: &SettingsChannel) -> Result<(), JobError> {
        for (key, spec) in &self.specs {
            let recovered = if spec.persist {
                settings.recover_persisted(key)?
            } else {
                None
            };
            let value = recovered.or_else(|| self.defaults.get(key).cloned());
            if let Some(value) = value {
                settings.seed(key, &value)?;
            }
        }
        Ok(())
    }

    /// The command listener covers every declared `/set` topic plus the
    /// universal `$state/set` addressing variants (broadcast unit, universal
    /// experiment, and both at once).
    fn command_filters(&self) -> Vec<String> {
        vec![
            set_topic(&self.topic_root, &self.unit, &self.experiment, &self.name, "+"),
            set_topic(
                &self.topic_root,
                UNIVERSAL_UNIT,
                &self.experiment,
                &self.name,
                STATE_SETTING,
            ),
            set_topic(
                &self.topic_root,
                &self.unit,
                UNIVERSAL_EXPERIMENT,
                &self.name,
                STATE_SETTING,
            ),
            set_topic(
                &self.topic_root,
                UNIVERSAL_UNIT,
                UNIVERSAL_EXPERIMENT,
                &self.name,
                STATE_SETTING,
            ),
        ]
    }
}

/// A long-running job wired into the bus, registry, and lock set.
pub struct BackgroundJob {
    name: String,
    unit: String,
    experiment: String,
    settings: SettingsChannel,
    registry: ProcessRegistry,
    job_id: JobId,
    client: BusClient,
    locks: LockSet,
    hooks: Arc<dyn JobHooks>,
    state_tx: watch::Sender<JobState>,
    claims: Mutex<Vec<LockGuard>>,
    schedulers: tokio::sync::Mutex<Vec<PeriodicScheduler>>,
    interrupt: CancellationToken,
    disconnect_started: AtomicBool,
}

impl BackgroundJob {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn registry_id(&self) -> JobId {
        self.job_id
    }

    pub fn settings(&self) -> &SettingsChannel {
        &self.settings
    }

    pub fn state(&self) -> JobState {
        *self.state_tx.borrow()
    }

    /// Watch channel for state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    /// Token cancelled once the job is fully disconnected. Long operations
    /// (pump waits, automation sleeps) select against it.
    pub fn interrupt(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// A bus client sharing the job's connection.
    pub fn client(&self) -> BusClient {
        self.client.clone()
    }

    /// Claims a hardware channel for the lifetime of the job. The claim is
    /// released on disconnect. `false` if another holder has it.
    pub fn claim(&self, resource_id: &str) -> bool {
        match self.locks.scoped(resource_id) {
            Some(guard) => {
                self.lock_claims().push(guard);
                true
            }
            None => {
                warn!("{}: `{resource_id}` is already claimed", self.name);
                false
            }
        }
    }

    /// Adopts a scheduler: paused while the job sleeps, cancelled (joined) on
    /// disconnect.
    pub async fn own_scheduler(&self, scheduler: PeriodicScheduler) {
        self.schedulers.lock().await.push(scheduler);
    }

    /// Drives a `ready ⇄ sleeping` transition. Anything else is either a
    /// disconnect (delegated) or ignored with a warning.
    pub async fn set_state(&self, target: JobState) -> Result<(), JobError> {
        let current = self.state();
        match (current, target) {
            (JobState::Ready, JobState::Sleeping) => {
                for scheduler in self.schedulers.lock().await.iter() {
                    scheduler.pause();
                }
                self.transition(JobState::Sleeping)?;
                self.hooks.on_sleeping(self).await;
            }
            (JobState::Sleeping, JobState::Ready) => {
                for scheduler in self.schedulers.lock().await.iter() {
                    scheduler.unpause();
                }
                self.transition(JobState::Ready)?;
                self.hooks.on_ready(self).await;
            }
            (_, JobState::Disconnecting | JobState::Disconnected) => {
                self.disconnect().await;
            }
            (current, target) if current == target => {}
            (current, target) => {
                warn!("{}: ignoring transition {current} -> {target}", self.name);
            }
        }
        Ok(())
    }

    /// Tears the job down: cancels schedulers (joined), releases claims,
    /// clears retained settings, marks the registry row not-running, and
    /// suppresses the last-will. Idempotent.
    pub async fn disconnect(&self) {
        if self.disconnect_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = self.transition(JobState::Disconnecting) {
            warn!("{}: failed to publish disconnecting ({})", self.name, err.as_label());
        }
        self.hooks.on_disconnecting(self).await;

        let schedulers: Vec<PeriodicScheduler> =
            self.schedulers.lock().await.drain(..).collect();
        for scheduler in schedulers {
            scheduler.cancel().await;
        }

        self.lock_claims().clear();
        self.settings.clear_retained();

        if let Err(err) = self.transition(JobState::Disconnected) {
            warn!("{}: failed to publish disconnected ({})", self.name, err.as_label());
        }
        if let Err(err) = self.registry.set_not_running(self.job_id) {
            warn!("{}: failed to deregister ({err})", self.name);
        }

        self.client.disconnect();
        self.interrupt.cancel();
        info!("{}: disconnected", self.name);
    }

    /// Resolves once the job is fully disconnected (local call, remote
    /// command, or broadcast).
    pub async fn block_until_disconnected(&self) {
        self.interrupt.cancelled().await;
    }

    async fn handle_command(&self, msg: &BusMessage) {
        let parts: Vec<&str> = msg.topic.split('/').collect();
        if parts.last() != Some(&"set") || parts.len() < 2 {
            return;
        }
        let key = parts[parts.len() - 2];

        if key == STATE_SETTING {
            match JobState::parse(&msg.payload) {
                Some(target @ (JobState::Ready | JobState::Sleeping)) => {
                    if let Err(err) = self.set_state(target).await {
                        warn!("{}: state command failed ({})", self.name, err.as_label());
                    }
                }
                Some(JobState::Disconnected) => self.disconnect().await,
                Some(other) => {
                    warn!("{}: `{other}` cannot be commanded", self.name);
                }
                None => {
                    warn!("{}: unknown state payload `{}`", self.name, msg.payload);
                }
            }
        } else if self.settings.is_settable(key) {
            if let Err(err) = self.hooks.on_set(self, key, &msg.payload).await {
                warn!(
                    "{}: rejected set of `{key}` to `{}` ({})",
                    self.name,
                    msg.payload,
                    err.as_label()
                );
            }
        } else {
            warn!("{}: `{key}` is not settable; ignoring", self.name);
        }
    }

    /// Startup failed after the listener was up: unwind what `on_init` may
    /// have acquired and leave a clean `disconnected` behind.
    async fn abort_startup(&self) {
        self.disconnect_started.store(true, Ordering::SeqCst);

        let schedulers: Vec<PeriodicScheduler> =
            self.schedulers.lock().await.drain(..).collect();
        for scheduler in schedulers {
            scheduler.cancel().await;
        }
        self.lock_claims().clear();

        if let Err(err) = self.transition(JobState::Disconnected) {
            warn!("{}: failed to publish disconnected ({})", self.name, err.as_label());
        }
        if let Err(err) = self.registry.set_not_running(self.job_id) {
            warn!("{}: failed to deregister ({err})", self.name);
        }
        self.client.disconnect();
        self.interrupt.cancel();
    }

    fn transition(&self, state: JobState) -> Result<(), JobError> {
        self.state_tx.send_replace(state);
        self.settings.publish_state(state)
    }

    fn lock_claims(&self) -> std::sync::MutexGuard<'_, Vec<LockGuard>> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;

    struct Fixture {
        _dir: TempDir,
        bus: Bus,
        registry: ProcessRegistry,
        locks: LockSet,
        storage: Storage,
        config: Config,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::with_dirs(dir.path().join("tmp"), dir.path().join("data"));
        Fixture {
            _dir: dir,
            bus: Bus::new(64),
            registry: ProcessRegistry::open_in_memory().expect("registry"),
            locks: LockSet::new(),
            storage,
            config: Config::default(),
        }
    }

    fn builder(f: &Fixture, name: &str) -> JobBuilder {
        JobBuilder::new(&f.config, name, "u1", "exp01")
    }

    async fn settle() {
        // Paused-clock tests: a short sleep yields until every other task is
        // idle, so bus commands have been handled when it returns.
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn enter_registers_and_reaches_ready() {
        let f = fixture();
        let job = builder(&f, "stirring")
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(()))
            .await
            .expect("enter");

        assert_eq!(job.state(), JobState::Ready);
        assert!(f.registry.is_running("stirring").expect("query"));
        assert_eq!(
            f.bus.retained("biovisor/u1/exp01/stirring/$state").as_deref(),
            Some("ready")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remote_sleep_pauses_schedulers_and_wake_resumes() {
        let f = fixture();
        let job = builder(&f, "stirring")
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(()))
            .await
            .expect("enter");

        job.own_scheduler(PeriodicScheduler::spawn(
            "rpm-check",
            Duration::from_secs(60),
            false,
            Duration::ZERO,
            || async {},
        ))
        .await;

        let remote = f.bus.client();
        remote.publish(
            "biovisor/u1/exp01/stirring/$state/set",
            "sleeping",
            QoS::AtLeastOnce,
            false,
        );
        settle().await;

        assert_eq!(job.state(), JobState::Sleeping);
        assert!(job.schedulers.lock().await[0].is_paused());

        remote.publish(
            "biovisor/u1/exp01/stirring/$state/set",
            "ready",
            QoS::AtLeastOnce,
            false,
        );
        settle().await;

        assert_eq!(job.state(), JobState::Ready);
        assert!(!job.schedulers.lock().await[0].is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_disconnect_reaches_the_job() {
        let f = fixture();
        let job = builder(&f, "stirring")
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(()))
            .await
            .expect("enter");

        f.bus.client().publish(
            "biovisor/$broadcast/$experiment/stirring/$state/set",
            "disconnected",
            QoS::AtLeastOnce,
            false,
        );

        tokio::time::timeout(Duration::from_secs(5), job.block_until_disconnected())
            .await
            .expect("disconnected");
        assert_eq!(job.state(), JobState::Disconnected);
        assert!(!f.registry.is_running("stirring").expect("query"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_releases_claims_and_suppresses_will() {
        let f = fixture();
        let job = builder(&f, "stirring")
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(()))
            .await
            .expect("enter");

        assert!(job.claim("pwm-1"));
        assert!(f.locks.is_locked("pwm-1"));

        job.disconnect().await;
        job.disconnect().await; // idempotent

        assert!(!f.locks.is_locked("pwm-1"));
        assert!(!f.registry.is_running("stirring").expect("query"));

        drop(job);
        settle().await;
        // Clean disconnect: the retained state is "disconnected", never "lost".
        assert_eq!(
            f.bus.retained("biovisor/u1/exp01/stirring/$state").as_deref(),
            Some("disconnected")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn settable_set_goes_through_the_default_hook() {
        let f = fixture();
        let job = builder(&f, "stirring")
            .with_setting_default(
                "target_rpm",
                SettingSpec {
                    datatype: "float",
                    settable: true,
                    persist: false,
                },
                "500",
            )
            .with_setting(
                "measured_rpm",
                SettingSpec {
                    datatype: "float",
                    settable: false,
                    persist: false,
                },
            )
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(()))
            .await
            .expect("enter");

        let remote = f.bus.client();
        remote.publish(
            "biovisor/u1/exp01/stirring/target_rpm/set",
            "650",
            QoS::AtLeastOnce,
            false,
        );
        settle().await;
        assert_eq!(job.settings().current("target_rpm").as_deref(), Some("650"));

        // Non-settable keys are rejected without a state change.
        job.settings().publish("measured_rpm", "512").expect("publish");
        remote.publish(
            "biovisor/u1/exp01/stirring/measured_rpm/set",
            "0",
            QoS::AtLeastOnce,
            false,
        );
        settle().await;
        assert_eq!(job.settings().current("measured_rpm").as_deref(), Some("512"));
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_default_recovers_from_a_previous_run() {
        let f = fixture();
        let spec = SettingSpec {
            datatype: "float",
            settable: true,
            persist: true,
        };

        let first = builder(&f, "stirring")
            .with_setting_default("target_rpm", spec, "500")
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(()))
            .await
            .expect("enter");
        first.settings().publish("target_rpm", "725").expect("publish");
        first.disconnect().await;

        let second = builder(&f, "stirring")
            .with_setting_default("target_rpm", spec, "500")
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(()))
            .await
            .expect("enter");
        assert_eq!(second.settings().current("target_rpm").as_deref(), Some("725"));
    }

    struct FailingInit;

    #[async_trait]
    impl JobHooks for FailingInit {
        async fn on_init(&self, _job: &Arc<BackgroundJob>) -> Result<(), JobError> {
            Err(JobError::HardwareFault {
                device: "stirrer".to_string(),
                detail: "no tachometer signal".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_init_aborts_startup_cleanly() {
        let f = fixture();
        let entered = builder(&f, "stirring")
            .enter(&f.bus, &f.registry, &f.locks, &f.storage, Arc::new(FailingInit))
            .await;
        let Err(err) = entered else {
            panic!("init must fail");
        };

        assert_eq!(err.as_label(), "hardware_fault");
        assert!(!f.registry.is_running("stirring").expect("query"));
        assert_eq!(
            f.bus.retained("biovisor/u1/exp01/stirring/$state").as_deref(),
            Some("disconnected")
        );
    }
}
