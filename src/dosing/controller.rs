//! # Dose execution with volume safety.
//!
//! [`DosingSafetyController`] is the only path by which automations move
//! liquid. It enforces the three safety rules that keep a vial from
//! overflowing or running dry:
//!
//! 1. **conservation**: requested waste removal must cover the sum of all
//!    additions (within 1e-9 mL), or the request is refused outright;
//! 2. **sub-dosing**: a combined addition larger than `max_subdose_ml` is
//!    recursively halved into sequential sub-doses, so media enters the vial
//!    in small increments with mixing pauses and waste removal interleaved;
//! 3. **hard ceiling**: any addition that would push the tracked vial volume
//!    past `max_vial_volume_to_stop_ml` is not delivered; the job is forced
//!    to `sleeping` instead, which halts all further dosing until an
//!    operator intervenes. Crossing the ceiling is a forced transition, not
//!    an error.
//!
//! Every movement is published exactly-once as a [`DosingEvent`] carrying the
//! volume *actually* moved, then folded into the [`VialState`] accounting and
//! persisted. After the requested waste removal, the waste pump runs an
//! extra overrun pass (`waste_ml × waste_removal_multiplier`) to clear
//! residual liquid above the outflow height; the overrun is accounted (the
//! floor clamp makes it a no-op once the vial is back at working volume) but
//! excluded from the returned volume map.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::AddAssign;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::sleep;

use crate::bus::{setting_topic, QoS};
use crate::config::Config;
use crate::error::{JobError, StorageError};
use crate::job::{BackgroundJob, JobState};
use crate::storage::Storage;

use super::event::{DosingEvent, DosingEventKind};
use super::pump::DosingProgram;
use super::vial::VialState;

/// Name under which waste removal appears in a [`VolumesMoved`] map.
pub const WASTE_PUMP: &str = "waste";

/// One dose: named additions plus the waste removal that covers them.
#[derive(Debug, Clone, PartialEq)]
pub struct DoseRequest {
    pub waste_ml: f64,
    pub pumps: BTreeMap<String, f64>,
}

impl DoseRequest {
    pub fn new(waste_ml: f64) -> Self {
        Self {
            waste_ml,
            pumps: BTreeMap::new(),
        }
    }

    pub fn with_pump(mut self, name: &str, ml: f64) -> Self {
        self.pumps.insert(name.to_string(), ml);
        self
    }

    fn total_addition(&self) -> f64 {
        self.pumps.values().sum()
    }

    fn halved(&self) -> Self {
        Self {
            waste_ml: self.waste_ml / 2.0,
            pumps: self
                .pumps
                .iter()
                .map(|(name, ml)| (name.clone(), ml / 2.0))
                .collect(),
        }
    }
}

/// Volumes actually moved per pump, in mL. Missing pumps read as 0.0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumesMoved(BTreeMap<String, f64>);

impl VolumesMoved {
    pub fn get(&self, pump: &str) -> f64 {
        self.0.get(pump).copied().unwrap_or(0.0)
    }

    fn add(&mut self, pump: &str, ml: f64) {
        *self.0.entry(pump.to_string()).or_insert(0.0) += ml;
    }
}

impl AddAssign for VolumesMoved {
    fn add_assign(&mut self, other: Self) {
        for (pump, ml) in other.0 {
            *self.0.entry(pump).or_insert(0.0) += ml;
        }
    }
}

/// Executes dose requests against real pumps with full safety accounting.
pub struct DosingSafetyController {
    job: Arc<BackgroundJob>,
    topic_root: String,
    max_subdose_ml: f64,
    max_vial_volume_to_stop_ml: f64,
    max_vial_volume_to_warn_ml: f64,
    max_working_volume_ml: f64,
    waste_removal_multiplier: f64,
    pause_between_subdoses: Duration,
    pumps: Vec<(String, Arc<dyn DosingProgram>)>,
    waste_pump: Arc<dyn DosingProgram>,
    vial: tokio::sync::Mutex<VialState>,
    storage: Storage,
}

impl DosingSafetyController {
    /// Recovers the vial accounting for the job's experiment and wires up the
    /// waste pump. Addition pumps are attached with
    /// [`DosingSafetyController::with_pump`], in dosing order.
    pub fn new(
        job: Arc<BackgroundJob>,
        config: &Config,
        storage: Storage,
        waste_pump: Arc<dyn DosingProgram>,
    ) -> Result<Self, JobError> {
        let vial = VialState::recover(&storage, job.experiment(), config)?;
        Ok(Self {
            job,
            topic_root: config.topic_root.clone(),
            max_subdose_ml: config.max_subdose_ml,
            max_vial_volume_to_stop_ml: config.max_vial_volume_to_stop_ml,
            max_vial_volume_to_warn_ml: config.max_vial_volume_to_warn_ml(),
            max_working_volume_ml: config.max_working_volume_ml,
            waste_removal_multiplier: config.waste_removal_multiplier,
            pause_between_subdoses: config.pause_between_subdoses,
            pumps: Vec::new(),
            waste_pump,
            vial: tokio::sync::Mutex::new(vial),
            storage,
        })
    }

    pub fn with_pump(mut self, name: &str, pump: Arc<dyn DosingProgram>) -> Self {
        self.pumps.push((name.to_string(), pump));
        self
    }

    pub fn job(&self) -> &Arc<BackgroundJob> {
        &self.job
    }

    /// Snapshot of the current vial accounting.
    pub async fn vial_state(&self) -> VialState {
        *self.vial.lock().await
    }

    /// Executes a dose request and returns the volumes actually moved.
    ///
    /// `source` is recorded on every published [`DosingEvent`]
    /// ("dosing_automation", "manually", ...).
    pub async fn execute_io_action(
        &self,
        request: DoseRequest,
        source: &str,
    ) -> Result<VolumesMoved, JobError> {
        if self.job.interrupt().is_cancelled() {
            return Err(JobError::Interrupted);
        }
        if let Some(missing) = request
            .pumps
            .keys()
            .find(|name| !self.pumps.iter().any(|(attached, _)| attached == *name))
        {
            return Err(JobError::PreconditionViolated(format!(
                "no pump attached for `{missing}`"
            )));
        }
        let total = request.total_addition();
        if request.waste_ml + 1e-9 < total {
            return Err(JobError::PreconditionViolated(format!(
                "waste removal ({:.3} mL) must cover total additions ({total:.3} mL)",
                request.waste_ml
            )));
        }
        self.execute(request, source).await
    }

    /// Folds an externally-performed movement (e.g. an operator pipetting
    /// liquid out) into the accounting, with the same publish path as pumped
    /// doses.
    pub async fn record_manual_event(&self, event: DosingEvent) -> Result<(), JobError> {
        self.record(event).await
    }

    // Recursion needs an explicitly boxed future.
    fn execute<'a>(
        &'a self,
        request: DoseRequest,
        source: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VolumesMoved, JobError>> + Send + 'a>> {
        Box::pin(async move {
            if request.total_addition() > self.max_subdose_ml {
                let halved = request.halved();
                let mut moved = self.execute(halved.clone(), source).await?;
                moved += self.execute(halved, source).await?;
                return Ok(moved);
            }
            self.execute_base(request, source).await
        })
    }

    async fn execute_base(
        &self,
        request: DoseRequest,
        source: &str,
    ) -> Result<VolumesMoved, JobError> {
        let interrupt = self.job.interrupt();
        let mut moved = VolumesMoved::default();

        for (name, pump) in &self.pumps {
            let Some(&ml) = request.pumps.get(name) else {
                continue;
            };
            if ml <= 0.0 || interrupt.is_cancelled() {
                continue;
            }
            if self.job.state() != JobState::Ready {
                info!("skipping `{name}`: job is {}", self.job.state());
                continue;
            }

            let projected = self.vial.lock().await.vial_volume_ml + ml;
            if projected >= self.max_vial_volume_to_stop_ml {
                error!(
                    "adding {ml:.3} mL via `{name}` would bring the vial to \
                     {projected:.2} mL; sleeping to halt dosing"
                );
                if let Err(err) = self.job.set_state(JobState::Sleeping).await {
                    warn!("failed to sleep the job ({})", err.as_label());
                }
                break;
            }

            let actual = pump.dose_ml(ml, &interrupt).await?;
            if actual + 1e-9 < ml {
                warn!("pump `{name}` under-delivered: {actual:.3} of {ml:.3} mL");
            }
            self.record(DosingEvent::new(actual, kind_for_pump(name), source))
                .await?;
            moved.add(name, actual);

            // Mixing pause before the next movement.
            tokio::select! {
                _ = interrupt.cancelled() => {}
                _ = sleep(self.pause_between_subdoses) => {}
            }
        }

        // Waste removal is actuation too: a job forced to sleeping (or
        // disconnecting) stops pumping entirely.
        if request.waste_ml > 0.0
            && !interrupt.is_cancelled()
            && self.job.state() == JobState::Ready
        {
            let actual = self.waste_pump.dose_ml(request.waste_ml, &interrupt).await?;
            if actual + 1e-9 < request.waste_ml {
                warn!(
                    "waste pump under-removed: {actual:.3} of {:.3} mL",
                    request.waste_ml
                );
            }
            self.record(DosingEvent::new(actual, DosingEventKind::RemoveWaste, source))
                .await?;
            moved.add(WASTE_PUMP, actual);

            // Overrun pass: clears residual liquid above the outflow height.
            let overrun = request.waste_ml * self.waste_removal_multiplier;
            let extra = self.waste_pump.dose_ml(overrun, &interrupt).await?;
            self.record(DosingEvent::new(extra, DosingEventKind::RemoveWaste, source))
                .await?;
        }

        Ok(moved)
    }

    /// Publishes the event, folds it into the vial accounting, persists the
    /// caches, and re-publishes the accounting settings.
    async fn record(&self, event: DosingEvent) -> Result<(), JobError> {
        if event.volume_change_ml <= 0.0 {
            return Ok(());
        }

        let payload = serde_json::to_string(&event).map_err(|source| {
            JobError::Storage(StorageError::Decode {
                key: "dosing_event".to_string(),
                source,
            })
        })?;
        let topic = setting_topic(
            &self.topic_root,
            self.job.unit(),
            self.job.experiment(),
            self.job.name(),
            "dosing_events",
        );
        self.job
            .client()
            .publish(topic, payload, QoS::ExactlyOnce, false);

        let snapshot = {
            let mut vial = self.vial.lock().await;
            vial.apply(&event, self.max_working_volume_ml);
            vial.persist(&self.storage, self.job.experiment())?;
            *vial
        };

        if snapshot.vial_volume_ml >= self.max_vial_volume_to_warn_ml {
            warn!(
                "vial volume {:.2} mL is approaching the stop threshold ({:.2} mL)",
                snapshot.vial_volume_ml, self.max_vial_volume_to_stop_ml
            );
        }

        self.publish_accounting(&snapshot);
        Ok(())
    }

    /// Re-publishes the accounting values the owning job declares as
    /// (non-settable) settings. Undeclared keys are skipped.
    fn publish_accounting(&self, vial: &VialState) {
        let values = [
            ("vial_volume_ml", vial.vial_volume_ml),
            ("alt_media_fraction", vial.alt_media_fraction),
            ("media_throughput_ml", vial.media_throughput_ml),
            ("alt_media_throughput_ml", vial.alt_media_throughput_ml),
        ];
        for (key, value) in values {
            if self.job.settings().spec(key).is_none() {
                continue;
            }
            if let Err(err) = self.job.settings().publish(key, &format!("{value}")) {
                warn!("failed to publish `{key}` ({})", err.as_label());
            }
        }
    }
}

fn kind_for_pump(name: &str) -> DosingEventKind {
    match name {
        "media" => DosingEventKind::AddMedia,
        "alt_media" => DosingEventKind::AddAltMedia,
        other => DosingEventKind::Custom(format!("add_{other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::job::{JobBuilder, SettingSpec};
    use crate::locks::LockSet;
    use crate::registry::ProcessRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::super::event::MANUAL_SOURCE;

    struct MockPump {
        name: String,
        doses: Mutex<Vec<f64>>,
        delivery_factor: f64,
    }

    impl MockPump {
        fn new(name: &str) -> Arc<Self> {
            Self::with_factor(name, 1.0)
        }

        fn with_factor(name: &str, delivery_factor: f64) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                doses: Mutex::new(Vec::new()),
                delivery_factor,
            })
        }

        fn doses(&self) -> Vec<f64> {
            self.doses.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DosingProgram for MockPump {
        fn name(&self) -> &str {
            &self.name
        }

        async fn dose_ml(&self, ml: f64, _interrupt: &CancellationToken) -> Result<f64, JobError> {
            self.doses.lock().unwrap().push(ml);
            Ok(ml * self.delivery_factor)
        }
    }

    struct Fixture {
        _dir: TempDir,
        bus: Bus,
        storage: Storage,
        config: Config,
        job: Arc<BackgroundJob>,
    }

    async fn fixture(config: Config) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::with_dirs(dir.path().join("tmp"), dir.path().join("data"));
        let bus = Bus::new(128);
        let registry = ProcessRegistry::open_in_memory().expect("registry");
        let locks = LockSet::new();

        let accounting_spec = SettingSpec {
            datatype: "float",
            settable: false,
            persist: false,
        };
        let job = JobBuilder::new(&config, "dosing_automation", "u1", "exp01")
            .with_setting("vial_volume_ml", accounting_spec)
            .with_setting("alt_media_fraction", accounting_spec)
            .with_setting("media_throughput_ml", accounting_spec)
            .with_setting("alt_media_throughput_ml", accounting_spec)
            .enter(&bus, &registry, &locks, &storage, Arc::new(()))
            .await
            .expect("enter");

        Fixture {
            _dir: dir,
            bus,
            storage,
            config,
            job,
        }
    }

    fn controller(
        f: &Fixture,
        media: Arc<MockPump>,
        waste: Arc<MockPump>,
    ) -> DosingSafetyController {
        DosingSafetyController::new(
            Arc::clone(&f.job),
            &f.config,
            f.storage.clone(),
            waste,
        )
        .expect("controller")
        .with_pump("media", media)
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_waste_is_a_precondition_violation() {
        let f = fixture(Config::default()).await;
        let ctl = controller(&f, MockPump::new("media"), MockPump::new("waste"));

        let err = ctl
            .execute_io_action(
                DoseRequest::new(0.5).with_pump("media", 1.0),
                "dosing_automation",
            )
            .await
            .expect_err("must refuse");
        assert_eq!(err.as_label(), "precondition_violated");

        // Nothing moved.
        assert_eq!(ctl.vial_state().await.media_throughput_ml, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn large_dose_is_recursively_halved() {
        let f = fixture(Config::default()).await;
        let media = MockPump::new("media");
        let waste = MockPump::new("waste");
        let ctl = controller(&f, Arc::clone(&media), Arc::clone(&waste));

        let moved = ctl
            .execute_io_action(
                DoseRequest::new(2.5).with_pump("media", 2.5),
                "dosing_automation",
            )
            .await
            .expect("dose");

        // 2.5 > 1.0 -> 1.25 -> 0.625, delivered as four equal sub-doses.
        assert_eq!(media.doses(), vec![0.625; 4]);
        assert!((moved.get("media") - 2.5).abs() < 1e-9);
        assert!((moved.get(WASTE_PUMP) - 2.5).abs() < 1e-9);

        // Each sub-dose ran waste once for the dose and once for the overrun.
        assert_eq!(waste.doses().len(), 8);

        let vial = ctl.vial_state().await;
        assert!((vial.media_throughput_ml - 2.5).abs() < 1e-9);
        // Added 2.5, removed at least as much: back at working volume.
        assert!((vial.vial_volume_ml - f.config.max_working_volume_ml).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_request_halves_and_conserves_per_pump_totals() {
        let f = fixture(Config::default()).await;
        let media = MockPump::new("media");
        let alt = MockPump::new("alt_media");
        let waste = MockPump::new("waste");
        let alt_pump: Arc<dyn DosingProgram> = alt.clone();
        let ctl = controller(&f, Arc::clone(&media), Arc::clone(&waste))
            .with_pump("alt_media", alt_pump);

        let moved = ctl
            .execute_io_action(
                DoseRequest::new(2.0)
                    .with_pump("media", 1.0)
                    .with_pump("alt_media", 0.5),
                "dosing_automation",
            )
            .await
            .expect("dose");

        // 1.5 mL combined > 1.0 -> halved into two sub-doses of 0.75 mL each.
        assert_eq!(media.doses(), vec![0.5, 0.5]);
        assert_eq!(alt.doses(), vec![0.25, 0.25]);
        assert!((moved.get("media") - 1.0).abs() < 1e-9);
        assert!((moved.get("alt_media") - 0.5).abs() < 1e-9);
        assert!((moved.get(WASTE_PUMP) - 2.0).abs() < 1e-9);

        let vial = ctl.vial_state().await;
        assert!((vial.media_throughput_ml - 1.0).abs() < 1e-9);
        assert!((vial.alt_media_throughput_ml - 0.5).abs() < 1e-9);
        assert!(vial.alt_media_fraction > 0.0 && vial.alt_media_fraction <= 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn crossing_the_ceiling_sleeps_instead_of_dosing() {
        let config = Config::default();
        let f = fixture(config.clone()).await;
        let media = MockPump::new("media");
        let waste = MockPump::new("waste");
        let ctl = controller(&f, Arc::clone(&media), Arc::clone(&waste));

        // Push the tracked volume just below the stop threshold.
        ctl.vial.lock().await.vial_volume_ml = config.max_vial_volume_to_stop_ml - 0.2;

        let moved = ctl
            .execute_io_action(
                DoseRequest::new(0.5).with_pump("media", 0.5),
                "dosing_automation",
            )
            .await
            .expect("no error: the ceiling forces a transition");

        assert_eq!(moved.get("media"), 0.0);
        assert!(media.doses().is_empty());
        assert_eq!(f.job.state(), JobState::Sleeping);
        // Sleeping halts every pump, waste included.
        assert!(waste.doses().is_empty());
        assert_eq!(moved.get(WASTE_PUMP), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unattached_pump_is_refused_before_any_movement() {
        let f = fixture(Config::default()).await;
        let waste = MockPump::new("waste");
        let ctl = controller(&f, MockPump::new("media"), Arc::clone(&waste));

        let err = ctl
            .execute_io_action(
                DoseRequest::new(1.0).with_pump("alt_media", 1.0),
                "dosing_automation",
            )
            .await
            .expect_err("no alt_media pump is attached");
        assert_eq!(err.as_label(), "precondition_violated");

        // The request was refused outright, so waste never ran either.
        assert!(waste.doses().is_empty());
        assert_eq!(
            ctl.vial_state().await.vial_volume_ml,
            f.config.initial_vial_volume_ml
        );
    }

    #[tokio::test(start_paused = true)]
    async fn doses_are_refused_after_disconnect() {
        let f = fixture(Config::default()).await;
        let ctl = controller(&f, MockPump::new("media"), MockPump::new("waste"));

        f.job.disconnect().await;

        let err = ctl
            .execute_io_action(
                DoseRequest::new(0.5).with_pump("media", 0.5),
                "dosing_automation",
            )
            .await
            .expect_err("disconnected jobs do not dose");
        assert_eq!(err.as_label(), "interrupted");
    }

    #[tokio::test(start_paused = true)]
    async fn custom_pump_additions_enter_the_accounting() {
        let f = fixture(Config::default()).await;
        let salty = MockPump::new("salty_media");
        let salty_pump: Arc<dyn DosingProgram> = salty.clone();
        let ctl = controller(&f, MockPump::new("media"), MockPump::new("waste"))
            .with_pump("salty_media", salty_pump);

        let moved = ctl
            .execute_io_action(
                DoseRequest::new(0.9).with_pump("salty_media", 0.9),
                "dosing_automation",
            )
            .await
            .expect("dose");

        assert_eq!(salty.doses(), vec![0.9]);
        assert!((moved.get("salty_media") - 0.9).abs() < 1e-9);

        // The addition is liquid like any other: it moves the tracked volume
        // (briefly, until waste pulls it back down) but not the two named
        // media throughputs.
        let vial = ctl.vial_state().await;
        assert!((vial.vial_volume_ml - f.config.max_working_volume_ml).abs() < 1e-9);
        assert_eq!(vial.media_throughput_ml, 0.0);
        assert_eq!(vial.alt_media_throughput_ml, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn under_delivery_is_reflected_in_results_and_accounting() {
        let f = fixture(Config::default()).await;
        let media = MockPump::with_factor("media", 0.5);
        let ctl = controller(&f, media, MockPump::new("waste"));

        let moved = ctl
            .execute_io_action(
                DoseRequest::new(0.8).with_pump("media", 0.8),
                "dosing_automation",
            )
            .await
            .expect("dose");

        assert!((moved.get("media") - 0.4).abs() < 1e-9);
        let vial = ctl.vial_state().await;
        assert!((vial.media_throughput_ml - 0.4).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_published_with_actual_volumes() {
        let f = fixture(Config::default()).await;
        let ctl = controller(&f, MockPump::new("media"), MockPump::new("waste"));

        let mut sub = f.bus.client().subscribe(vec![
            "biovisor/u1/exp01/dosing_automation/dosing_events".to_string(),
        ]);

        ctl.execute_io_action(
            DoseRequest::new(0.5).with_pump("media", 0.5),
            "dosing_automation",
        )
        .await
        .expect("dose");

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let msg = sub.recv().await.expect("event");
            assert_eq!(msg.qos, QoS::ExactlyOnce);
            let event: DosingEvent = serde_json::from_str(&msg.payload).expect("json");
            assert_eq!(event.source_of_event, "dosing_automation");
            kinds.push(event.event);
        }
        assert_eq!(
            kinds,
            vec![
                DosingEventKind::AddMedia,
                DosingEventKind::RemoveWaste,
                DosingEventKind::RemoveWaste, // overrun pass
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn accounting_settings_are_republished() {
        let f = fixture(Config::default()).await;
        let ctl = controller(&f, MockPump::new("media"), MockPump::new("waste"));

        ctl.execute_io_action(
            DoseRequest::new(0.5).with_pump("media", 0.5),
            "dosing_automation",
        )
        .await
        .expect("dose");

        let throughput = f
            .bus
            .retained("biovisor/u1/exp01/dosing_automation/media_throughput_ml")
            .expect("retained");
        assert_eq!(throughput.as_ref(), "0.5");
    }

    #[tokio::test(start_paused = true)]
    async fn manual_waste_event_drops_below_working_volume() {
        let f = fixture(Config::default()).await;
        let ctl = controller(&f, MockPump::new("media"), MockPump::new("waste"));

        ctl.record_manual_event(DosingEvent::new(
            5.0,
            DosingEventKind::RemoveWaste,
            MANUAL_SOURCE,
        ))
        .await
        .expect("record");

        let vial = ctl.vial_state().await;
        assert!((vial.vial_volume_ml - 9.0).abs() < 1e-9);
    }
}
