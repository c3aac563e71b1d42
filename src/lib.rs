//! # biovisor
//!
//! **Biovisor** is the coordination core for a fleet of networked bioreactor
//! devices: job lifecycle, published settings, durable process registry,
//! hardware-channel locks, drift-corrected scheduling, and the volume-safety
//! algorithm governing all liquid dosing.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │ BackgroundJob│   │ BackgroundJob│   │ BackgroundJob│
//!     │  (stirring)  │   │ (od_reading) │   │(dosing autom.)│
//!     └──────┬───────┘   └──────┬───────┘   └──────┬────────┘
//!            │ retained $state, settings, /set commands
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Bus (in-process broker)                                          │
//! │  - topic scheme {root}/{unit}/{experiment}/{job}/{setting}        │
//! │  - retained last value per topic, replayed to late subscribers    │
//! │  - QoS tiers + per-client last-will ("lost" on unclean death)     │
//! └──────┬────────────────────────────────────────────────┬──────────┘
//!        │                                                │
//!        ▼                                                ▼
//! ┌──────────────────────┐                   ┌────────────────────────┐
//! │  ProcessRegistry     │                   │  Storage               │
//! │  (SQLite, durable)   │                   │  (ephemeral/persistent │
//! │  - identity upsert   │                   │   key-value caches)    │
//! │  - settings snapshot │                   └────────────────────────┘
//! │  - kill: bus or      │
//! │    SIGTERM           │
//! └──────────────────────┘
//! ```
//!
//! ### Job lifecycle
//! ```text
//! JobBuilder::enter()
//!   ├─► register in ProcessRegistry (upsert by identity, pid recorded)
//!   ├─► install last-will: retained $state = "lost"
//!   ├─► seed declared settings (persisted values win over defaults)
//!   ├─► start /set command listener (incl. broadcast addressing)
//!   ├─► JobHooks::on_init (failure aborts startup cleanly)
//!   └─► publish $state = "ready"
//!
//! ready ◄──► sleeping     pauses owned PeriodicSchedulers, halts dosing
//!   │
//!   ▼
//! disconnecting ─► disconnected
//!   cancel schedulers (joined) · release claims · clear retained
//!   settings · mark not-running · suppress last-will
//! ```
//!
//! ### Dosing safety
//! Every liquid movement goes through [`DosingSafetyController`]: requested
//! waste must cover additions, oversized doses are recursively halved with
//! mixing pauses, and an addition that would cross the volume ceiling forces
//! the job to `sleeping` instead of dosing. Published [`DosingEvent`]s carry
//! the volume *actually* moved and drive the [`VialState`] accounting.
//!
//! ## Features
//! | Area            | Description                                              | Key types / traits                                |
//! |-----------------|----------------------------------------------------------|---------------------------------------------------|
//! | **Lifecycle**   | Remotely drivable job state machine with hooks.          | [`JobBuilder`], [`BackgroundJob`], [`JobHooks`]   |
//! | **Settings**    | Retained, epoch-versioned published values.              | [`SettingsChannel`], [`SettingSpec`]              |
//! | **Registry**    | Durable running-job registry with kill paths.            | [`ProcessRegistry`], [`JobFilter`]                |
//! | **Scheduling**  | Drift-corrected periodic callbacks.                      | [`PeriodicScheduler`]                             |
//! | **Locks**       | Advisory hardware-channel mutual exclusion.              | [`LockSet`], [`LockGuard`]                        |
//! | **Dosing**      | Volume safety, pumps, accounting, automations.           | [`DosingSafetyController`], [`DosingProgram`]     |
//! | **Transport**   | In-process broker with the bus contract.                 | [`Bus`], [`BusClient`], [`QoS`]                   |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use biovisor::{Bus, Config, JobBuilder, LockSet, ProcessRegistry, SettingSpec, Storage};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let bus = Bus::new(64);
//!     let registry = ProcessRegistry::open_in_memory()?;
//!     let locks = LockSet::new();
//!     let dir = std::env::temp_dir().join("biovisor-example");
//!     let storage = Storage::with_dirs(dir.join("tmp"), dir.join("data"));
//!
//!     let job = JobBuilder::new(&config, "stirring", "unit1", "exp01")
//!         .with_setting_default(
//!             "target_rpm",
//!             SettingSpec { datatype: "float", settable: true, persist: false },
//!             "500",
//!         )
//!         .enter(&bus, &registry, &locks, &storage, Arc::new(()))
//!         .await?;
//!
//!     assert!(registry.is_running("stirring")?);
//!     assert_eq!(job.settings().current("target_rpm").as_deref(), Some("500"));
//!
//!     job.disconnect().await;
//!     Ok(())
//! }
//! ```
mod bus;
mod config;
mod dosing;
mod error;
mod job;
mod locks;
mod registry;
mod storage;
mod timer;

// ---- Public re-exports ----

pub use bus::{
    set_topic, setting_topic, topic_matches, Bus, BusClient, BusMessage, Delivery, LastWill, QoS,
    Subscription, STATE_SETTING, UNIVERSAL_EXPERIMENT, UNIVERSAL_UNIT,
};
pub use config::Config;
pub use dosing::{
    Automation, AutomationEvent, AutomationRegistry, AutomationRunner, DoseRequest, DosingEvent,
    DosingEventKind, DosingProgram, DosingSafetyController, PumpCalibration, SensorFeed, TimedPump,
    VialState, VolumesMoved, MANUAL_SOURCE, WASTE_PUMP,
};
pub use error::{JobError, StaleDataError, StorageError};
pub use job::{BackgroundJob, JobBuilder, JobHooks, JobState, SettingSpec, SettingsChannel};
pub use locks::{LockGuard, LockSet};
pub use registry::{JobFilter, JobId, ProcessRegistry, RunningJob};
pub use storage::{Cache, Storage};
pub use timer::PeriodicScheduler;
