//! # Global runtime configuration.
//!
//! Provides [`Config`], the centralized settings for a device process: bus topic
//! root, dosing safety ceilings, pause durations, and the directories backing
//! the two local cache classes.
//!
//! Config is used in two ways:
//! 1. **Job construction**: `JobBuilder::new(&config, ...)`
//! 2. **Dosing safety**: ceilings and multipliers consumed by
//!    [`DosingSafetyController`](crate::DosingSafetyController)
//!
//! ## Field semantics
//! - `max_subdose_ml`: largest combined non-waste volume a single physical dose
//!   may move; larger requests are recursively halved.
//! - `max_vial_volume_to_stop_ml`: crossing this forces the job to `Sleeping`
//!   (no dose is delivered). A warning fires at 95% of this value.
//! - `max_working_volume_ml`: liquid height of the outflow tube. Waste removal
//!   cannot bring the tracked vial volume below this, except for
//!   operator-sourced events.
//! - `pause_between_subdoses`: mixing pause between pump actions in one dose.

use std::path::PathBuf;
use std::time::Duration;

/// Global configuration for a biovisor device process.
#[derive(Clone, Debug)]
pub struct Config {
    /// First segment of every bus topic.
    pub topic_root: String,

    /// Largest combined non-waste volume (mL) for one physical dose.
    pub max_subdose_ml: f64,

    /// Vial volume (mL) at which all pumping stops and the job sleeps.
    pub max_vial_volume_to_stop_ml: f64,

    /// Volume (mL) defined by the outflow tube height; waste removal
    /// floor-clamps the tracked volume here.
    pub max_working_volume_ml: f64,

    /// Extra waste removal after a dose, as a multiple of the waste volume.
    /// Compensates for residual liquid above the outflow height.
    pub waste_removal_multiplier: f64,

    /// Mixing pause between pump actions inside one sub-dose.
    pub pause_between_subdoses: Duration,

    /// Vial volume (mL) assumed when no cached value exists.
    pub initial_vial_volume_ml: f64,

    /// Alt-media fraction assumed when no cached value exists.
    pub initial_alt_media_fraction: f64,

    /// Maximum age of upstream sensor readings before they are considered stale.
    pub stale_data_window: Duration,

    /// Directory for caches cleared on device reboot (locks, duty cycles).
    pub ephemeral_dir: PathBuf,

    /// Directory for caches that survive reboot (calibrations, accumulators).
    pub persistent_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic_root: "biovisor".to_string(),
            max_subdose_ml: 1.0,
            max_vial_volume_to_stop_ml: 18.0,
            max_working_volume_ml: 14.0,
            waste_removal_multiplier: 2.0,
            pause_between_subdoses: Duration::from_secs(5),
            initial_vial_volume_ml: 14.0,
            initial_alt_media_fraction: 0.0,
            stale_data_window: Duration::from_secs(5 * 60),
            ephemeral_dir: std::env::temp_dir().join("biovisor"),
            persistent_dir: PathBuf::from("/var/lib/biovisor"),
        }
    }
}

impl Config {
    /// Vial volume (mL) at which a warning is logged. Fixed at 95% of the stop
    /// threshold.
    pub fn max_vial_volume_to_warn_ml(&self) -> f64 {
        0.95 * self.max_vial_volume_to_stop_ml
    }
}
