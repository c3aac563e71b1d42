//! # Vial volume, composition, and throughput accounting.
//!
//! [`VialState`] is the single source of truth for how much liquid is in the
//! vial and what it is made of. It is driven exclusively by
//! [`DosingEvent`]s, so everything that moves liquid — automations, manual
//! actions, calibrations — flows through the same arithmetic:
//!
//! - **throughput**: cumulative media / alt-media added; waste and custom
//!   inflows never count;
//! - **vial volume**: additions accumulate; waste removal floor-clamps at the
//!   outflow tube height (`max_working_volume_ml`) unless the event is
//!   operator-sourced, which may drop it to zero;
//! - **alt-media fraction**: volume-weighted blend, in `[0, 1]` by
//!   construction.
//!
//! Each component is cached per experiment in the persistent store and
//! recovered on the next run, so accounting survives restarts and device
//! reboots.

use crate::config::Config;
use crate::error::StorageError;
use crate::storage::Storage;

use super::event::{DosingEvent, DosingEventKind, MANUAL_SOURCE};

const VIAL_VOLUME_CACHE: &str = "vial_volume";
const ALT_MEDIA_FRACTION_CACHE: &str = "alt_media_fraction";
const MEDIA_THROUGHPUT_CACHE: &str = "media_throughput";
const ALT_MEDIA_THROUGHPUT_CACHE: &str = "alt_media_throughput";

/// Tracked liquid state of one vial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VialState {
    pub vial_volume_ml: f64,
    pub alt_media_fraction: f64,
    pub media_throughput_ml: f64,
    pub alt_media_throughput_ml: f64,
}

impl VialState {
    /// Recovers the state cached for `experiment`, falling back to the
    /// configured initial values for a fresh experiment.
    pub fn recover(
        storage: &Storage,
        experiment: &str,
        config: &Config,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            vial_volume_ml: storage
                .persistent(VIAL_VOLUME_CACHE)?
                .get_or(experiment, config.initial_vial_volume_ml)?,
            alt_media_fraction: storage
                .persistent(ALT_MEDIA_FRACTION_CACHE)?
                .get_or(experiment, config.initial_alt_media_fraction)?,
            media_throughput_ml: storage
                .persistent(MEDIA_THROUGHPUT_CACHE)?
                .get_or(experiment, 0.0)?,
            alt_media_throughput_ml: storage
                .persistent(ALT_MEDIA_THROUGHPUT_CACHE)?
                .get_or(experiment, 0.0)?,
        })
    }

    /// Writes all four components back to the persistent caches.
    pub fn persist(&self, storage: &Storage, experiment: &str) -> Result<(), StorageError> {
        storage
            .persistent(VIAL_VOLUME_CACHE)?
            .set(experiment, &self.vial_volume_ml)?;
        storage
            .persistent(ALT_MEDIA_FRACTION_CACHE)?
            .set(experiment, &self.alt_media_fraction)?;
        storage
            .persistent(MEDIA_THROUGHPUT_CACHE)?
            .set(experiment, &self.media_throughput_ml)?;
        storage
            .persistent(ALT_MEDIA_THROUGHPUT_CACHE)?
            .set(experiment, &self.alt_media_throughput_ml)?;
        Ok(())
    }

    /// Applies one dosing event.
    ///
    /// `max_working_volume_ml` is the liquid height of the outflow tube:
    /// pumped waste removal cannot take the tracked volume below it (the pump
    /// only sees liquid above the tube), but an operator-sourced event can,
    /// down to an empty vial.
    pub fn apply(&mut self, event: &DosingEvent, max_working_volume_ml: f64) {
        let ml = event.volume_change_ml;
        match &event.event {
            DosingEventKind::AddMedia => {
                self.media_throughput_ml += ml;
                self.blend(ml, 0.0);
                self.vial_volume_ml += ml;
            }
            DosingEventKind::AddAltMedia => {
                self.alt_media_throughput_ml += ml;
                self.blend(ml, ml);
                self.vial_volume_ml += ml;
            }
            DosingEventKind::RemoveWaste => {
                // Removal does not change the fraction: outflow has the same
                // composition as the vial.
                if event.source_of_event == MANUAL_SOURCE {
                    self.vial_volume_ml = (self.vial_volume_ml - ml).max(0.0);
                } else {
                    let floor = self.vial_volume_ml.min(max_working_volume_ml);
                    self.vial_volume_ml = (self.vial_volume_ml - ml).max(floor);
                }
            }
            DosingEventKind::Custom(_) => {
                // Custom kinds cover additional inflow pumps. The liquid is
                // real, so it raises the volume and dilutes the fraction, but
                // only the two named media streams count toward throughput.
                self.blend(ml, 0.0);
                self.vial_volume_ml += ml;
            }
        }
    }

    /// Volume-weighted blend of the alt-media fraction for an addition of
    /// `added` mL of which `alt_added` mL is alt-media. Uses the pre-addition
    /// volume; callers update the volume afterwards.
    fn blend(&mut self, added: f64, alt_added: f64) {
        let volume = self.vial_volume_ml;
        if volume + added <= 0.0 {
            return;
        }
        self.alt_media_fraction =
            ((self.alt_media_fraction * volume + alt_added) / (volume + added)).clamp(0.0, 1.0);
    }
}
