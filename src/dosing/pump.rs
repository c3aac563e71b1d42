//! Pump seam: the [`DosingProgram`] trait and a calibrated timed pump.

use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Linear volume-to-runtime calibration: `seconds = duration_per_ml · ml + bias`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpCalibration {
    /// Seconds of runtime per mL.
    pub duration_per_ml: f64,
    /// Fixed startup cost in seconds (tubing dead volume, motor spin-up).
    pub bias: f64,
}

impl PumpCalibration {
    pub fn ml_to_duration(&self, ml: f64) -> Duration {
        Duration::from_secs_f64((self.duration_per_ml * ml + self.bias).max(0.0))
    }

    pub fn duration_to_ml(&self, duration: Duration) -> f64 {
        if self.duration_per_ml <= 0.0 {
            return 0.0;
        }
        ((duration.as_secs_f64() - self.bias) / self.duration_per_ml).max(0.0)
    }
}

/// A program that moves liquid.
///
/// `dose_ml` returns the volume **actually** moved, which may be less than
/// requested: an interrupt (job disconnect) stops the pump early and reports
/// how far it got, so accounting stays truthful.
#[async_trait]
pub trait DosingProgram: Send + Sync {
    fn name(&self) -> &str;

    async fn dose_ml(&self, ml: f64, interrupt: &CancellationToken) -> Result<f64, JobError>;
}

/// A pump driven purely by runtime, converted through a [`PumpCalibration`].
///
/// Volume-based dosing without a calibration is refused with
/// [`JobError::CalibrationMissing`]; callers may fall back to
/// [`TimedPump::run_for`].
pub struct TimedPump {
    name: String,
    calibration: Option<PumpCalibration>,
}

impl TimedPump {
    pub fn new(name: &str, calibration: Option<PumpCalibration>) -> Self {
        Self {
            name: name.to_string(),
            calibration,
        }
    }

    /// Runs the pump for a fixed duration, interruptible. Returns the moved
    /// volume when a calibration is available, `None` otherwise.
    pub async fn run_for(&self, duration: Duration, interrupt: &CancellationToken) -> Option<f64> {
        let ran = wait_interruptible(duration, interrupt).await;
        self.calibration.map(|cal| cal.duration_to_ml(ran))
    }
}

#[async_trait]
impl DosingProgram for TimedPump {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dose_ml(&self, ml: f64, interrupt: &CancellationToken) -> Result<f64, JobError> {
        let Some(cal) = self.calibration else {
            return Err(JobError::CalibrationMissing {
                pump: self.name.clone(),
            });
        };

        let duration = cal.ml_to_duration(ml);
        let ran = wait_interruptible(duration, interrupt).await;
        if ran < duration {
            let moved = cal.duration_to_ml(ran).min(ml);
            warn!(
                "pump `{}` interrupted: moved {moved:.3} of {ml:.3} mL",
                self.name
            );
            return Ok(moved);
        }
        Ok(ml)
    }
}

/// Sleeps for `duration` unless `interrupt` fires first; returns how long it
/// actually waited.
async fn wait_interruptible(duration: Duration, interrupt: &CancellationToken) -> Duration {
    let started = Instant::now();
    tokio::select! {
        _ = interrupt.cancelled() => started.elapsed().min(duration),
        _ = sleep(duration) => duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated() -> TimedPump {
        TimedPump::new(
            "media",
            Some(PumpCalibration {
                duration_per_ml: 2.0,
                bias: 0.0,
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_dose_returns_requested_volume() {
        let pump = calibrated();
        let moved = pump
            .dose_ml(1.5, &CancellationToken::new())
            .await
            .expect("dose");
        assert_eq!(moved, 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_reports_partial_volume() {
        let pump = calibrated();
        let token = CancellationToken::new();
        let canceller = token.clone();

        // 2 mL takes 4s; cancel at 1s -> 0.5 mL moved.
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let moved = pump.dose_ml(2.0, &token).await.expect("dose");
        assert!((moved - 0.5).abs() < 1e-6, "moved {moved}");
    }

    #[tokio::test]
    async fn missing_calibration_refuses_volume_dosing() {
        let pump = TimedPump::new("alt_media", None);
        let err = pump
            .dose_ml(1.0, &CancellationToken::new())
            .await
            .expect_err("uncalibrated");
        assert_eq!(err.as_label(), "calibration_missing");
    }

    #[tokio::test(start_paused = true)]
    async fn run_for_reports_volume_when_calibrated() {
        let pump = calibrated();
        let moved = pump
            .run_for(Duration::from_secs(3), &CancellationToken::new())
            .await
            .expect("calibrated");
        assert!((moved - 1.5).abs() < 1e-9);

        let blind = TimedPump::new("waste", None);
        assert!(blind
            .run_for(Duration::from_secs(1), &CancellationToken::new())
            .await
            .is_none());
    }
}
