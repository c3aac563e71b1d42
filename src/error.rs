//! Error types used by the biovisor runtime and jobs.
//!
//! This module defines the main error enums:
//!
//! - [`JobError`] — failures raised by job hooks, automations, and dosing actions.
//! - [`StorageError`] — failures of the local durable stores (registry, caches).
//! - [`StaleDataError`] — upstream sensor readings missing or older than the
//!   freshness window. Callers must handle the error branch explicitly; there is
//!   no raising accessor.
//!
//! A contended resource lock is *not* an error: [`LockSet::acquire`](crate::LockSet::acquire)
//! returns `false` so callers can choose to retry, skip, or log.

use thiserror::Error;

/// Failures of the local durable stores (process registry and key-value caches).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying SQLite failure.
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A cached value could not be decoded into the requested type.
    #[error("malformed cached value for key `{key}`: {source}")]
    Decode {
        key: String,
        source: serde_json::Error,
    },

    /// Filesystem error while opening a cache directory or database file.
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream readings are missing or older than the configured freshness window.
///
/// Blocks the dependent automation's action, never the whole process.
#[derive(Error, Debug)]
#[error("stale upstream data on `{topic}`: {detail}")]
pub struct StaleDataError {
    /// Topic the reading was expected on.
    pub topic: String,
    /// Human-readable detail (age, or "never received").
    pub detail: String,
}

/// # Errors produced by jobs, automations, and dosing actions.
///
/// The taxonomy follows the physical-safety model: hardware faults are fatal to
/// the *operation* but not the process; precondition violations are programmer
/// errors and propagate; safety-threshold breaches are **not** errors at all —
/// they force a state transition instead (see
/// [`DosingSafetyController`](crate::DosingSafetyController)).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum JobError {
    /// A sensor or actuator is unreachable.
    #[error("hardware fault on `{device}`: {detail}")]
    HardwareFault { device: String, detail: String },

    /// Dosing by volume was requested without a calibration.
    ///
    /// Recoverable: callers may fall back to duration-based dosing, or refuse.
    #[error("no calibration for `{pump}` pump; volume-based dosing unavailable")]
    CalibrationMissing { pump: String },

    /// A caller violated an API precondition (e.g. waste < sum of additions).
    #[error("precondition violated: {0}")]
    PreconditionViolated(String),

    /// Upstream readings are too old or absent.
    #[error(transparent)]
    StaleData(#[from] StaleDataError),

    /// Durable store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A remote or local write to a setting was rejected.
    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: String, reason: String },

    /// The job was interrupted (disconnect requested) mid-operation.
    #[error("job interrupted")]
    Interrupted,
}

impl JobError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            JobError::HardwareFault { .. } => "hardware_fault",
            JobError::CalibrationMissing { .. } => "calibration_missing",
            JobError::PreconditionViolated(_) => "precondition_violated",
            JobError::StaleData(_) => "stale_data",
            JobError::Storage(_) => "storage",
            JobError::InvalidSetting { .. } => "invalid_setting",
            JobError::Interrupted => "interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        let e = JobError::CalibrationMissing {
            pump: "media".into(),
        };
        assert_eq!(e.as_label(), "calibration_missing");

        let e = JobError::PreconditionViolated("waste too small".into());
        assert_eq!(e.as_label(), "precondition_violated");
    }

    #[test]
    fn stale_data_converts() {
        let stale = StaleDataError {
            topic: "growth_rate".into(),
            detail: "never received".into(),
        };
        let e: JobError = stale.into();
        assert_eq!(e.as_label(), "stale_data");
    }
}
