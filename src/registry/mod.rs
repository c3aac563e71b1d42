//! # Local durable registry of running jobs.
//!
//! Every job registers here on entry and is marked not-running on exit. The
//! backing SQLite file lives outside any single job process, so liveness
//! questions ("is `od_reading` running?") and remote termination keep working
//! across individual job crashes; a separate watchdog reconciles rows whose
//! owning pid has vanished.
//!
//! Rows are never deleted — the table doubles as an audit trail. The identity
//! tuple `(unit, experiment, job_name)` maps to at most one logical running
//! row, enforced by upsert in [`ProcessRegistry::register_and_set_running`].
//!
//! Termination ([`ProcessRegistry::kill`]) goes one of two ways: pump-type jobs
//! have no killable OS process of their own and get a `disconnected` command
//! over the bus; everything else receives SIGTERM.

mod kill;
mod store;

pub use store::{JobFilter, JobId, ProcessRegistry, RunningJob};
