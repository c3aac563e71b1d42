//! # Job lifecycle, published settings, and hooks.
//!
//! The unit of work on a device is a **background job**: a named, long-running
//! process slice with a published state machine, declared settings observable
//! and (selectively) settable over the bus, and a durable row in the process
//! registry. [`JobBuilder`] assembles one; [`JobHooks`] is the seam a concrete
//! job implements; [`SettingsChannel`] carries its published values.

mod lifecycle;
mod settings;
mod state;

pub use lifecycle::{BackgroundJob, JobBuilder, JobHooks};
pub use settings::{SettingSpec, SettingsChannel};
pub use state::JobState;
