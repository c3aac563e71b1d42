//! # Liquid dosing: safety controller, pumps, accounting, automations.
//!
//! Everything that moves liquid into or out of a vial goes through one
//! pipeline:
//!
//! ```text
//!  Automation ──► DosingSafetyController ──► DosingProgram (pumps)
//!      ▲                    │
//!  SensorFeed          DosingEvent ──► VialState accounting ──► caches
//! ```
//!
//! The controller is the safety boundary: conservation precondition,
//! recursive sub-dosing, and the hard volume ceiling all live there.
//! Automations only decide *what* to dose; pumps only *move* liquid; the
//! event stream is the single source of truth for *how much* moved.

mod automation;
mod controller;
mod event;
mod feed;
mod pump;
mod vial;

pub use automation::{Automation, AutomationEvent, AutomationRegistry, AutomationRunner};
pub use controller::{DoseRequest, DosingSafetyController, VolumesMoved, WASTE_PUMP};
pub use event::{DosingEvent, DosingEventKind, MANUAL_SOURCE};
pub use feed::SensorFeed;
pub use pump::{DosingProgram, PumpCalibration, TimedPump};
pub use vial::VialState;
