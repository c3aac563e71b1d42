//! Dosing events as they appear on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `source_of_event` value marking an operator-logged event. Manual waste
/// removal is the one case allowed to drop the tracked vial volume below the
/// outflow height.
pub const MANUAL_SOURCE: &str = "manually";

/// What a dosing event did to the vial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DosingEventKind {
    AddMedia,
    AddAltMedia,
    RemoveWaste,
    Custom(String),
}

impl DosingEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            DosingEventKind::AddMedia => "add_media",
            DosingEventKind::AddAltMedia => "add_alt_media",
            DosingEventKind::RemoveWaste => "remove_waste",
            DosingEventKind::Custom(name) => name,
        }
    }
}

impl From<String> for DosingEventKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "add_media" => DosingEventKind::AddMedia,
            "add_alt_media" => DosingEventKind::AddAltMedia,
            "remove_waste" => DosingEventKind::RemoveWaste,
            _ => DosingEventKind::Custom(raw),
        }
    }
}

impl From<DosingEventKind> for String {
    fn from(kind: DosingEventKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One liquid movement, published exactly-once on the `dosing_events` topic.
///
/// `volume_change_ml` is the volume *actually* moved, not the requested
/// amount: all downstream accounting (vial volume, throughput, fraction) is
/// driven by events, so an interrupted or under-delivering pump is reflected
/// everywhere consistently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingEvent {
    pub volume_change_ml: f64,
    pub event: DosingEventKind,
    pub source_of_event: String,
    pub timestamp: DateTime<Utc>,
}

impl DosingEvent {
    pub fn new(volume_change_ml: f64, event: DosingEventKind, source_of_event: &str) -> Self {
        Self {
            volume_change_ml,
            event,
            source_of_event: source_of_event.to_string(),
            timestamp: Utc::now(),
        }
    }
}
