//! # Dosing automations and their registry.
//!
//! An [`Automation`] is the decision layer: once per cycle it looks at the
//! sensor feed and decides what, if anything, to dose. The runner guarantees
//! the failure contract — an erroring cycle is logged and becomes a no-op
//! event, never a crashed job — and skips cycles while the job is not ready.
//!
//! Automations are looked up by name through an explicit
//! [`AutomationRegistry`]: callers register factories at startup and create
//! instances by key. Nothing registers itself implicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};

use crate::error::JobError;
use crate::job::JobState;

use super::controller::{DosingSafetyController, VolumesMoved};

/// Outcome of one automation cycle, for logs and event history.
#[derive(Debug, Clone, PartialEq)]
pub enum AutomationEvent {
    /// Nothing needed doing.
    NoEvent,
    /// Media was exchanged.
    Dilution { volumes: VolumesMoved },
    /// Alternative media was introduced.
    AltMediaAdded { ml: f64 },
    /// The cycle failed; the error was logged and no liquid moved beyond
    /// what the controller already accounted.
    ErrorOccurred,
}

impl fmt::Display for AutomationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutomationEvent::NoEvent => write!(f, "no event"),
            AutomationEvent::Dilution { volumes } => {
                write!(f, "diluted ({:.3} mL waste)", volumes.get("waste"))
            }
            AutomationEvent::AltMediaAdded { ml } => write!(f, "added {ml:.3} mL alt media"),
            AutomationEvent::ErrorOccurred => write!(f, "error occurred"),
        }
    }
}

/// One dosing decision procedure.
#[async_trait]
pub trait Automation: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one cycle against the controller. Errors are converted by the
    /// runner into [`AutomationEvent::ErrorOccurred`].
    async fn execute(
        &self,
        controller: &DosingSafetyController,
    ) -> Result<AutomationEvent, JobError>;
}

type AutomationFactory = Arc<dyn Fn() -> Arc<dyn Automation> + Send + Sync>;

/// Explicit name → factory map for automations.
#[derive(Default)]
pub struct AutomationRegistry {
    factories: HashMap<String, AutomationFactory>,
}

impl AutomationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `key`, replacing any previous registration.
    pub fn register<F>(&mut self, key: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Automation> + Send + Sync + 'static,
    {
        self.factories.insert(key.to_string(), Arc::new(factory));
    }

    /// Instantiates the automation registered under `key`.
    pub fn create(&self, key: &str) -> Option<Arc<dyn Automation>> {
        self.factories.get(key).map(|factory| factory())
    }

    /// Registered keys, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Ties an automation to a controller for periodic execution; hook
/// [`AutomationRunner::cycle`] into a
/// [`PeriodicScheduler`](crate::timer::PeriodicScheduler).
pub struct AutomationRunner {
    automation: Arc<dyn Automation>,
    controller: Arc<DosingSafetyController>,
    ready_wait: Duration,
}

impl AutomationRunner {
    pub fn new(automation: Arc<dyn Automation>, controller: Arc<DosingSafetyController>) -> Self {
        Self {
            automation,
            controller,
            ready_wait: Duration::from_secs(10),
        }
    }

    /// How long a cycle waits for the job to return to `ready` before giving
    /// up on the cycle.
    pub fn with_ready_wait(mut self, ready_wait: Duration) -> Self {
        self.ready_wait = ready_wait;
        self
    }

    /// Runs one cycle. Never fails: errors and not-ready cycles both resolve
    /// to a logged outcome.
    pub async fn cycle(&self) -> AutomationEvent {
        let job = self.controller.job();
        if job.state() != JobState::Ready {
            let mut states = job.subscribe_state();
            let became_ready = tokio::time::timeout(
                self.ready_wait,
                states.wait_for(|state| *state == JobState::Ready),
            )
            .await;
            if !matches!(became_ready, Ok(Ok(_))) {
                info!(
                    "`{}`: job is {}, skipping cycle",
                    self.automation.name(),
                    job.state()
                );
                return AutomationEvent::NoEvent;
            }
        }

        match self.automation.execute(&self.controller).await {
            Ok(event) => {
                info!("`{}`: {event}", self.automation.name());
                event
            }
            Err(err) => {
                error!(
                    "`{}`: cycle failed ({}): {err}",
                    self.automation.name(),
                    err.as_label()
                );
                AutomationEvent::ErrorOccurred
            }
        }
    }
}
