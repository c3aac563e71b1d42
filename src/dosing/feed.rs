//! Upstream sensor stream: growth rate and normalized optical density.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::warn;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::{setting_topic, BusClient};
use crate::config::Config;
use crate::error::StaleDataError;

const UPSTREAM_JOB: &str = "growth_rate_calculating";

struct Reading {
    value: f64,
    at: Instant,
}

struct Inner {
    window: Duration,
    growth_rate_topic: String,
    od_topic: String,
    growth_rate: Mutex<Option<Reading>>,
    od_filtered: Mutex<Option<Reading>>,
    token: CancellationToken,
}

/// Cached latest readings from the growth-rate estimator, with freshness
/// enforcement.
///
/// Accessors return `Err(StaleDataError)` when no reading has arrived or the
/// last one is older than the configured window; automations handle that
/// branch explicitly (usually by skipping the cycle) instead of dosing on
/// stale numbers.
#[derive(Clone)]
pub struct SensorFeed {
    inner: Arc<Inner>,
}

impl SensorFeed {
    /// Subscribes to the estimator's retained outputs and starts the
    /// listener. Dropping every clone stops it.
    pub fn spawn(client: &BusClient, config: &Config, unit: &str, experiment: &str) -> Self {
        let growth_rate_topic = setting_topic(
            &config.topic_root,
            unit,
            experiment,
            UPSTREAM_JOB,
            "growth_rate",
        );
        let od_topic = setting_topic(
            &config.topic_root,
            unit,
            experiment,
            UPSTREAM_JOB,
            "od_filtered",
        );

        let inner = Arc::new(Inner {
            window: config.stale_data_window,
            growth_rate_topic: growth_rate_topic.clone(),
            od_topic: od_topic.clone(),
            growth_rate: Mutex::new(None),
            od_filtered: Mutex::new(None),
            token: CancellationToken::new(),
        });

        // The listener holds only a weak reference: dropping every feed clone
        // drops `Inner`, which cancels the token and stops the task.
        let mut sub = client.subscribe(vec![growth_rate_topic, od_topic]);
        let weak = Arc::downgrade(&inner);
        let token = inner.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = sub.recv() => {
                        let Some(msg) = msg else { break };
                        let Some(listener) = weak.upgrade() else { break };
                        let Ok(value) = msg.payload.parse::<f64>() else {
                            warn!("unparseable reading on `{}`: `{}`", msg.topic, msg.payload);
                            continue;
                        };
                        let slot = if msg.topic.as_ref() == listener.growth_rate_topic {
                            &listener.growth_rate
                        } else {
                            &listener.od_filtered
                        };
                        *lock(slot) = Some(Reading { value, at: Instant::now() });
                    }
                }
            }
        });

        Self { inner }
    }

    /// Latest growth rate (h⁻¹), if fresh.
    pub fn latest_growth_rate(&self) -> Result<f64, StaleDataError> {
        self.fresh(&self.inner.growth_rate, &self.inner.growth_rate_topic)
    }

    /// Latest normalized optical density, if fresh.
    pub fn latest_normalized_od(&self) -> Result<f64, StaleDataError> {
        self.fresh(&self.inner.od_filtered, &self.inner.od_topic)
    }

    fn fresh(&self, slot: &Mutex<Option<Reading>>, topic: &str) -> Result<f64, StaleDataError> {
        match lock(slot).as_ref() {
            None => Err(StaleDataError {
                topic: topic.to_string(),
                detail: "never received".to_string(),
            }),
            Some(reading) => {
                let age = reading.at.elapsed();
                if age > self.inner.window {
                    Err(StaleDataError {
                        topic: topic.to_string(),
                        detail: format!("last reading is {}s old", age.as_secs()),
                    })
                } else {
                    Ok(reading.value)
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn lock(slot: &Mutex<Option<Reading>>) -> MutexGuard<'_, Option<Reading>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
