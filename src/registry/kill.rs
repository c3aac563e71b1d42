//! The two termination paths used by [`ProcessRegistry::kill`](super::ProcessRegistry::kill).

use std::time::Duration;

use log::{debug, warn};

use crate::bus::{set_topic, BusClient, QoS, STATE_SETTING, UNIVERSAL_EXPERIMENT};

/// Jobs that must be stopped with a bus command rather than a process signal:
/// pump actions run inside a caller's process and have no OS process of their
/// own to kill.
pub(super) const REMOTE_STOPPABLE_JOBS: &[&str] = &[
    "add_media",
    "remove_waste",
    "add_alt_media",
    "circulate_media",
    "circulate_alt_media",
];

/// Accumulates jobs to stop via a retained-state `disconnected` command.
pub(super) struct BusKill {
    topic_root: String,
    unit: String,
    client: BusClient,
    job_names: Vec<String>,
}

impl BusKill {
    pub(super) fn new(topic_root: &str, unit: &str, client: BusClient) -> Self {
        Self {
            topic_root: topic_root.to_string(),
            unit: unit.to_string(),
            client,
            job_names: Vec::new(),
        }
    }

    pub(super) fn append(&mut self, job_name: String) {
        self.job_names.push(job_name);
    }

    /// Publishes a disconnect command per job. The final publish is awaited
    /// (bounded) so the caller knows the batch reached the broker.
    pub(super) async fn kill_all(self) -> usize {
        let count = self.job_names.len();
        let mut last_delivery = None;

        for name in &self.job_names {
            let topic = set_topic(
                &self.topic_root,
                &self.unit,
                UNIVERSAL_EXPERIMENT,
                name,
                STATE_SETTING,
            );
            last_delivery = Some(self.client.publish(
                topic,
                "disconnected",
                QoS::AtLeastOnce,
                false,
            ));
        }

        if let Some(delivery) = last_delivery {
            let acked = tokio::time::timeout(Duration::from_secs(2), delivery.acked()).await;
            if !matches!(acked, Ok(true)) {
                warn!("disconnect command batch was not acknowledged in time");
            }
        }

        count
    }
}

/// Accumulates pids to terminate with SIGTERM.
pub(super) struct SignalKill {
    pids: Vec<u32>,
}

impl SignalKill {
    pub(super) fn new() -> Self {
        Self { pids: Vec::new() }
    }

    pub(super) fn append(&mut self, pid: u32) {
        self.pids.push(pid);
    }

    pub(super) fn kill_all(self) -> usize {
        for &pid in &self.pids {
            terminate(pid);
        }
        self.pids.len()
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    debug!("sending SIGTERM to pid {pid}");
    // Failure (e.g. the pid already exited) is fine: kill() reports attempts,
    // not outcomes, and the watchdog reconciles stale rows.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    warn!("process termination unsupported on this platform (pid {pid})");
}
