//! Lifecycle states published on the `$state` setting.

use std::fmt;

/// State of a background job, as published on its retained `$state` topic.
///
/// `Lost` is never set by the job itself: the broker publishes it via the
/// job's last-will when the connection drops without a clean disconnect, and
/// observers infer the crash from the retained value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Init,
    Ready,
    Sleeping,
    Disconnecting,
    Disconnected,
    Lost,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Init => "init",
            JobState::Ready => "ready",
            JobState::Sleeping => "sleeping",
            JobState::Disconnecting => "disconnecting",
            JobState::Disconnected => "disconnected",
            JobState::Lost => "lost",
        }
    }

    /// Parses a wire payload. Unknown payloads return `None`; the caller logs
    /// and ignores them.
    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            "init" => Some(JobState::Init),
            "ready" => Some(JobState::Ready),
            "sleeping" => Some(JobState::Sleeping),
            "disconnecting" => Some(JobState::Disconnecting),
            "disconnected" => Some(JobState::Disconnected),
            "lost" => Some(JobState::Lost),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_wire_payloads() {
        for state in [
            JobState::Init,
            JobState::Ready,
            JobState::Sleeping,
            JobState::Disconnecting,
            JobState::Disconnected,
            JobState::Lost,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("rebooting"), None);
    }
}
