//! Topic construction and filter matching.
//!
//! Topics are `/`-separated. Filters may use `+` to match exactly one level
//! and a trailing `#` to match any remainder.

/// Wildcard unit identifier for cluster-wide commands.
pub const UNIVERSAL_UNIT: &str = "$broadcast";

/// Experiment identifier for leader-scoped or experiment-independent jobs.
pub const UNIVERSAL_EXPERIMENT: &str = "$experiment";

/// The distinguished setting carrying a job's lifecycle state.
pub const STATE_SETTING: &str = "$state";

/// Topic for a job's current published value of `setting` (retained).
pub fn setting_topic(
    root: &str,
    unit: &str,
    experiment: &str,
    job_name: &str,
    setting: &str,
) -> String {
    format!("{root}/{unit}/{experiment}/{job_name}/{setting}")
}

/// Topic a remote writer publishes to in order to request a change of `setting`.
pub fn set_topic(root: &str, unit: &str, experiment: &str, job_name: &str, setting: &str) -> String {
    format!("{root}/{unit}/{experiment}/{job_name}/{setting}/set")
}

/// Returns whether `topic` matches `filter`.
///
/// `+` matches exactly one level; a trailing `#` matches the rest of the topic
/// (including zero levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');

    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return f.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(fl), Some(tl)) if fl == tl => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("root/+/exp/job/$state/set", "root/u1/exp/job/$state/set"));
        assert!(!topic_matches("root/+/exp", "root/u1/other"));
        assert!(!topic_matches("root/+", "root/a/b"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("root/u1/#", "root/u1/exp/job/$state"));
        assert!(topic_matches("root/u1/#", "root/u1"));
        assert!(!topic_matches("root/u1/#", "root/u2/exp"));
    }

    #[test]
    fn builds_set_topic() {
        assert_eq!(
            set_topic("biovisor", "worker1", "exp01", "stirring", "target_rpm"),
            "biovisor/worker1/exp01/stirring/target_rpm/set"
        );
    }
}
