//! Key and topic naming scheme.
//!
//! These formats are a wire contract: presence keys and control topics are
//! the only cross-process discovery mechanism, so every component that
//! publishes or scans them must use exactly these shapes.

/// Presence marker for a run actively tracked by an instance.
/// TTL-bounded as a safety net against instance crashes.
pub fn presence_key(instance_id: &str, run_id: &str) -> String {
    format!("active_run:{instance_id}:{run_id}")
}

/// Pattern matching every instance's presence key for one run.
pub fn run_presence_pattern(run_id: &str) -> String {
    format!("active_run:*:{run_id}")
}

/// Pattern matching every presence key held by one instance.
pub fn instance_presence_pattern(instance_id: &str) -> String {
    format!("active_run:{instance_id}:*")
}

/// Global per-run control topic.
pub fn control_topic(run_id: &str) -> String {
    format!("agent_run:{run_id}:control")
}

/// Per-instance control topic, used when multiple instances might be
/// polling the same run.
pub fn instance_control_topic(run_id: &str, instance_id: &str) -> String {
    format!("agent_run:{run_id}:control:{instance_id}")
}

/// Response-buffer key holding a run's accumulated output.
pub fn response_key(run_id: &str) -> String {
    format!("agent_run:{run_id}:responses")
}

/// Split a presence key back into `(instance_id, run_id)`.
///
/// Returns `None` for keys that do not follow the presence format.
pub fn parse_presence_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix("active_run:")?;
    let (instance_id, run_id) = rest.split_once(':')?;
    if instance_id.is_empty() || run_id.is_empty() {
        return None;
    }
    Some((instance_id, run_id))
}
