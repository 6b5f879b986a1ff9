//! [`LivenessMonitor`] – heartbeat deadlines for in-flight steps.
//!
//! A step is registered when it starts, every heartbeat pushes its deadline
//! out, and it is removed when it finishes.  A step whose deadline passes is
//! *stalled*.  Stalls are reported, never acted on: a long device call that
//! keeps beating is healthy no matter how long it runs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default heartbeat deadline.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepHealth {
    /// Heartbeat seen within the deadline.
    Alive,
    /// Deadline exceeded, or the step is unknown.
    Stalled,
}

struct StepEntry {
    last_heartbeat: Instant,
    timeout: Duration,
    details: Option<String>,
}

/// Tracks heartbeats of registered steps.
///
/// ```
/// use std::time::Duration;
/// use botflow_runtime::liveness::{LivenessMonitor, StepHealth};
///
/// let mut monitor = LivenessMonitor::new(Duration::from_secs(5));
/// monitor.begin("Move");
/// monitor.beat("Move", "Robot currently at (0.00, 0.00)");
///
/// assert_eq!(monitor.health("Move"), StepHealth::Alive);
/// ```
pub struct LivenessMonitor {
    steps: HashMap<String, StepEntry>,
    timeout: Duration,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            steps: HashMap::new(),
            timeout,
        }
    }

    /// Register `step`, starting its deadline now.  Re-registering resets it.
    pub fn begin(&mut self, step: &str) {
        self.steps.insert(
            step.to_string(),
            StepEntry {
                last_heartbeat: Instant::now(),
                timeout: self.timeout,
                details: None,
            },
        );
    }

    /// Record a heartbeat.  No-op for steps that were never registered.
    pub fn beat(&mut self, step: &str, details: impl Into<String>) {
        if let Some(entry) = self.steps.get_mut(step) {
            entry.last_heartbeat = Instant::now();
            entry.details = Some(details.into());
        }
    }

    /// Forget `step`.
    pub fn end(&mut self, step: &str) {
        self.steps.remove(step);
    }

    pub fn health(&self, step: &str) -> StepHealth {
        match self.steps.get(step) {
            Some(entry) if entry.last_heartbeat.elapsed() <= entry.timeout => StepHealth::Alive,
            _ => StepHealth::Stalled,
        }
    }

    /// Details carried by the most recent heartbeat of `step`.
    pub fn last_details(&self, step: &str) -> Option<&str> {
        self.steps.get(step).and_then(|entry| entry.details.as_deref())
    }

    /// Steps whose deadline has passed, sorted by name.
    pub fn stalled(&self) -> Vec<String> {
        let mut stalled: Vec<String> = self
            .steps
            .iter()
            .filter(|(_, entry)| entry.last_heartbeat.elapsed() > entry.timeout)
            .map(|(step, _)| step.clone())
            .collect();
        stalled.sort();
        stalled
    }

    pub fn active(&self) -> usize {
        self.steps.len()
    }
}
