use std::{num::NonZeroUsize, thread, time::Duration};

use serde::{Deserialize, Serialize};

/// Maximum number of children per node.
pub const FANOUT: usize = 12;

/// Maximum number of levels in a hierarchy, root included.
pub const MAX_LEVELS: usize = 4;

/// How the reduced gradient sum is normalized before it's handed to the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Averaging {
    /// Divide by the number of workers that contributed at least one item.
    #[default]
    Workers,
    /// Divide by the number of processed items.
    Items,
    /// Keep the raw sum.
    None,
}

/// Runtime knobs of the scheduler.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Tuning {
    pub idle_timeout_ms: u64,
    pub work_stealing: bool,
    pub steal_batch: usize,
    pub dynamic_resize: bool,
    pub resize_check_interval: usize,
    pub spawn_queue_threshold: usize,
    pub spawn_per_pending: usize,
    pub idle_cycles_before_retire: u32,
    pub drain_timeout_ms: Option<u64>,
    pub averaging: Averaging,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10,
            work_stealing: true,
            steal_batch: 1,
            dynamic_resize: true,
            resize_check_interval: 100,
            spawn_queue_threshold: 50,
            spawn_per_pending: 10,
            idle_cycles_before_retire: 10,
            drain_timeout_ms: None,
            averaging: Averaging::Workers,
        }
    }
}

impl Tuning {
    /// Returns the bounded wait used by idle nodes.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }

    /// Returns how long `stop` waits for queued work, `None` meaning forever.
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    /// Returns the amount of items moved by a successful steal.
    pub fn steal_batch(&self) -> usize {
        self.steal_batch.max(1)
    }
}

/// The shape of a hierarchy and the size of the gradient it reduces.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HierarchySpec {
    pub threads: usize,
    pub max_depth: usize,
    pub gradient_size: usize,
    #[serde(default)]
    pub tuning: Tuning,
}

impl HierarchySpec {
    /// Creates a new `HierarchySpec` with default tuning.
    ///
    /// # Arguments
    /// * `threads` - Upper bound of nodes, one OS thread each.
    /// * `max_depth` - Upper bound of levels, root included.
    /// * `gradient_size` - The amount of model parameters.
    pub fn new(threads: usize, max_depth: usize, gradient_size: usize) -> Self {
        Self {
            threads,
            max_depth,
            gradient_size,
            tuning: Tuning::default(),
        }
    }

    /// Creates a spec sized to the host's available parallelism.
    ///
    /// # Arguments
    /// * `gradient_size` - The amount of model parameters.
    pub fn for_host(gradient_size: usize) -> Self {
        let threads = thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);

        Self::new(threads, 3, gradient_size)
    }

    /// Replaces the tuning of this spec.
    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_tuning_json_keeps_defaults() {
        let json = r#"{
            "threads": 25,
            "max_depth": 3,
            "gradient_size": 64,
            "tuning": { "work_stealing": false }
        }"#;
        let spec: HierarchySpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.threads, 25);
        assert!(!spec.tuning.work_stealing);
        assert_eq!(spec.tuning.idle_timeout_ms, 10);
        assert_eq!(spec.tuning.averaging, Averaging::Workers);
    }

    #[test]
    fn missing_tuning_is_default() {
        let json = r#"{ "threads": 4, "max_depth": 2, "gradient_size": 8 }"#;
        let spec: HierarchySpec = serde_json::from_str(json).unwrap();

        assert_eq!(spec.tuning.spawn_queue_threshold, 50);
        assert!(spec.tuning.drain_timeout().is_none());
    }

    #[test]
    fn averaging_is_snake_case() {
        let averaging: Averaging = serde_json::from_str(r#""items""#).unwrap();
        assert_eq!(averaging, Averaging::Items);
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let tuning = Tuning {
            idle_timeout_ms: 0,
            steal_batch: 0,
            ..Tuning::default()
        };

        assert_eq!(tuning.idle_timeout(), Duration::from_millis(1));
        assert_eq!(tuning.steal_batch(), 1);
    }
}
