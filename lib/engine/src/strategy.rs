//! Sampling strategies for the retry interval.
//!
//! After each `update()` the engine tells its caller how long to wait before
//! calling it again. The strategy turns a summary of the last cycle into that
//! interval. All intervals in the definition are whole seconds.
//!
//! Every strategy returns `None` once no node is active: the flow is done.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happened during the last `update()` cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStatus {
    /// Interval returned by the previous cycle, if any.
    pub previous_retry: Option<Duration>,
    /// Nodes still active after this cycle.
    pub active_nodes: usize,
    /// Nodes started during this cycle.
    pub new_started_nodes: usize,
    /// Nodes observed as finished during this cycle.
    pub new_finished_nodes: usize,
    /// Nodes observed as failed during this cycle.
    pub new_failed_nodes: usize,
}

/// How the retry interval evolves between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Always the same interval.
    Constant { retry: u64 },
    /// Restart at `start_retry` whenever something was started, otherwise
    /// grow by `step` up to `max_retry`.
    LinearIncrease {
        start_retry: u64,
        max_retry: u64,
        step: u64,
    },
    /// Shrink with the share of work that finished, grow by `start_retry`
    /// when nothing finished. Kept within `start_retry..=max_retry`.
    LinearAdapt { start_retry: u64, max_retry: u64 },
    /// Restart at `start_retry` whenever something was started, otherwise
    /// double up to `max_retry`.
    BiexponentialIncrease { start_retry: u64, max_retry: u64 },
    /// Restart at `start_retry` whenever something was started, otherwise
    /// halve down to `stop_retry`.
    BiexponentialDecrease { start_retry: u64, stop_retry: u64 },
    /// Halve when something finished, double otherwise. Kept within
    /// `start_retry..=max_retry`.
    BiexponentialAdapt { start_retry: u64, max_retry: u64 },
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        Self::BiexponentialIncrease {
            start_retry: 2,
            max_retry: 120,
        }
    }
}

impl SamplingStrategy {
    /// Computes the next retry interval.
    #[must_use]
    pub fn next_retry(&self, status: &CycleStatus) -> Option<Duration> {
        if status.active_nodes == 0 {
            return None;
        }

        let previous = status.previous_retry.map(|d| d.as_secs());
        let restarted = status.new_started_nodes > 0;

        let secs = match *self {
            Self::Constant { retry } => retry,
            Self::LinearIncrease {
                start_retry,
                max_retry,
                step,
            } => match previous {
                Some(prev) if !restarted => prev.saturating_add(step).min(max_retry),
                _ => start_retry,
            },
            Self::LinearAdapt {
                start_retry,
                max_retry,
            } => match previous {
                None => start_retry,
                Some(prev) if status.new_finished_nodes == 0 => prev.saturating_add(start_retry),
                Some(prev) => {
                    let active = status.active_nodes as u64;
                    let total = active + status.new_finished_nodes as u64;
                    prev.saturating_mul(active) / total
                }
            }
            .clamp(start_retry, max_retry.max(start_retry)),
            Self::BiexponentialIncrease {
                start_retry,
                max_retry,
            } => match previous {
                Some(prev) if !restarted => prev.saturating_mul(2).min(max_retry),
                _ => start_retry,
            },
            Self::BiexponentialDecrease {
                start_retry,
                stop_retry,
            } => match previous {
                Some(prev) if !restarted => (prev / 2).max(stop_retry),
                _ => start_retry,
            },
            Self::BiexponentialAdapt {
                start_retry,
                max_retry,
            } => match previous {
                None => start_retry,
                Some(prev) if status.new_finished_nodes > 0 => (prev / 2).max(start_retry),
                Some(prev) => prev.saturating_mul(2).clamp(start_retry, max_retry.max(start_retry)),
            },
        };

        Some(Duration::from_secs(secs))
    }
}
