//! Progress accounting: the indicator contract, ready-made indicators,
//! and the per-node step budget tracking with overflow diagnostics.

use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;

use crate::core::StepCount;

/// The progress indicator contract consumed by the framework.
///
/// The executor calls `init` once per phase with the declared step total,
/// `step` for every charged step, and `done` when the phase finishes
/// (on all exit paths).
pub trait Progress: Send + Sync {
    fn init(&self, total: StepCount);

    fn step(&self, steps: StepCount);

    fn refresh(&self) {}

    fn done(&self);
}

/// Indicator that swallows all events. Useful for tests and headless runs.
pub struct NullProgress;

impl Progress for NullProgress {
    fn init(&self, _total: StepCount) {}

    fn step(&self, _steps: StepCount) {}

    fn done(&self) {}
}

/// Terminal progress bar backed by indicatif.
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(crate::utils::progress_style());
        Self { bar }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for TerminalProgress {
    fn init(&self, total: StepCount) {
        self.bar.reset();
        self.bar.set_length(total);
    }

    fn step(&self, steps: StepCount) {
        self.bar.inc(steps);
    }

    fn refresh(&self) {
        self.bar.tick();
    }

    fn done(&self) {
        self.bar.finish_and_clear();
    }
}

/// Diagnostic recorded when a node charges more steps than it declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOverflow {
    pub node: String,
    pub requested: StepCount,
    pub remaining: StepCount,
}

struct StepState {
    name: String,
    total: StepCount,
    left: StepCount,
    indicator: Arc<dyn Progress>,
    overflows: Vec<StepOverflow>,
}

/// Shared step accounting for one node. Shared between the node base, the
/// proxy indicator handed out by it, and the executor collecting
/// diagnostics at the end of the phase.
#[derive(Clone)]
pub(crate) struct StepTracker {
    inner: Arc<Mutex<StepState>>,
}

impl StepTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StepState {
                name: String::new(),
                total: 0,
                left: 0,
                indicator: Arc::new(NullProgress),
                overflows: Vec::new(),
            })),
        }
    }

    pub fn configure(&self, name: String, total: StepCount) {
        let mut state = self.inner.lock().unwrap();
        state.name = name;
        state.total = total;
        state.left = total;
    }

    pub fn attach(&self, name: String, indicator: Arc<dyn Progress>) {
        let mut state = self.inner.lock().unwrap();
        state.name = name;
        state.indicator = indicator;
    }

    /// Charges steps; on overflow records one diagnostic and clamps to
    /// zero. Steps are forwarded to the indicator either way so that the
    /// display keeps moving.
    pub fn step(&self, steps: StepCount) {
        let indicator = {
            let mut state = self.inner.lock().unwrap();
            if state.left < steps {
                let overflow = StepOverflow {
                    node: state.name.clone(),
                    requested: steps,
                    remaining: state.left,
                };
                tracing::warn!(
                    node = %overflow.node,
                    requested = overflow.requested,
                    remaining = overflow.remaining,
                    "step budget exceeded"
                );
                state.overflows.push(overflow);
                state.left = 0;
            } else {
                state.left -= steps;
            }
            state.indicator.clone()
        };
        indicator.step(steps);
    }

    pub fn total(&self) -> StepCount {
        self.inner.lock().unwrap().total
    }

    pub fn left(&self) -> StepCount {
        self.inner.lock().unwrap().left
    }

    pub fn take_overflows(&self) -> Vec<StepOverflow> {
        std::mem::take(&mut self.inner.lock().unwrap().overflows)
    }
}

struct ProxyState {
    outer_total: StepCount,
    outer_done: StepCount,
    charged: StepCount,
}

/// Rescales sub-progress reported by an external computation into the
/// owning node's declared step budget, without accumulating drift.
pub struct ProxyProgress {
    tracker: StepTracker,
    state: Mutex<ProxyState>,
}

impl ProxyProgress {
    pub(crate) fn new(tracker: StepTracker) -> Self {
        Self {
            tracker,
            state: Mutex::new(ProxyState {
                outer_total: 0,
                outer_done: 0,
                charged: 0,
            }),
        }
    }
}

impl Progress for ProxyProgress {
    fn init(&self, total: StepCount) {
        let mut state = self.state.lock().unwrap();
        state.outer_total = total;
        state.outer_done = 0;
        state.charged = 0;
    }

    fn step(&self, steps: StepCount) {
        let node_total = self.tracker.total();
        let delta = {
            let mut state = self.state.lock().unwrap();
            if state.outer_total == 0 {
                return;
            }
            state.outer_done = state.outer_done.saturating_add(steps).min(state.outer_total);
            let target = (node_total as u128 * state.outer_done as u128
                / state.outer_total as u128) as StepCount;
            let delta = target.saturating_sub(state.charged);
            state.charged = target;
            delta
        };
        if delta > 0 {
            self.tracker.step(delta);
        }
    }

    fn done(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_step_within_budget() {
        let tracker = StepTracker::new();
        tracker.configure("counter".into(), 10);
        tracker.step(4);
        tracker.step(6);
        assert_eq!(tracker.left(), 0);
        assert!(tracker.take_overflows().is_empty());
    }

    #[test]
    fn test_step_overflow_records_one_diagnostic_and_clamps() {
        let tracker = StepTracker::new();
        tracker.configure("counter".into(), 10);
        tracker.step(15);
        assert_eq!(tracker.left(), 0);

        let overflows = tracker.take_overflows();
        assert_eq!(overflows.len(), 1);
        assert_eq!(
            overflows[0],
            StepOverflow {
                node: "counter".into(),
                requested: 15,
                remaining: 10,
            }
        );

        // Budget is exhausted, so every further step overflows again.
        tracker.step(1);
        let overflows = tracker.take_overflows();
        assert_eq!(overflows.len(), 1);
        assert_eq!(overflows[0].remaining, 0);
    }

    #[test]
    fn test_proxy_scales_sub_progress() {
        let tracker = StepTracker::new();
        tracker.configure("sorter".into(), 100);

        let proxy = ProxyProgress::new(tracker.clone());
        proxy.init(1000);
        proxy.step(500);
        assert_eq!(tracker.left(), 50);
        proxy.step(500);
        assert_eq!(tracker.left(), 0);
        assert!(tracker.take_overflows().is_empty());
    }

    #[test]
    fn test_proxy_does_not_drift_on_uneven_steps() {
        let tracker = StepTracker::new();
        tracker.configure("sorter".into(), 10);

        let proxy = ProxyProgress::new(tracker.clone());
        proxy.init(3);
        proxy.step(1);
        proxy.step(1);
        proxy.step(1);
        assert_eq!(tracker.left(), 0);
        assert!(tracker.take_overflows().is_empty());
    }

    #[test]
    fn test_proxy_without_init_is_inert() {
        let tracker = StepTracker::new();
        tracker.configure("sorter".into(), 10);

        let proxy = ProxyProgress::new(tracker.clone());
        proxy.step(5);
        assert_eq!(tracker.left(), 10);
    }
}
