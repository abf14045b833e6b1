use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use super::{MetricKind, MetricObserver, Observation};

/// A gauge of `u64` values that can go up and down.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Set the gauge to `value`.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Increase the gauge by `delta`.
    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrease the gauge by `delta`.
    pub fn dec(&self, delta: u64) {
        self.state.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {
    type Options = ();

    fn create(_options: &Self::Options) -> Self {
        Self::default()
    }

    fn kind() -> MetricKind {
        MetricKind::U64Gauge
    }

    fn observe(&self) -> Observation {
        Observation::U64Gauge(self.fetch())
    }
}
