use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use super::{MetricKind, MetricObserver, Observation};

/// A monotonic counter of `u64` values.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    /// Increment the counter by `count`.
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    type Options = ();

    fn create(_options: &Self::Options) -> Self {
        Self::default()
    }

    fn kind() -> MetricKind {
        MetricKind::U64Counter
    }

    fn observe(&self) -> Observation {
        Observation::U64Counter(self.fetch())
    }
}
