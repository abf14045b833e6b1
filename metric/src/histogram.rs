use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{MetricKind, MetricObserver, Observation};

/// A snapshot of a histogram's state.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramObservation<T> {
    /// The sum of all recorded values.
    pub total: T,
    /// The histogram buckets.
    pub buckets: Vec<ObservationBucket<T>>,
}

impl<T> HistogramObservation<T> {
    /// The total number of recorded samples.
    pub fn sample_count(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.count).sum()
    }
}

/// A histogram bucket counting values less than or equal to `le`.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationBucket<T> {
    /// Inclusive upper bound of this bucket.
    pub le: T,
    /// Number of recorded values that fell into this bucket.
    pub count: u64,
}

/// Bucketing options for a [`U64Histogram`].
#[derive(Debug, Clone)]
pub struct U64HistogramOptions {
    buckets: Vec<u64>,
}

impl U64HistogramOptions {
    /// Create options with the provided inclusive upper bucket bounds.
    pub fn new(buckets: impl IntoIterator<Item = u64>) -> Self {
        Self {
            buckets: buckets.into_iter().collect(),
        }
    }
}

#[derive(Debug)]
struct HistogramShared {
    total: u64,
    buckets: Vec<(u64, u64)>,
}

/// A histogram of `u64` values.
#[derive(Debug, Clone)]
pub struct U64Histogram {
    shared: Arc<Mutex<HistogramShared>>,
}

impl U64Histogram {
    /// Record `value` into the first bucket whose bound is `>= value`.
    ///
    /// Values beyond the last bucket bound are silently dropped; use a
    /// `u64::MAX` bound to make the histogram total.
    pub fn record(&self, value: u64) {
        let mut guard = self.shared.lock();
        let shared = &mut *guard;
        if let Some((_, count)) = shared.buckets.iter_mut().find(|(le, _)| value <= *le) {
            *count += 1;
            shared.total = shared.total.wrapping_add(value);
        }
    }

    /// Returns the current state of the histogram.
    pub fn fetch(&self) -> HistogramObservation<u64> {
        let shared = self.shared.lock();
        HistogramObservation {
            total: shared.total,
            buckets: shared
                .buckets
                .iter()
                .map(|(le, count)| ObservationBucket {
                    le: *le,
                    count: *count,
                })
                .collect(),
        }
    }

    /// The total number of recorded samples.
    pub fn sample_count(&self) -> u64 {
        self.shared.lock().buckets.iter().map(|(_, count)| count).sum()
    }
}

impl MetricObserver for U64Histogram {
    type Options = U64HistogramOptions;

    fn create(options: &Self::Options) -> Self {
        Self {
            shared: Arc::new(Mutex::new(HistogramShared {
                total: 0,
                buckets: options.buckets.iter().map(|le| (*le, 0)).collect(),
            })),
        }
    }

    fn kind() -> MetricKind {
        MetricKind::U64Histogram
    }

    fn observe(&self) -> Observation {
        Observation::U64Histogram(self.fetch())
    }
}

/// Bucketing options for a [`DurationHistogram`].
#[derive(Debug, Clone)]
pub struct DurationHistogramOptions {
    buckets: Vec<Duration>,
}

impl DurationHistogramOptions {
    /// Create options with the provided inclusive upper bucket bounds.
    pub fn new(buckets: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            buckets: buckets.into_iter().collect(),
        }
    }
}

impl Default for DurationHistogramOptions {
    fn default() -> Self {
        Self::new([
            Duration::from_millis(1),
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(600),
            Duration::MAX,
        ])
    }
}

/// A histogram of [`Duration`]s.
#[derive(Debug, Clone)]
pub struct DurationHistogram {
    inner: U64Histogram,
}

impl DurationHistogram {
    /// Record `duration`.
    pub fn record(&self, duration: Duration) {
        self.inner
            .record(duration.as_nanos().try_into().unwrap_or(u64::MAX))
    }

    /// The total number of recorded samples.
    pub fn sample_count(&self) -> u64 {
        self.inner.sample_count()
    }

    /// Returns the current state of the histogram.
    pub fn fetch(&self) -> HistogramObservation<Duration> {
        let inner = self.inner.fetch();
        HistogramObservation {
            total: Duration::from_nanos(inner.total),
            buckets: inner
                .buckets
                .into_iter()
                .map(|bucket| ObservationBucket {
                    le: duration_from_nanos_saturating(bucket.le),
                    count: bucket.count,
                })
                .collect(),
        }
    }
}

fn duration_from_nanos_saturating(nanos: u64) -> Duration {
    if nanos == u64::MAX {
        Duration::MAX
    } else {
        Duration::from_nanos(nanos)
    }
}

impl MetricObserver for DurationHistogram {
    type Options = DurationHistogramOptions;

    fn create(options: &Self::Options) -> Self {
        Self {
            inner: U64Histogram::create(&U64HistogramOptions::new(options.buckets.iter().map(
                |le| {
                    if *le == Duration::MAX {
                        u64::MAX
                    } else {
                        le.as_nanos().try_into().unwrap_or(u64::MAX)
                    }
                },
            ))),
        }
    }

    fn kind() -> MetricKind {
        MetricKind::DurationHistogram
    }

    fn observe(&self) -> Observation {
        Observation::DurationHistogram(self.fetch())
    }
}
