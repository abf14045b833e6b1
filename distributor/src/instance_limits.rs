use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use stratus_time::{Time, TimeProvider};
use thiserror::Error;

/// Instance-wide protection limits, independent of any tenant.
///
/// A zero value disables the corresponding limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceLimits {
    /// Maximum number of push requests in flight on this instance.
    pub max_inflight_push_requests: usize,
    /// Maximum total bytes of push requests in flight on this instance.
    pub max_inflight_push_request_bytes: usize,
    /// Maximum smoothed ingestion rate (samples/sec) on this instance.
    pub max_ingestion_rate: f64,
}

/// Errors from the instance protection limits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstanceLimitError {
    /// Too many requests in flight.
    #[error("too many inflight push requests in this distributor")]
    MaxInflightRequests,

    /// Too many request bytes in flight.
    #[error("too many inflight push request bytes in this distributor")]
    MaxInflightBytes,

    /// The smoothed ingestion rate exceeds the cap.
    #[error("this distributor's ingestion rate limit has been reached")]
    MaxIngestionRate,
}

/// Exponentially weighted moving average of a rate, ticked at most once
/// per second.
#[derive(Debug)]
struct EwmaRate {
    state: Mutex<EwmaState>,
    alpha: f64,
}

#[derive(Debug)]
struct EwmaState {
    pending: f64,
    rate: f64,
    last_tick: Time,
}

impl EwmaRate {
    fn new(now: Time) -> Self {
        Self {
            state: Mutex::new(EwmaState {
                pending: 0.,
                rate: 0.,
                last_tick: now,
            }),
            alpha: 0.2,
        }
    }

    fn add(&self, n: f64, now: Time) {
        let mut state = self.state.lock();
        state.pending += n;
        let elapsed = now
            .checked_duration_since(state.last_tick)
            .unwrap_or_default()
            .as_secs_f64();
        if elapsed >= 1. {
            let instant = state.pending / elapsed;
            state.rate = self.alpha * instant + (1. - self.alpha) * state.rate;
            state.pending = 0.;
            state.last_tick = now;
        }
    }

    fn rate(&self, now: Time) -> f64 {
        // Fold in pending observations so a sudden burst is visible
        // before the next tick boundary.
        let state = self.state.lock();
        let elapsed = now
            .checked_duration_since(state.last_tick)
            .unwrap_or_default()
            .as_secs_f64();
        if elapsed >= 1. {
            let instant = state.pending / elapsed;
            self.alpha * instant + (1. - self.alpha) * state.rate
        } else {
            state.rate
        }
    }
}

/// Tracks in-flight pushes and the smoothed ingestion rate against
/// [`InstanceLimits`].
#[derive(Debug)]
pub struct InflightTracker {
    limits: InstanceLimits,
    requests: AtomicUsize,
    bytes: AtomicUsize,
    ingestion: EwmaRate,
    time_provider: Arc<dyn TimeProvider>,
}

/// Releases the in-flight accounting of one push on drop.
#[derive(Debug)]
pub struct InflightGuard {
    tracker: Arc<InflightTracker>,
    bytes: usize,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.tracker.requests.fetch_sub(1, Ordering::Relaxed);
        self.tracker.bytes.fetch_sub(self.bytes, Ordering::Relaxed);
    }
}

impl InflightTracker {
    /// Create a tracker enforcing `limits`.
    pub fn new(limits: InstanceLimits, time_provider: Arc<dyn TimeProvider>) -> Self {
        let now = time_provider.now();
        Self {
            limits,
            requests: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            ingestion: EwmaRate::new(now),
            time_provider,
        }
    }

    /// Admit one push of `request_bytes` carrying `samples` samples.
    ///
    /// On success the returned guard must be held for the lifetime of the
    /// push. A failed admission has already released its accounting.
    pub fn try_acquire(
        tracker: &Arc<Self>,
        request_bytes: usize,
        samples: usize,
    ) -> Result<InflightGuard, InstanceLimitError> {
        let now = tracker.time_provider.now();

        let requests = tracker.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let bytes = tracker.bytes.fetch_add(request_bytes, Ordering::Relaxed) + request_bytes;
        let guard = InflightGuard {
            tracker: Arc::clone(tracker),
            bytes: request_bytes,
        };

        if tracker.limits.max_inflight_push_requests > 0
            && requests > tracker.limits.max_inflight_push_requests
        {
            return Err(InstanceLimitError::MaxInflightRequests);
        }
        if tracker.limits.max_inflight_push_request_bytes > 0
            && bytes > tracker.limits.max_inflight_push_request_bytes
        {
            return Err(InstanceLimitError::MaxInflightBytes);
        }
        if tracker.limits.max_ingestion_rate > 0.
            && tracker.ingestion.rate(now) > tracker.limits.max_ingestion_rate
        {
            return Err(InstanceLimitError::MaxIngestionRate);
        }

        tracker.ingestion.add(samples as f64, now);
        Ok(guard)
    }

    /// The current number of requests in flight.
    pub fn inflight_requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// The current number of request bytes in flight.
    pub fn inflight_bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}
