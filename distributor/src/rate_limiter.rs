use std::collections::HashMap;
use std::sync::Arc;

use data_types::TenantId;
use parking_lot::Mutex;
use ring::{Operation, Ring};
use stratus_time::{Time, TimeProvider};

use crate::{Limits, Overrides};

/// Which per-tenant rate this limiter enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    /// Push requests per second.
    Request,
    /// Ingested samples per second.
    Ingestion,
}

impl RateLimitKind {
    fn limit(&self, limits: &Limits) -> f64 {
        match self {
            Self::Request => limits.request_rate_limit,
            Self::Ingestion => limits.ingestion_rate_limit,
        }
    }

    fn burst(&self, limits: &Limits) -> usize {
        match self {
            Self::Request => limits.request_burst_size,
            Self::Ingestion => limits.ingestion_burst_size,
        }
    }
}

/// How the configured (global) limit translates into this instance's
/// local share.
#[derive(Debug, Clone)]
pub enum RateLimiterStrategy {
    /// No limiting at all; used when the distributor ring cannot be
    /// observed and a divided limit would be meaningless.
    Infinite,
    /// Enforce the configured limit locally as-is.
    Local,
    /// Divide the configured limit by the number of healthy distributors,
    /// recomputed as ring membership changes.
    Global {
        /// The distributors' own ring.
        distributor_ring: Arc<Ring>,
    },
}

impl RateLimiterStrategy {
    fn effective_limit(&self, configured: f64) -> Option<f64> {
        match self {
            Self::Infinite => None,
            Self::Local => Some(configured),
            Self::Global { distributor_ring } => {
                let healthy = distributor_ring.healthy_instance_count(Operation::Write).max(1);
                Some(configured / healthy as f64)
            }
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Time,
}

/// A per-tenant token bucket.
///
/// Tokens refill continuously at the effective limit; the bucket holds at
/// most the configured burst. A configured limit of zero disables the
/// check entirely.
#[derive(Debug)]
pub struct RateLimiter {
    kind: RateLimitKind,
    strategy: RateLimiterStrategy,
    overrides: Arc<Overrides>,
    buckets: Mutex<HashMap<TenantId, Bucket>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl RateLimiter {
    /// Create a limiter for `kind` using `strategy`.
    pub fn new(
        kind: RateLimitKind,
        strategy: RateLimiterStrategy,
        overrides: Arc<Overrides>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            kind,
            strategy,
            overrides,
            buckets: Mutex::new(HashMap::new()),
            time_provider,
        }
    }

    /// Whether `n` units are admitted for `tenant` right now; admitted
    /// units are deducted from the bucket.
    pub fn allow(&self, tenant: &TenantId, n: f64) -> bool {
        let limits = self.overrides.get(tenant);
        let configured = self.kind.limit(&limits);
        if configured <= 0. {
            return true;
        }
        let limit = match self.strategy.effective_limit(configured) {
            Some(limit) => limit,
            None => return true,
        };
        let burst = (self.kind.burst(&limits).max(1)) as f64;

        let now = self.time_provider.now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(tenant.clone()).or_insert(Bucket {
            tokens: burst,
            updated: now,
        });

        let elapsed = now
            .checked_duration_since(bucket.updated)
            .unwrap_or_default()
            .as_secs_f64();
        bucket.tokens = burst.min(bucket.tokens + elapsed * limit);
        bucket.updated = now;

        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_time::{MockProvider, Time};
    use std::time::Duration;

    fn limiter(strategy: RateLimiterStrategy, provider: Arc<MockProvider>) -> RateLimiter {
        let overrides = Overrides::new(
            Limits {
                request_rate_limit: 10.,
                request_burst_size: 2,
                ..Default::default()
            },
            [],
        );
        RateLimiter::new(
            RateLimitKind::Request,
            strategy,
            Arc::new(overrides),
            provider as _,
        )
    }

    #[test]
    fn test_burst_then_refill() {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let limiter = limiter(RateLimiterStrategy::Local, Arc::clone(&provider));
        let tenant = TenantId::new("t1").unwrap();

        assert!(limiter.allow(&tenant, 1.));
        assert!(limiter.allow(&tenant, 1.));
        assert!(!limiter.allow(&tenant, 1.));

        // 10/s refill: after 100ms one token is back.
        provider.inc(Duration::from_millis(100));
        assert!(limiter.allow(&tenant, 1.));
        assert!(!limiter.allow(&tenant, 1.));
    }

    #[test]
    fn test_disabled_limit() {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let overrides = Overrides::new(Limits::default(), []);
        let limiter = RateLimiter::new(
            RateLimitKind::Request,
            RateLimiterStrategy::Local,
            Arc::new(overrides),
            provider as _,
        );
        let tenant = TenantId::new("t1").unwrap();
        for _ in 0..1_000 {
            assert!(limiter.allow(&tenant, 1.));
        }
    }

    #[test]
    fn test_infinite_strategy() {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let limiter = limiter(RateLimiterStrategy::Infinite, provider);
        let tenant = TenantId::new("t1").unwrap();
        for _ in 0..1_000 {
            assert!(limiter.allow(&tenant, 1.));
        }
    }
}
