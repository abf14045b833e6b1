use std::sync::Arc;

use async_trait::async_trait;
use data_types::{TenantId, WriteRequest};

use super::PushHandler;
use crate::{InflightTracker, PushError, RateLimiter};

/// The outermost push stage: instance-wide protection limits plus the
/// per-tenant request rate bucket.
///
/// The inflight accounting guard is held across the whole downstream
/// chain, so a slow dispatch keeps counting against the caps.
#[derive(Debug)]
pub struct InstanceLimitsHandler<T> {
    tracker: Arc<InflightTracker>,
    request_rate_limiter: Arc<RateLimiter>,
    inner: T,
}

impl<T> InstanceLimitsHandler<T> {
    /// Wrap `inner` with instance protection.
    pub fn new(
        tracker: Arc<InflightTracker>,
        request_rate_limiter: Arc<RateLimiter>,
        inner: T,
    ) -> Self {
        Self {
            tracker,
            request_rate_limiter,
            inner,
        }
    }
}

#[async_trait]
impl<T> PushHandler for InstanceLimitsHandler<T>
where
    T: PushHandler<Input = WriteRequest>,
{
    type Input = WriteRequest;
    type Output = T::Output;

    async fn handle(
        &self,
        tenant: &TenantId,
        request: Self::Input,
    ) -> Result<Self::Output, PushError> {
        let _guard = InflightTracker::try_acquire(
            &self.tracker,
            request.approx_size(),
            request.sample_count(),
        )?;

        if !self.request_rate_limiter.allow(tenant, 1.) {
            return Err(PushError::RequestRateLimited {
                tenant: tenant.to_string(),
            });
        }

        self.inner.handle(tenant, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        InstanceLimitError, InstanceLimits, Limits, Overrides, RateLimitKind, RateLimiterStrategy,
    };
    use assert_matches::assert_matches;
    use data_types::{Labels, Sample, TimeSeries};
    use stratus_time::{MockProvider, SystemProvider, Time};

    #[derive(Debug, Default)]
    struct Sink;

    #[async_trait]
    impl PushHandler for Sink {
        type Input = WriteRequest;
        type Output = WriteRequest;

        async fn handle(
            &self,
            _tenant: &TenantId,
            input: Self::Input,
        ) -> Result<Self::Output, PushError> {
            Ok(input)
        }
    }

    fn request() -> WriteRequest {
        WriteRequest {
            timeseries: vec![TimeSeries {
                labels: Labels::from_pairs([("__name__", "up")]).unwrap(),
                samples: vec![Sample {
                    timestamp: 0,
                    value: 1.,
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_passes_through_within_limits() {
        let provider = Arc::new(SystemProvider::new());
        let tracker = Arc::new(InflightTracker::new(
            InstanceLimits::default(),
            Arc::<SystemProvider>::clone(&provider) as _,
        ));
        let limiter = Arc::new(RateLimiter::new(
            RateLimitKind::Request,
            RateLimiterStrategy::Local,
            Arc::new(Overrides::new(Limits::default(), [])),
            provider as _,
        ));
        let handler = InstanceLimitsHandler::new(tracker, limiter, Sink);

        let tenant = TenantId::new("t1").unwrap();
        handler.handle(&tenant, request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_rate_limit() {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let tracker = Arc::new(InflightTracker::new(
            InstanceLimits::default(),
            Arc::<MockProvider>::clone(&provider) as _,
        ));
        let limiter = Arc::new(RateLimiter::new(
            RateLimitKind::Request,
            RateLimiterStrategy::Local,
            Arc::new(Overrides::new(
                Limits {
                    request_rate_limit: 1.,
                    request_burst_size: 1,
                    ..Default::default()
                },
                [],
            )),
            provider as _,
        ));
        let handler = InstanceLimitsHandler::new(tracker, limiter, Sink);

        let tenant = TenantId::new("t1").unwrap();
        handler.handle(&tenant, request()).await.unwrap();
        assert_matches!(
            handler.handle(&tenant, request()).await,
            Err(PushError::RequestRateLimited { .. })
        );
    }

    #[tokio::test]
    async fn test_instance_overload() {
        let provider = Arc::new(SystemProvider::new());
        let tracker = Arc::new(InflightTracker::new(
            InstanceLimits {
                max_inflight_push_request_bytes: 1,
                ..Default::default()
            },
            Arc::<SystemProvider>::clone(&provider) as _,
        ));
        let limiter = Arc::new(RateLimiter::new(
            RateLimitKind::Request,
            RateLimiterStrategy::Infinite,
            Arc::new(Overrides::new(Limits::default(), [])),
            provider as _,
        ));
        let handler = InstanceLimitsHandler::new(tracker, limiter, Sink);

        let tenant = TenantId::new("t1").unwrap();
        assert_matches!(
            handler.handle(&tenant, request()).await,
            Err(PushError::Overloaded(InstanceLimitError::MaxInflightBytes))
        );
    }
}
