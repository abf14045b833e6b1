use std::sync::Arc;

use async_trait::async_trait;
use data_types::{TenantId, WriteRequest};
use stratus_time::TimeProvider;

use super::PushHandler;
use crate::{
    validate_request, DistributorMetrics, Overrides, PushError, RateLimiter, ValidatedWrite,
};

/// Validates every series and enforces the tenant's ingestion rate.
///
/// Invalid series are dropped while the valid remainder proceeds; the
/// first validation error travels with the output so the response can
/// report a partial success.
#[derive(Debug)]
pub struct ValidationHandler<T> {
    overrides: Arc<Overrides>,
    ingestion_rate_limiter: Arc<RateLimiter>,
    metrics: Arc<DistributorMetrics>,
    time_provider: Arc<dyn TimeProvider>,
    inner: T,
}

impl<T> ValidationHandler<T> {
    /// Wrap `inner` with validation.
    pub fn new(
        overrides: Arc<Overrides>,
        ingestion_rate_limiter: Arc<RateLimiter>,
        metrics: Arc<DistributorMetrics>,
        time_provider: Arc<dyn TimeProvider>,
        inner: T,
    ) -> Self {
        Self {
            overrides,
            ingestion_rate_limiter,
            metrics,
            time_provider,
            inner,
        }
    }
}

#[async_trait]
impl<T> PushHandler for ValidationHandler<T>
where
    T: PushHandler<Input = ValidatedWrite>,
{
    type Input = WriteRequest;
    type Output = T::Output;

    async fn handle(
        &self,
        tenant: &TenantId,
        request: Self::Input,
    ) -> Result<Self::Output, PushError> {
        let limits = self.overrides.get(tenant);
        let now_ms = self.time_provider.now().timestamp_millis();

        let validated = validate_request(&limits, now_ms, request);

        if let Some(e) = &validated.first_error {
            self.metrics
                .discarded_samples
                .recorder([
                    ("tenant", tenant.to_string()),
                    ("reason", e.reason().to_owned()),
                ])
                .inc((validated.dropped_samples) as u64);
        }
        if validated.dropped_exemplars > 0 {
            self.metrics
                .discarded_exemplars
                .recorder([("tenant", tenant.to_string())])
                .inc(validated.dropped_exemplars as u64);
        }

        // The ingestion bucket is charged with what survived validation.
        let ingested =
            validated.request.sample_count() + validated.request.histogram_count();
        if ingested > 0 && !self.ingestion_rate_limiter.allow(tenant, ingested as f64) {
            self.metrics
                .discarded_samples
                .recorder([
                    ("tenant", tenant.to_string()),
                    ("reason", "ingestion_rate_limited".to_owned()),
                ])
                .inc(ingested as u64);
            return Err(PushError::IngestionRateLimited {
                tenant: tenant.to_string(),
            });
        }

        self.inner.handle(tenant, validated).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Limits, RateLimitKind, RateLimiterStrategy};
    use assert_matches::assert_matches;
    use data_types::{Labels, Sample, TimeSeries};
    use metric::Registry;
    use stratus_time::{MockProvider, Time};

    #[derive(Debug, Default)]
    struct Sink;

    #[async_trait]
    impl PushHandler for Sink {
        type Input = ValidatedWrite;
        type Output = ValidatedWrite;

        async fn handle(
            &self,
            _tenant: &TenantId,
            input: Self::Input,
        ) -> Result<Self::Output, PushError> {
            Ok(input)
        }
    }

    fn handler(
        limits: Limits,
        provider: Arc<MockProvider>,
    ) -> ValidationHandler<Sink> {
        let overrides = Arc::new(Overrides::new(limits, []));
        let registry = Registry::new();
        ValidationHandler::new(
            Arc::clone(&overrides),
            Arc::new(RateLimiter::new(
                RateLimitKind::Ingestion,
                RateLimiterStrategy::Local,
                overrides,
                Arc::<MockProvider>::clone(&provider) as _,
            )),
            Arc::new(DistributorMetrics::new(&registry)),
            provider as _,
            Sink,
        )
    }

    fn request(n_series: usize, ts: i64) -> WriteRequest {
        WriteRequest {
            timeseries: (0..n_series)
                .map(|i| TimeSeries {
                    labels: Labels::from_pairs([("__name__", &*format!("m{i}"))]).unwrap(),
                    samples: vec![Sample {
                        timestamp: ts,
                        value: 1.,
                    }],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_partial_error_travels_with_output() {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000_000)));
        let handler = handler(Limits::default(), provider);
        let tenant = TenantId::new("t1").unwrap();

        let mut req = request(2, 1_000_000);
        req.timeseries[0].labels = Labels::default();

        let out = handler.handle(&tenant, req).await.unwrap();
        assert!(out.first_error.is_some());
        assert_eq!(out.request.timeseries.len(), 1);
    }

    #[tokio::test]
    async fn test_ingestion_rate_limit() {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000_000)));
        let handler = handler(
            Limits {
                ingestion_rate_limit: 1.,
                ingestion_burst_size: 2,
                ..Default::default()
            },
            provider,
        );
        let tenant = TenantId::new("t1").unwrap();

        handler
            .handle(&tenant, request(2, 1_000_000))
            .await
            .unwrap();
        assert_matches!(
            handler.handle(&tenant, request(2, 1_000_000)).await,
            Err(PushError::IngestionRateLimited { .. })
        );
    }
}
