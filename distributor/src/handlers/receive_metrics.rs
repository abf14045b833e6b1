use std::sync::Arc;

use async_trait::async_trait;
use data_types::{TenantId, WriteRequest};

use super::PushHandler;
use crate::{DistributorMetrics, PushError};

/// Counts incoming samples, exemplars and metadata before any drop, so
/// the incoming counters reflect what clients actually sent.
#[derive(Debug)]
pub struct ReceiveMetricsHandler<T> {
    metrics: Arc<DistributorMetrics>,
    inner: T,
}

impl<T> ReceiveMetricsHandler<T> {
    /// Wrap `inner` with receive accounting.
    pub fn new(metrics: Arc<DistributorMetrics>, inner: T) -> Self {
        Self { metrics, inner }
    }
}

#[async_trait]
impl<T> PushHandler for ReceiveMetricsHandler<T>
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
        let attrs = [("tenant", tenant.to_string())];
        self.metrics
            .incoming_samples
            .recorder(attrs.clone())
            .inc((request.sample_count() + request.histogram_count()) as u64);
        self.metrics
            .incoming_exemplars
            .recorder(attrs.clone())
            .inc(request.exemplar_count() as u64);
        self.metrics
            .incoming_metadata
            .recorder(attrs)
            .inc(request.metadata.len() as u64);

        self.inner.handle(tenant, request).await
    }
}
