use std::sync::Arc;

use async_trait::async_trait;
use data_types::{TenantId, WriteRequest};

use super::PushHandler;
use crate::{relabel, DistributorMetrics, Overrides, PushError};

/// Applies the tenant's relabel rules and drop-labels list.
///
/// Series dropped by a rule, or left without any label, are removed from
/// the request and counted.
#[derive(Debug)]
pub struct RelabelHandler<T> {
    overrides: Arc<Overrides>,
    metrics: Arc<DistributorMetrics>,
    inner: T,
}

impl<T> RelabelHandler<T> {
    /// Wrap `inner` with relabeling.
    pub fn new(overrides: Arc<Overrides>, metrics: Arc<DistributorMetrics>, inner: T) -> Self {
        Self {
            overrides,
            metrics,
            inner,
        }
    }
}

#[async_trait]
impl<T> PushHandler for RelabelHandler<T>
where
    T: PushHandler<Input = WriteRequest>,
{
    type Input = WriteRequest;
    type Output = T::Output;

    async fn handle(
        &self,
        tenant: &TenantId,
        mut request: Self::Input,
    ) -> Result<Self::Output, PushError> {
        let limits = self.overrides.get(tenant);
        if limits.relabel_rules.is_empty() && limits.drop_labels.is_empty() {
            return self.inner.handle(tenant, request).await;
        }

        let mut dropped = 0_u64;
        request.timeseries.retain_mut(|series| {
            match relabel(&series.labels, &limits.relabel_rules, &limits.drop_labels) {
                Some(labels) => {
                    series.labels = labels;
                    true
                }
                None => {
                    dropped += 1;
                    false
                }
            }
        });

        if dropped > 0 {
            self.metrics
                .relabel_dropped_series
                .recorder([("tenant", tenant.to_string())])
                .inc(dropped);
        }

        self.inner.handle(tenant, request).await
    }
}
