use std::sync::Arc;

use async_trait::async_trait;
use data_types::{TenantId, WriteRequest};
use observability_deps::tracing::debug;

use super::PushHandler;
use crate::{
    DistributorMetrics, HaTracker, HaTrackerError, Overrides, PushError, ValidationError,
};

/// Applies HA deduplication: accepts samples from the elected replica of
/// each (tenant, cluster) pair and drops the rest.
///
/// On accept the replica label is stripped, so identical series from
/// different replicas collapse onto the same stored series.
#[derive(Debug)]
pub struct HaDedupeHandler<T> {
    overrides: Arc<Overrides>,
    tracker: Option<Arc<HaTracker>>,
    metrics: Arc<DistributorMetrics>,
    inner: T,
}

impl<T> HaDedupeHandler<T> {
    /// Wrap `inner` with HA dedup; `tracker` of `None` disables the stage.
    pub fn new(
        overrides: Arc<Overrides>,
        tracker: Option<Arc<HaTracker>>,
        metrics: Arc<DistributorMetrics>,
        inner: T,
    ) -> Self {
        Self {
            overrides,
            tracker,
            metrics,
            inner,
        }
    }
}

#[async_trait]
impl<T> PushHandler for HaDedupeHandler<T>
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
        let tracker = match (&self.tracker, limits.accept_ha_samples) {
            (Some(tracker), true) => tracker,
            _ => return self.inner.handle(tenant, request).await,
        };

        // The cluster/replica pair is carried on the series labels; all
        // series of one request come from one scrape, so the first series
        // is authoritative.
        let (cluster, replica) = match request.timeseries.first() {
            Some(series) => (
                series.labels.get(&limits.ha_cluster_label).map(str::to_owned),
                series.labels.get(&limits.ha_replica_label).map(str::to_owned),
            ),
            None => (None, None),
        };
        let (cluster, replica) = match (cluster, replica) {
            (Some(cluster), Some(replica)) => (cluster, replica),
            // Not an HA pair: pass through untouched.
            _ => return self.inner.handle(tenant, request).await,
        };

        match tracker
            .check_replica(tenant, &cluster, &replica, limits.ha_max_clusters)
            .await
        {
            Ok(()) => {
                for series in &mut request.timeseries {
                    series.labels = series.labels.without_label(&limits.ha_replica_label);
                }
                self.inner.handle(tenant, request).await
            }
            Err(HaTrackerError::ReplicasNotMatch { cluster, replica }) => {
                debug!(
                    tenant = %tenant,
                    cluster = %cluster,
                    replica = %replica,
                    "dropping write from non-elected HA replica"
                );
                self.metrics
                    .deduped_samples
                    .recorder([
                        ("tenant", tenant.to_string()),
                        ("cluster", cluster.clone()),
                    ])
                    .inc((request.sample_count() + request.histogram_count()) as u64);
                Err(PushError::HaDeduped { cluster, replica })
            }
            Err(HaTrackerError::TooManyClusters { limit }) => {
                Err(PushError::Validation(ValidationError::TooManyHaClusters {
                    limit,
                }))
            }
            Err(e @ HaTrackerError::Kv(_)) => Err(PushError::HaTracker(e)),
        }
    }
}
