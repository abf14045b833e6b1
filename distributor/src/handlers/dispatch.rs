use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use data_types::{TenantId, WriteRequest};
use observability_deps::tracing::debug;
use ring::{do_batch, DoBatchError, Operation, Ring};

use super::PushHandler;
use crate::client::{IngesterError, IngesterPool};
use crate::{
    shard_by_all_labels, shard_by_metric_name, Overrides, PushError, ValidatedWrite,
    ValidationError,
};

/// What the dispatch stage acknowledged.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Float samples written with quorum.
    pub accepted_samples: usize,
    /// Histogram samples written with quorum.
    pub accepted_histograms: usize,
    /// Exemplars written with quorum.
    pub accepted_exemplars: usize,
    /// The first validation failure of the request, if any; turns the
    /// response into a partial success.
    pub first_partial_error: Option<ValidationError>,
}

/// The terminal push stage: shards the request across the tenant's
/// ingester subring and waits for a write quorum on every series.
///
/// Fan-out calls are spawned detached with their own timeout, so a caller
/// disconnecting after quorum does not abort in-flight replication.
#[derive(Debug)]
pub struct DispatchHandler {
    ingester_ring: Arc<Ring>,
    pool: Arc<dyn IngesterPool>,
    overrides: Arc<Overrides>,
    rpc_timeout: Duration,
}

impl DispatchHandler {
    /// Create the dispatch stage.
    pub fn new(
        ingester_ring: Arc<Ring>,
        pool: Arc<dyn IngesterPool>,
        overrides: Arc<Overrides>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            ingester_ring,
            pool,
            overrides,
            rpc_timeout,
        }
    }
}

#[async_trait]
impl PushHandler for DispatchHandler {
    type Input = ValidatedWrite;
    type Output = DispatchOutcome;

    async fn handle(
        &self,
        tenant: &TenantId,
        input: Self::Input,
    ) -> Result<Self::Output, PushError> {
        let ValidatedWrite {
            request,
            first_error,
            ..
        } = input;

        let outcome = DispatchOutcome {
            accepted_samples: request.sample_count(),
            accepted_histograms: request.histogram_count(),
            accepted_exemplars: request.exemplar_count(),
            first_partial_error: first_error,
        };
        if request.is_empty() {
            return Ok(outcome);
        }

        let limits = self.overrides.get(tenant);
        let subring = self
            .ingester_ring
            .shuffle_shard(tenant.as_str(), limits.tenant_shard_size);

        // Series tokens first, then metadata tokens, in one array; the
        // key index decides which part of the request it addresses.
        let tokens: Vec<u32> = request
            .timeseries
            .iter()
            .map(|series| shard_by_all_labels(tenant, &series.labels))
            .chain(
                request
                    .metadata
                    .iter()
                    .map(|m| shard_by_metric_name(tenant, &m.metric_family_name)),
            )
            .collect();

        let source = request.source;
        let series = Arc::new(request.timeseries);
        let metadata = Arc::new(request.metadata);
        let pool = Arc::clone(&self.pool);
        let rpc_timeout = self.rpc_timeout;

        do_batch(&subring, Operation::Write, &tokens, move |instance, indexes| {
            let client = pool.client(&instance);
            let series = Arc::clone(&series);
            let metadata = Arc::clone(&metadata);
            async move {
                let mut sub_request = WriteRequest {
                    source,
                    ..Default::default()
                };
                for idx in indexes {
                    if idx < series.len() {
                        sub_request.timeseries.push(series[idx].clone());
                    } else {
                        sub_request.metadata.push(metadata[idx - series.len()].clone());
                    }
                }
                match tokio::time::timeout(rpc_timeout, client.push(sub_request)).await {
                    Ok(result) => result,
                    Err(_) => Err(IngesterError::Timeout),
                }
            }
        })
        .await
        .map_err(|e| match e {
            DoBatchError::Ring(e) => PushError::Quorum(e.to_string()),
            DoBatchError::Call(e) => PushError::Ingester(e),
            DoBatchError::Incomplete => {
                PushError::Quorum("batch ended without a verdict for every key".to_owned())
            }
        })?;

        debug!(
            tenant = %tenant,
            series = outcome.accepted_samples + outcome.accepted_histograms,
            "dispatched write to ingesters"
        );
        Ok(outcome)
    }
}
