use std::sync::Arc;
use std::time::Instant;

use data_types::{TenantId, WriteRequest};
use metric::Registry;
use observability_deps::tracing::info;
use ring::{KvStore, Ring};
use stratus_time::TimeProvider;

use crate::client::IngesterPool;
use crate::{
    DispatchHandler, DistributorConfig, DistributorMetrics, HaDedupeHandler, HaTracker,
    InflightTracker, InstanceLimitsHandler, Overrides, PushError, PushHandler, RateLimitKind,
    RateLimiter, RateLimiterStrategy, ReceiveMetricsHandler, RelabelHandler, ValidationError,
    ValidationHandler,
};

type PushChain = InstanceLimitsHandler<
    ReceiveMetricsHandler<
        HaDedupeHandler<RelabelHandler<ValidationHandler<DispatchHandler>>>,
    >,
>;

/// The acknowledgment of a push that reached its write quorum.
#[derive(Debug)]
pub struct PushResponse {
    /// Float samples accepted.
    pub accepted_samples: usize,
    /// Histogram samples accepted.
    pub accepted_histograms: usize,
    /// Exemplars accepted.
    pub accepted_exemplars: usize,
    /// The first validation failure, when only part of the request was
    /// accepted.
    pub partial_error: Option<ValidationError>,
}

impl PushResponse {
    /// The HTTP status of this response: 200 on full accept, 202 on
    /// partial success.
    pub fn http_status(&self) -> u16 {
        if self.partial_error.is_some() {
            202
        } else {
            200
        }
    }
}

/// The distributor: validates, deduplicates and shards each write across
/// the ingester ring, and merges read requests across it.
#[derive(Debug)]
pub struct Distributor {
    chain: PushChain,
    pub(crate) ingester_ring: Arc<Ring>,
    pub(crate) pool: Arc<dyn IngesterPool>,
    pub(crate) overrides: Arc<Overrides>,
    pub(crate) config: DistributorConfig,
    metrics: Arc<DistributorMetrics>,
}

impl Distributor {
    /// Assemble a distributor and its push handler chain.
    ///
    /// `distributor_ring` feeds the global rate limiting strategy; without
    /// it rate limits fall back to the infinite strategy. `ha_kv` enables
    /// the HA tracker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DistributorConfig,
        overrides: Arc<Overrides>,
        ingester_ring: Arc<Ring>,
        distributor_ring: Option<Arc<Ring>>,
        ha_kv: Option<Arc<dyn KvStore>>,
        pool: Arc<dyn IngesterPool>,
        time_provider: Arc<dyn TimeProvider>,
        registry: &Registry,
    ) -> Self {
        let metrics = Arc::new(DistributorMetrics::new(registry));

        let strategy = match &distributor_ring {
            Some(ring) => RateLimiterStrategy::Global {
                distributor_ring: Arc::clone(ring),
            },
            None => RateLimiterStrategy::Infinite,
        };
        let request_rate_limiter = Arc::new(RateLimiter::new(
            RateLimitKind::Request,
            strategy.clone(),
            Arc::clone(&overrides),
            Arc::clone(&time_provider),
        ));
        let ingestion_rate_limiter = Arc::new(RateLimiter::new(
            RateLimitKind::Ingestion,
            strategy,
            Arc::clone(&overrides),
            Arc::clone(&time_provider),
        ));
        let inflight = Arc::new(InflightTracker::new(
            config.instance_limits,
            Arc::clone(&time_provider),
        ));
        let ha_tracker = ha_kv.map(|kv| {
            Arc::new(HaTracker::new(
                config.ha_tracker.clone(),
                kv,
                Arc::clone(&time_provider),
                registry,
            ))
        });

        let chain = InstanceLimitsHandler::new(
            inflight,
            request_rate_limiter,
            ReceiveMetricsHandler::new(
                Arc::clone(&metrics),
                HaDedupeHandler::new(
                    Arc::clone(&overrides),
                    ha_tracker,
                    Arc::clone(&metrics),
                    RelabelHandler::new(
                        Arc::clone(&overrides),
                        Arc::clone(&metrics),
                        ValidationHandler::new(
                            Arc::clone(&overrides),
                            ingestion_rate_limiter,
                            Arc::clone(&metrics),
                            Arc::clone(&time_provider),
                            DispatchHandler::new(
                                Arc::clone(&ingester_ring),
                                Arc::clone(&pool),
                                Arc::clone(&overrides),
                                config.rpc_timeout,
                            ),
                        ),
                    ),
                ),
            ),
        );

        info!("distributor initialised");
        Self {
            chain,
            ingester_ring,
            pool,
            overrides,
            config,
            metrics,
        }
    }

    /// Push `request` on behalf of `tenant`.
    ///
    /// Returns once a write quorum of ingesters has accepted every series.
    pub async fn push(
        &self,
        tenant: &TenantId,
        request: WriteRequest,
    ) -> Result<PushResponse, PushError> {
        let start = Instant::now();
        let result = self.chain.handle(tenant, request).await;
        self.metrics
            .push_duration
            .recorder([(
                "status",
                if result.is_ok() { "ok" } else { "error" },
            )])
            .record(start.elapsed());

        result.map(|outcome| PushResponse {
            accepted_samples: outcome.accepted_samples,
            accepted_histograms: outcome.accepted_histograms,
            accepted_exemplars: outcome.accepted_exemplars,
            partial_error: outcome.first_partial_error,
        })
    }
}
