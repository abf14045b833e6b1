use metric::{DurationHistogram, Metric, Registry, U64Counter};

/// Instruments recorded by the push pipeline.
#[derive(Debug)]
pub struct DistributorMetrics {
    /// Samples seen before any drop, by tenant.
    pub incoming_samples: Metric<U64Counter>,
    /// Exemplars seen before any drop, by tenant.
    pub incoming_exemplars: Metric<U64Counter>,
    /// Metadata entries seen before any drop, by tenant.
    pub incoming_metadata: Metric<U64Counter>,
    /// Samples dropped by HA dedup, by tenant and cluster.
    pub deduped_samples: Metric<U64Counter>,
    /// Series dropped by relabel rules, by tenant.
    pub relabel_dropped_series: Metric<U64Counter>,
    /// Samples discarded by validation or rate limiting, by tenant and
    /// reason.
    pub discarded_samples: Metric<U64Counter>,
    /// Exemplars discarded by validation, by tenant.
    pub discarded_exemplars: Metric<U64Counter>,
    /// End-to-end push latency.
    pub push_duration: Metric<DurationHistogram>,
}

impl DistributorMetrics {
    /// Register all push-path instruments against `registry`.
    pub fn new(registry: &Registry) -> Self {
        Self {
            incoming_samples: registry.register_metric(
                "distributor_samples_in_total",
                "samples received, before any filtering or validation",
            ),
            incoming_exemplars: registry.register_metric(
                "distributor_exemplars_in_total",
                "exemplars received, before any filtering or validation",
            ),
            incoming_metadata: registry.register_metric(
                "distributor_metadata_in_total",
                "metadata entries received, before any filtering or validation",
            ),
            deduped_samples: registry.register_metric(
                "distributor_deduped_samples_total",
                "samples dropped because they came from a non-elected HA replica",
            ),
            relabel_dropped_series: registry.register_metric(
                "distributor_relabel_dropped_series_total",
                "series dropped by tenant relabel rules",
            ),
            discarded_samples: registry.register_metric(
                "distributor_discarded_samples_total",
                "samples discarded by validation or rate limits",
            ),
            discarded_exemplars: registry.register_metric(
                "distributor_discarded_exemplars_total",
                "exemplars discarded by validation",
            ),
            push_duration: registry.register_metric(
                "distributor_push_duration_seconds",
                "end-to-end push handling latency",
            ),
        }
    }
}
