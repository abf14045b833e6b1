use std::collections::{BTreeMap, BTreeSet, HashMap};

use data_types::{Labels, MetricMetadata, TenantId, TimeSeries};
use ring::{do_until_quorum, Operation, QuorumError, ReplicationSet, RingError};
use thiserror::Error;

use crate::client::{
    IngesterError, LabelMatcher, LabelNameValues, LabelValueSeriesCount, QueryStreamRequest,
    UserStatsResponse,
};
use crate::Distributor;

/// Errors from the distributor's read paths.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The tenant's subring could not provide a replication set.
    #[error(transparent)]
    Ring(#[from] RingError),

    /// Too many ingesters failed to answer.
    #[error("ingester query failed: {0}")]
    Ingester(#[from] IngesterError),

    /// All calls finished without a quorum of responses.
    #[error("quorum of ingester responses not reached")]
    Quorum,
}

fn map_quorum(e: QuorumError<IngesterError>) -> QueryError {
    match e {
        QuorumError::Call(e) => QueryError::Ingester(e),
        QuorumError::Incomplete => QueryError::Quorum,
    }
}

/// Merge per-zone series counts into one approximation.
///
/// With two or more zones every series lands once per zone, so the `max`
/// over zones under-approximates the truth; with a single zone each
/// series appears on `replication_factor` instances, so `sum / RF` does.
pub fn approximate_from_zones(
    zone_count: usize,
    replication_factor: usize,
    by_zone: &HashMap<String, u64>,
) -> u64 {
    if zone_count >= 2 {
        by_zone.values().copied().max().unwrap_or(0)
    } else {
        by_zone.values().sum::<u64>() / replication_factor.max(1) as u64
    }
}

impl Distributor {
    fn read_set(&self, tenant: &TenantId) -> Result<ReplicationSet, QueryError> {
        let limits = self.overrides.get(tenant);
        let subring = self
            .ingester_ring
            .shuffle_shard(tenant.as_str(), limits.tenant_shard_size);
        Ok(subring.replication_set_for_operation(Operation::Read)?)
    }

    fn minimize(&self) -> bool {
        self.config.minimize_ingester_requests
    }

    /// Read samples of matching series in `[start, end]`, merged across
    /// the tenant's ingesters.
    pub async fn query(
        &self,
        tenant: &TenantId,
        start: i64,
        end: i64,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<TimeSeries>, QueryError> {
        let set = self.read_set(tenant)?;
        let request = QueryStreamRequest {
            start,
            end,
            matchers,
        };

        let responses = do_until_quorum(&set, self.minimize(), |instance| {
            let client = self.pool.client(&instance);
            let request = request.clone();
            async move { client.query_stream(request).await }
        })
        .await
        .map_err(map_quorum)?;

        let mut merged: BTreeMap<u64, TimeSeries> = BTreeMap::new();
        for response in responses {
            for series in response.timeseries {
                let entry = merged
                    .entry(series.labels.fingerprint())
                    .or_insert_with(|| TimeSeries {
                        labels: series.labels.clone(),
                        ..Default::default()
                    });
                entry.samples.extend(series.samples);
                entry.histograms.extend(series.histograms);
            }
        }

        Ok(merged
            .into_values()
            .map(|mut series| {
                series.samples.sort_by_key(|s| s.timestamp);
                series.samples.dedup_by_key(|s| s.timestamp);
                series.histograms.sort_by_key(|h| h.timestamp);
                series.histograms.dedup_by_key(|h| h.timestamp);
                series
            })
            .collect())
    }

    /// Distinct label names of matching series (set union).
    pub async fn label_names(
        &self,
        tenant: &TenantId,
        start: i64,
        end: i64,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<String>, QueryError> {
        let set = self.read_set(tenant)?;
        let responses = do_until_quorum(&set, self.minimize(), |instance| {
            let client = self.pool.client(&instance);
            let matchers = matchers.clone();
            async move { client.label_names(start, end, matchers).await }
        })
        .await
        .map_err(map_quorum)?;

        let names: BTreeSet<String> = responses.into_iter().flatten().collect();
        Ok(names.into_iter().collect())
    }

    /// Distinct values of `label_name` of matching series (set union).
    pub async fn label_values(
        &self,
        tenant: &TenantId,
        label_name: String,
        start: i64,
        end: i64,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<String>, QueryError> {
        let set = self.read_set(tenant)?;
        let responses = do_until_quorum(&set, self.minimize(), |instance| {
            let client = self.pool.client(&instance);
            let label_name = label_name.clone();
            let matchers = matchers.clone();
            async move { client.label_values(label_name, start, end, matchers).await }
        })
        .await
        .map_err(map_quorum)?;

        let values: BTreeSet<String> = responses.into_iter().flatten().collect();
        Ok(values.into_iter().collect())
    }

    /// The label sets of matching series, deduplicated.
    pub async fn metrics_for_label_matchers(
        &self,
        tenant: &TenantId,
        start: i64,
        end: i64,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<Labels>, QueryError> {
        let set = self.read_set(tenant)?;
        let responses = do_until_quorum(&set, self.minimize(), |instance| {
            let client = self.pool.client(&instance);
            let matchers = matchers.clone();
            async move {
                client
                    .metrics_for_label_matchers(start, end, matchers)
                    .await
            }
        })
        .await
        .map_err(map_quorum)?;

        let mut merged: BTreeMap<u64, Labels> = BTreeMap::new();
        for labels in responses.into_iter().flatten() {
            merged.entry(labels.fingerprint()).or_insert(labels);
        }
        Ok(merged.into_values().collect())
    }

    /// All metric metadata of the tenant, deduplicated by family name.
    pub async fn metrics_metadata(
        &self,
        tenant: &TenantId,
    ) -> Result<Vec<MetricMetadata>, QueryError> {
        let set = self.read_set(tenant)?;
        let responses = do_until_quorum(&set, self.minimize(), |instance| {
            let client = self.pool.client(&instance);
            async move { client.metrics_metadata().await }
        })
        .await
        .map_err(map_quorum)?;

        let mut merged: BTreeMap<String, MetricMetadata> = BTreeMap::new();
        for metadata in responses.into_iter().flatten() {
            merged
                .entry(metadata.metric_family_name.clone())
                .or_insert(metadata);
        }
        Ok(merged.into_values().collect())
    }

    /// Aggregated ingestion statistics of the tenant.
    ///
    /// Rates add up across ingesters; the series count is divided by the
    /// replication factor since each series lives on RF replicas.
    pub async fn user_stats(&self, tenant: &TenantId) -> Result<UserStatsResponse, QueryError> {
        let set = self.read_set(tenant)?;
        // Stats must count every ingester, so request minimization does
        // not apply here.
        let responses = do_until_quorum(&set, false, |instance| {
            let client = self.pool.client(&instance);
            async move { client.user_stats().await }
        })
        .await
        .map_err(map_quorum)?;

        let replication_factor = self.ingester_ring.config().replication_factor.max(1);
        let mut total = UserStatsResponse::default();
        for stats in &responses {
            total.ingestion_rate += stats.ingestion_rate;
            total.api_ingestion_rate += stats.api_ingestion_rate;
            total.rule_ingestion_rate += stats.rule_ingestion_rate;
            total.num_series += stats.num_series;
        }
        total.num_series /= replication_factor as u64;
        Ok(total)
    }

    /// The merged (label name → values) inventory of matching series.
    pub async fn label_names_and_values(
        &self,
        tenant: &TenantId,
        matchers: Vec<LabelMatcher>,
    ) -> Result<Vec<LabelNameValues>, QueryError> {
        let set = self.read_set(tenant)?;
        let responses = do_until_quorum(&set, self.minimize(), |instance| {
            let client = self.pool.client(&instance);
            let matchers = matchers.clone();
            async move { client.label_names_and_values(matchers).await }
        })
        .await
        .map_err(map_quorum)?;

        let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for page in responses.into_iter().flatten() {
            for item in page.items {
                merged
                    .entry(item.name)
                    .or_default()
                    .extend(item.values);
            }
        }
        Ok(merged
            .into_iter()
            .map(|(name, values)| LabelNameValues {
                name,
                values: values.into_iter().collect(),
            })
            .collect())
    }

    /// Per-(label name, label value) series counts, approximated across
    /// zones, plus the total across all values.
    pub async fn label_values_cardinality(
        &self,
        tenant: &TenantId,
        label_names: Vec<String>,
        matchers: Vec<LabelMatcher>,
    ) -> Result<(u64, Vec<LabelValueSeriesCount>), QueryError> {
        let set = self.read_set(tenant)?;
        let zone_count = set.zones().len();
        let replication_factor = self.ingester_ring.config().replication_factor;

        // Cardinality must observe every zone, so request minimization
        // does not apply here.
        let responses = do_until_quorum(&set, false, |instance| {
            let client = self.pool.client(&instance);
            let label_names = label_names.clone();
            let matchers = matchers.clone();
            let zone = instance.zone.clone();
            async move {
                client
                    .label_values_cardinality(label_names, matchers)
                    .await
                    .map(|pages| (zone, pages))
            }
        })
        .await
        .map_err(map_quorum)?;

        // Union per (name, value, zone); counts from replicas of one zone
        // add up, then zones are merged with the approximation rule.
        let mut by_pair: BTreeMap<(String, String), HashMap<String, u64>> = BTreeMap::new();
        for (zone, pages) in responses {
            for page in pages {
                for item in page.items {
                    *by_pair
                        .entry((item.label_name, item.label_value))
                        .or_default()
                        .entry(zone.clone())
                        .or_default() += item.series_count;
                }
            }
        }

        let items: Vec<LabelValueSeriesCount> = by_pair
            .into_iter()
            .map(|((label_name, label_value), by_zone)| LabelValueSeriesCount {
                label_name,
                label_value,
                series_count: approximate_from_zones(zone_count, replication_factor, &by_zone),
            })
            .collect();
        let total = items.iter().map(|i| i.series_count).sum();
        Ok((total, items))
    }
}
