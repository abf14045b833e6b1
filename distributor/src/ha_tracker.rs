use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use data_types::TenantId;
use metric::{Metric, Registry, U64Counter};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use ring::{update_typed, KvError, KvStore};
use serde::{Deserialize, Serialize};
use stratus_time::TimeProvider;
use thiserror::Error;

/// Configuration of the [`HaTracker`].
#[derive(Debug, Clone)]
pub struct HaTrackerConfig {
    /// After this long without samples from the elected replica, another
    /// replica may take over the election.
    pub failover_timeout: Duration,
    /// Elections are refreshed in the KV store at most this often, to
    /// avoid thrashing it on every request.
    pub update_min_interval: Duration,
}

impl Default for HaTrackerConfig {
    fn default() -> Self {
        Self {
            failover_timeout: Duration::from_secs(30),
            update_min_interval: Duration::from_secs(15),
        }
    }
}

/// The replicated election record of one (tenant, cluster) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDesc {
    /// The currently elected replica.
    pub replica: String,
    /// Unix milliseconds of the last accepted sample from the elected
    /// replica.
    pub received_at: i64,
    /// Unix milliseconds at which this replica won the election.
    pub elected_at: i64,
}

/// Errors from [`HaTracker::check_replica`].
#[derive(Debug, Error)]
pub enum HaTrackerError {
    /// The sending replica is not the elected one.
    #[error("replica {replica} is not the elected replica for cluster {cluster}")]
    ReplicasNotMatch {
        /// The cluster the sample belongs to.
        cluster: String,
        /// The non-elected sender.
        replica: String,
    },

    /// The tenant exceeded its distinct-cluster budget.
    #[error("too many HA clusters for tenant (limit: {limit})")]
    TooManyClusters {
        /// The configured cap.
        limit: usize,
    },

    /// The KV store could not be consulted.
    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accept,
    Reject,
}

/// Elects one replica per (tenant, cluster) pair and rejects samples from
/// the others.
///
/// Elections live in the shared KV store, updated with compare-and-swap;
/// a local cache short-circuits the common case of the elected replica
/// pushing steadily.
#[derive(Debug)]
pub struct HaTracker {
    config: HaTrackerConfig,
    kv: Arc<dyn KvStore>,
    time_provider: Arc<dyn TimeProvider>,
    cache: Mutex<HashMap<(TenantId, String), ReplicaDesc>>,
    elected_replica_changes: Metric<U64Counter>,
}

impl HaTracker {
    /// Create a tracker backed by `kv`.
    pub fn new(
        config: HaTrackerConfig,
        kv: Arc<dyn KvStore>,
        time_provider: Arc<dyn TimeProvider>,
        registry: &Registry,
    ) -> Self {
        Self {
            config,
            kv,
            time_provider,
            cache: Mutex::new(HashMap::new()),
            elected_replica_changes: registry.register_metric(
                "ha_tracker_elected_replica_changes_total",
                "number of times the elected replica changed for a (tenant, cluster) pair",
            ),
        }
    }

    fn kv_key(tenant: &TenantId, cluster: &str) -> String {
        format!("ha-tracker/{tenant}/{cluster}")
    }

    fn kv_prefix(tenant: &TenantId) -> String {
        format!("ha-tracker/{tenant}/")
    }

    /// Decide whether a sample from `replica` of `cluster` is accepted.
    ///
    /// `max_clusters` of zero disables the distinct-cluster cap.
    pub async fn check_replica(
        &self,
        tenant: &TenantId,
        cluster: &str,
        replica: &str,
        max_clusters: usize,
    ) -> Result<(), HaTrackerError> {
        let now = self.time_provider.now().timestamp_millis();
        let cache_key = (tenant.clone(), cluster.to_owned());

        // Fast path: a fresh local election answers without touching the
        // KV store.
        let cached = self.cache.lock().get(&cache_key).cloned();
        if let Some(desc) = cached {
            let age = now - desc.received_at;
            if desc.replica == replica
                && age < self.config.update_min_interval.as_millis() as i64
            {
                return Ok(());
            }
            if desc.replica != replica && age <= self.config.failover_timeout.as_millis() as i64 {
                return Err(HaTrackerError::ReplicasNotMatch {
                    cluster: cluster.to_owned(),
                    replica: replica.to_owned(),
                });
            }
        } else if max_clusters > 0 {
            let known = self.kv.list(&Self::kv_prefix(tenant)).await?;
            let key = Self::kv_key(tenant, cluster);
            if known.len() >= max_clusters && !known.contains(&key) {
                return Err(HaTrackerError::TooManyClusters {
                    limit: max_clusters,
                });
            }
        }

        // Slow path: read-modify-write the election. Conflicting writers
        // are serialized by the CAS; a lost update restarts the check
        // against the fresh record.
        let config = self.config.clone();
        let replica_owned = replica.to_owned();
        let mut verdict = Verdict::Accept;
        let mut observed: Option<ReplicaDesc> = None;

        let written = update_typed::<ReplicaDesc, _>(
            &*self.kv,
            &Self::kv_key(tenant, cluster),
            |current| {
                match current {
                    None => {
                        verdict = Verdict::Accept;
                        let desc = ReplicaDesc {
                            replica: replica_owned.clone(),
                            received_at: now,
                            elected_at: now,
                        };
                        observed = Some(desc.clone());
                        Some(desc)
                    }
                    Some(desc) if desc.replica == replica_owned => {
                        verdict = Verdict::Accept;
                        // Refresh opportunistically, rate-limited.
                        if now - desc.received_at
                            >= config.update_min_interval.as_millis() as i64
                        {
                            let refreshed = ReplicaDesc {
                                received_at: now,
                                ..desc
                            };
                            observed = Some(refreshed.clone());
                            Some(refreshed)
                        } else {
                            observed = Some(desc);
                            None
                        }
                    }
                    Some(desc) => {
                        if now - desc.received_at > config.failover_timeout.as_millis() as i64 {
                            verdict = Verdict::Accept;
                            let takeover = ReplicaDesc {
                                replica: replica_owned.clone(),
                                received_at: now,
                                elected_at: now,
                            };
                            observed = Some(takeover.clone());
                            Some(takeover)
                        } else {
                            verdict = Verdict::Reject;
                            observed = Some(desc);
                            None
                        }
                    }
                }
            },
        )
        .await?;

        if let Some(desc) = written.or(observed) {
            let mut cache = self.cache.lock();
            let changed = cache
                .get(&cache_key)
                .map(|old| old.replica != desc.replica)
                .unwrap_or(false);
            if changed {
                debug!(
                    tenant = %tenant,
                    cluster,
                    elected = %desc.replica,
                    "HA elected replica changed"
                );
                self.elected_replica_changes
                    .recorder([
                        ("tenant", tenant.to_string()),
                        ("cluster", cluster.to_owned()),
                    ])
                    .inc(1);
            }
            cache.insert(cache_key, desc);
        }

        match verdict {
            Verdict::Accept => Ok(()),
            Verdict::Reject => Err(HaTrackerError::ReplicasNotMatch {
                cluster: cluster.to_owned(),
                replica: replica.to_owned(),
            }),
        }
    }
}
