use std::collections::HashMap;
use std::sync::Arc;

use data_types::TenantId;

use crate::RelabelRule;

/// Per-tenant limits consulted by the push pipeline.
///
/// A zero value disables the corresponding limit unless noted otherwise.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum number of labels per series.
    pub max_label_names_per_series: usize,
    /// Maximum length of a label name, in bytes.
    pub max_label_name_length: usize,
    /// Maximum length of a label value, in bytes.
    pub max_label_value_length: usize,
    /// Samples may be at most this far in the future, in milliseconds.
    pub creation_grace_period_ms: i64,
    /// Samples older than this relative to now are rejected, in
    /// milliseconds; 0 disables the check.
    pub max_sample_age_ms: i64,
    /// Push requests per second; 0 disables the limit.
    pub request_rate_limit: f64,
    /// Burst size of the request rate bucket.
    pub request_burst_size: usize,
    /// Ingested samples per second; 0 disables the limit.
    pub ingestion_rate_limit: f64,
    /// Burst size of the ingestion rate bucket.
    pub ingestion_burst_size: usize,
    /// Whether HA deduplication is applied to this tenant's writes.
    pub accept_ha_samples: bool,
    /// The label carrying the HA cluster name.
    pub ha_cluster_label: String,
    /// The label carrying the HA replica name; stripped on accept.
    pub ha_replica_label: String,
    /// Maximum number of distinct HA clusters per tenant; 0 disables.
    pub ha_max_clusters: usize,
    /// Labels removed from every series before validation.
    pub drop_labels: Vec<String>,
    /// Relabel rules applied before validation.
    pub relabel_rules: Vec<RelabelRule>,
    /// Size of this tenant's ingester subring; 0 means the full ring.
    pub tenant_shard_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_label_names_per_series: 30,
            max_label_name_length: 1024,
            max_label_value_length: 2048,
            creation_grace_period_ms: 10 * 60 * 1000,
            max_sample_age_ms: 0,
            request_rate_limit: 0.,
            request_burst_size: 0,
            ingestion_rate_limit: 0.,
            ingestion_burst_size: 0,
            accept_ha_samples: false,
            ha_cluster_label: "cluster".to_owned(),
            ha_replica_label: "__replica__".to_owned(),
            ha_max_clusters: 0,
            drop_labels: vec![],
            relabel_rules: vec![],
            tenant_shard_size: 0,
        }
    }
}

/// Looks up the effective [`Limits`] of a tenant: the per-tenant override
/// if present, the defaults otherwise.
#[derive(Debug, Default)]
pub struct Overrides {
    defaults: Arc<Limits>,
    per_tenant: HashMap<TenantId, Arc<Limits>>,
}

impl Overrides {
    /// Create with `defaults` and the provided per-tenant overrides.
    pub fn new(
        defaults: Limits,
        per_tenant: impl IntoIterator<Item = (TenantId, Limits)>,
    ) -> Self {
        Self {
            defaults: Arc::new(defaults),
            per_tenant: per_tenant
                .into_iter()
                .map(|(tenant, limits)| (tenant, Arc::new(limits)))
                .collect(),
        }
    }

    /// The effective limits for `tenant`.
    pub fn get(&self, tenant: &TenantId) -> Arc<Limits> {
        self.per_tenant
            .get(tenant)
            .map(Arc::clone)
            .unwrap_or_else(|| Arc::clone(&self.defaults))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_lookup() {
        let tenant = TenantId::new("special").unwrap();
        let other = TenantId::new("other").unwrap();

        let overrides = Overrides::new(
            Limits::default(),
            [(
                tenant.clone(),
                Limits {
                    tenant_shard_size: 3,
                    ..Default::default()
                },
            )],
        );

        assert_eq!(overrides.get(&tenant).tenant_shard_size, 3);
        assert_eq!(overrides.get(&other).tenant_shard_size, 0);
    }
}
