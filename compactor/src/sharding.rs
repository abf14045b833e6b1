use std::fmt::Debug;
use std::sync::Arc;

use data_types::TenantId;
use ring::{ring_token, Operation, Ring, RingError};

use crate::{ConfigProvider, Job};

/// Whether `instance_addr` owns the token of `key` in `ring`.
///
/// Exactly one instance of the ring owns any key: the first one on the
/// circle after the key's token.
pub fn instance_owns_token_in_ring(
    ring: &Ring,
    instance_addr: &str,
    key: &str,
) -> Result<bool, RingError> {
    let set = ring.get(ring_token(key), Operation::Read)?;
    Ok(set
        .instances
        .first()
        .map(|i| i.addr == instance_addr)
        .unwrap_or(false))
}

/// Decides which tenants and jobs this compactor replica processes.
///
/// Ownership is re-checked just before job execution so topology changes
/// mid-iteration hand work over cleanly.
pub trait ShardingStrategy: Debug + Send + Sync {
    /// Whether this instance compacts `tenant` at all.
    fn own_tenant(&self, tenant: &TenantId) -> Result<bool, RingError>;

    /// Whether this instance executes `job`.
    fn own_job(&self, job: &Job) -> Result<bool, RingError>;
}

/// Sharding disabled: a single compactor owns everything.
#[derive(Debug, Default)]
pub struct NoShardingStrategy;

impl NoShardingStrategy {
    /// Create the strategy.
    pub fn new() -> Self {
        Self
    }
}

impl ShardingStrategy for NoShardingStrategy {
    fn own_tenant(&self, _tenant: &TenantId) -> Result<bool, RingError> {
        Ok(true)
    }

    fn own_job(&self, _job: &Job) -> Result<bool, RingError> {
        Ok(true)
    }
}

/// The default strategy: one instance of the whole ring owns each tenant
/// and runs all of its jobs.
#[derive(Debug)]
pub struct DefaultShardingStrategy {
    ring: Arc<Ring>,
    instance_addr: String,
}

impl DefaultShardingStrategy {
    /// Create the strategy for this instance.
    pub fn new(ring: Arc<Ring>, instance_addr: String) -> Self {
        Self {
            ring,
            instance_addr,
        }
    }
}

impl ShardingStrategy for DefaultShardingStrategy {
    fn own_tenant(&self, tenant: &TenantId) -> Result<bool, RingError> {
        instance_owns_token_in_ring(&self.ring, &self.instance_addr, tenant.as_str())
    }

    fn own_job(&self, job: &Job) -> Result<bool, RingError> {
        self.own_tenant(&job.tenant)
    }
}

/// The split-merge strategy: every instance of the tenant's compactor
/// subring participates; each job goes to the one subring instance owning
/// the token of its sharding key.
#[derive(Debug)]
pub struct SplitMergeShardingStrategy {
    ring: Arc<Ring>,
    instance_addr: String,
    config_provider: Arc<dyn ConfigProvider>,
}

impl SplitMergeShardingStrategy {
    /// Create the strategy for this instance.
    pub fn new(
        ring: Arc<Ring>,
        instance_addr: String,
        config_provider: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            ring,
            instance_addr,
            config_provider,
        }
    }

    fn subring(&self, tenant: &TenantId) -> Ring {
        self.ring.shuffle_shard(
            tenant.as_str(),
            self.config_provider.compactor_tenant_shard_size(tenant),
        )
    }
}

impl ShardingStrategy for SplitMergeShardingStrategy {
    fn own_tenant(&self, tenant: &TenantId) -> Result<bool, RingError> {
        let subring = self.subring(tenant);
        Ok(subring
            .desc()
            .instances
            .values()
            .any(|i| i.addr == self.instance_addr))
    }

    fn own_job(&self, job: &Job) -> Result<bool, RingError> {
        let subring = self.subring(&job.tenant);
        instance_owns_token_in_ring(&subring, &self.instance_addr, &job.sharding_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticConfigProvider;
    use ring::{InstanceDesc, InstanceState, RingConfig, RingDesc};
    use std::time::Duration;
    use stratus_time::{MockProvider, Time};

    fn compactor_ring(instances: usize) -> Arc<Ring> {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let ring = Ring::new(
            RingConfig {
                replication_factor: 1,
                zone_awareness_enabled: false,
                heartbeat_timeout: Duration::ZERO,
            },
            provider as _,
        );
        let mut desc = RingDesc::default();
        for i in 0..instances {
            desc.upsert(InstanceDesc {
                id: format!("compactor-{i}"),
                addr: format!("compactor-{i}:9095"),
                zone: "a".to_owned(),
                state: InstanceState::Active,
                tokens: (0..32)
                    .map(|t| (i as u32).wrapping_mul(97_003).wrapping_add(t * 131_071))
                    .collect(),
                heartbeat_ts: 0,
            });
        }
        ring.reload(desc);
        Arc::new(ring)
    }

    #[test]
    fn test_exactly_one_owner_per_tenant() {
        let ring = compactor_ring(3);
        let tenant = TenantId::new("t1").unwrap();

        let owners: usize = (0..3)
            .filter(|i| {
                DefaultShardingStrategy::new(
                    Arc::clone(&ring),
                    format!("compactor-{i}:9095"),
                )
                .own_tenant(&tenant)
                .unwrap()
            })
            .count();
        assert_eq!(owners, 1);
    }

    #[test]
    fn test_split_merge_exactly_one_job_owner() {
        let ring = compactor_ring(3);
        let provider = Arc::new(StaticConfigProvider::default());
        let tenant = TenantId::new("t1").unwrap();
        let job = crate::Job::new(tenant, "0@123");

        let owners: usize = (0..3)
            .filter(|i| {
                SplitMergeShardingStrategy::new(
                    Arc::clone(&ring),
                    format!("compactor-{i}:9095"),
                    Arc::<StaticConfigProvider>::clone(&provider) as _,
                )
                .own_job(&job)
                .unwrap()
            })
            .count();
        assert_eq!(owners, 1);

        // With shard size 0 every instance participates in the tenant.
        let strategy = SplitMergeShardingStrategy::new(
            Arc::clone(&ring),
            "compactor-0:9095".to_owned(),
            provider as _,
        );
        assert!(strategy.own_tenant(&job_tenant()).unwrap());
    }

    fn job_tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }
}
