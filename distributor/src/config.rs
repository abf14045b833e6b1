use std::time::Duration;

use crate::{HaTrackerConfig, InstanceLimits};

/// The bound on each per-ingester RPC of a push fan-out.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of a [`Distributor`](crate::Distributor).
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Instance-wide protection limits.
    pub instance_limits: InstanceLimits,
    /// Per-ingester RPC timeout of the push fan-out.
    pub rpc_timeout: Duration,
    /// Whether read fan-outs contact only the minimal instance set needed
    /// for a quorum upfront.
    pub minimize_ingester_requests: bool,
    /// HA tracker timings.
    pub ha_tracker: HaTrackerConfig,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            instance_limits: InstanceLimits::default(),
            rpc_timeout: RPC_TIMEOUT,
            minimize_ingester_requests: false,
            ha_tracker: HaTrackerConfig::default(),
        }
    }
}
