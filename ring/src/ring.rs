use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use stratus_time::TimeProvider;
use thiserror::Error;

use crate::{search_token, InstanceDesc, InstanceState, KvError, KvStore, RingDesc};

/// Errors resolving keys against the ring.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The ring has no instances at all.
    #[error("the ring is empty")]
    Empty,

    /// Too few acceptable instances to satisfy the operation's quorum.
    #[error("not enough healthy replicas: needed at least {needed}, found {found}")]
    NotEnoughReplicas {
        /// Minimum acceptable instances for the operation.
        needed: usize,
        /// Acceptable instances actually found.
        found: usize,
    },
}

/// The kind of access a ring lookup is performed for; determines which
/// instance states are acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Writing new data: only ACTIVE instances accept writes.
    Write,
    /// Reading data: instances draining away still serve reads.
    Read,
}

impl Operation {
    fn accepts(&self, state: InstanceState) -> bool {
        match self {
            Self::Write => matches!(state, InstanceState::Active),
            Self::Read => matches!(state, InstanceState::Active | InstanceState::Leaving),
        }
    }
}

/// The ordered set of instances chosen for one key or one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSet {
    /// The chosen instances, in ring walk order.
    pub instances: Vec<InstanceDesc>,
    /// Instance-level error budget (zone-unaware rings).
    pub max_errors: usize,
    /// Zone-level error budget (zone-aware rings).
    pub max_unavailable_zones: usize,
}

impl ReplicationSet {
    /// The maximum number of instances that may fail while the operation
    /// still succeeds.
    pub fn max_failures(&self) -> usize {
        if self.max_unavailable_zones == 0 {
            return self.max_errors;
        }

        // With zone awareness the budget is whole zones; losing the
        // largest allowed zones is the worst case.
        let mut zone_sizes: Vec<usize> = self
            .zones()
            .into_iter()
            .map(|zone| {
                self.instances
                    .iter()
                    .filter(|i| i.zone == zone)
                    .count()
            })
            .collect();
        zone_sizes.sort_unstable_by(|a, b| b.cmp(a));
        zone_sizes
            .into_iter()
            .take(self.max_unavailable_zones)
            .sum()
    }

    /// The number of successful responses required.
    pub fn min_success(&self) -> usize {
        self.instances.len().saturating_sub(self.max_failures())
    }

    /// The distinct zones present in the set.
    pub fn zones(&self) -> BTreeSet<String> {
        self.instances.iter().map(|i| i.zone.clone()).collect()
    }
}

/// Configuration of a [`Ring`] view.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// How many instances each key is replicated to.
    pub replication_factor: usize,
    /// Whether replicas must be spread across distinct zones.
    pub zone_awareness_enabled: bool,
    /// Heartbeats older than this exclude an instance from lookups;
    /// zero disables the check.
    pub heartbeat_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            zone_awareness_enabled: false,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct RingState {
    desc: RingDesc,
    tokens: Vec<(u32, String)>,
}

/// A read-mostly view over the replicated [`RingDesc`].
///
/// Writers (the lifecycler, the auto-forget delegate) publish new
/// descriptors via [`Ring::reload`]; readers operate on a snapshot.
#[derive(Debug)]
pub struct Ring {
    config: RingConfig,
    time_provider: Arc<dyn TimeProvider>,
    state: RwLock<Arc<RingState>>,
}

impl Ring {
    /// Create an empty ring view.
    pub fn new(config: RingConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            config,
            time_provider,
            state: RwLock::new(Arc::new(RingState {
                desc: RingDesc::default(),
                tokens: vec![],
            })),
        }
    }

    /// The configuration of this view.
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Publish a new descriptor snapshot.
    pub fn reload(&self, desc: RingDesc) {
        let tokens = desc.token_table();
        *self.state.write() = Arc::new(RingState { desc, tokens });
    }

    /// Read the descriptor from `kv` under `key` and publish it.
    pub async fn load_from(&self, kv: &dyn KvStore, key: &str) -> Result<(), KvError> {
        let desc: RingDesc = crate::get_typed(kv, key).await?.unwrap_or_default();
        self.reload(desc);
        Ok(())
    }

    /// A snapshot of the current descriptor.
    pub fn desc(&self) -> RingDesc {
        self.state.read().desc.clone()
    }

    /// Total number of registered instances.
    pub fn instance_count(&self) -> usize {
        self.state.read().desc.instances.len()
    }

    /// Number of instances acceptable for `op` right now.
    pub fn healthy_instance_count(&self, op: Operation) -> usize {
        let state = self.state.read();
        let now = self.time_provider.now();
        state
            .desc
            .instances
            .values()
            .filter(|i| {
                op.accepts(i.state) && i.is_heartbeat_fresh(self.config.heartbeat_timeout, now)
            })
            .count()
    }

    fn error_budget(&self, zones: usize) -> (usize, usize) {
        if self.config.zone_awareness_enabled && zones > 1 {
            (0, (self.config.replication_factor - 1) / 2)
        } else {
            ((self.config.replication_factor - 1) / 2, 0)
        }
    }

    /// Resolve `key` to the next `replication_factor` acceptable
    /// instances on the circle (distinct zones when zone awareness is
    /// enabled).
    pub fn get(&self, key: u32, op: Operation) -> Result<ReplicationSet, RingError> {
        let state = Arc::clone(&self.state.read());
        if state.tokens.is_empty() {
            return Err(RingError::Empty);
        }

        let now = self.time_provider.now();
        let zones = state.desc.zones().len();
        let distinct_zones = self.config.zone_awareness_enabled && zones > 1;

        let mut selected: Vec<&InstanceDesc> = vec![];
        let mut seen_instances: BTreeSet<&str> = BTreeSet::new();
        let mut seen_zones: BTreeSet<&str> = BTreeSet::new();

        let start = search_token(&state.tokens, key);
        for offset in 0..state.tokens.len() {
            let (_, instance_id) = &state.tokens[(start + offset) % state.tokens.len()];
            if !seen_instances.insert(instance_id.as_str()) {
                continue;
            }
            let instance = &state.desc.instances[instance_id.as_str()];
            if distinct_zones && !seen_zones.insert(&instance.zone) {
                continue;
            }
            if !op.accepts(instance.state)
                || !instance.is_heartbeat_fresh(self.config.heartbeat_timeout, now)
            {
                // Unacceptable instance: its slot is taken over by the
                // next distinct candidate on the walk.
                if distinct_zones {
                    seen_zones.remove(instance.zone.as_str());
                }
                continue;
            }

            selected.push(instance);
            if selected.len() == self.config.replication_factor {
                break;
            }
        }

        let (max_errors, max_unavailable_zones) = self.error_budget(zones);
        let needed = self.config.replication_factor - max_errors.max(max_unavailable_zones);
        if selected.len() < needed {
            return Err(RingError::NotEnoughReplicas {
                needed,
                found: selected.len(),
            });
        }

        Ok(ReplicationSet {
            instances: selected.into_iter().cloned().collect(),
            max_errors,
            max_unavailable_zones,
        })
    }

    /// All instances acceptable for `op`, with the matching error budget;
    /// the read-path entry point for whole-(sub)ring operations.
    pub fn replication_set_for_operation(
        &self,
        op: Operation,
    ) -> Result<ReplicationSet, RingError> {
        let state = Arc::clone(&self.state.read());
        if state.desc.instances.is_empty() {
            return Err(RingError::Empty);
        }

        let now = self.time_provider.now();
        let healthy: Vec<InstanceDesc> = state
            .desc
            .instances
            .values()
            .filter(|i| {
                op.accepts(i.state) && i.is_heartbeat_fresh(self.config.heartbeat_timeout, now)
            })
            .cloned()
            .collect();

        if healthy.is_empty() {
            return Err(RingError::NotEnoughReplicas {
                needed: 1,
                found: 0,
            });
        }

        let healthy_zones: BTreeSet<&str> = healthy.iter().map(|i| i.zone.as_str()).collect();
        let (max_errors, max_unavailable_zones) = self.error_budget(healthy_zones.len());

        Ok(ReplicationSet {
            instances: healthy,
            max_errors,
            max_unavailable_zones,
        })
    }

    pub(crate) fn with_state(&self, desc: RingDesc) -> Self {
        let ring = Self::new(self.config.clone(), Arc::clone(&self.time_provider));
        ring.reload(desc);
        ring
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use stratus_time::{MockProvider, Time};

    pub(crate) fn active_instance(id: &str, zone: &str, tokens: Vec<u32>) -> InstanceDesc {
        InstanceDesc {
            id: id.to_owned(),
            addr: format!("{id}:9095"),
            zone: zone.to_owned(),
            state: InstanceState::Active,
            tokens,
            heartbeat_ts: 0,
        }
    }

    pub(crate) fn ring_with(
        config: RingConfig,
        instances: impl IntoIterator<Item = InstanceDesc>,
    ) -> Ring {
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let ring = Ring::new(config, provider);
        let mut desc = RingDesc::default();
        for i in instances {
            desc.upsert(i);
        }
        ring.reload(desc);
        ring
    }
}
