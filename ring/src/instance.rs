use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratus_time::Time;

/// The lifecycle state of a ring member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum InstanceState {
    Pending,
    Joining,
    Active,
    Leaving,
    Left,
}

/// One registered ring member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDesc {
    /// Stable instance identifier (the map key, duplicated for
    /// convenience when instances travel in replication sets).
    pub id: String,
    /// Network address of the instance.
    pub addr: String,
    /// Availability zone the instance runs in.
    pub zone: String,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// The 32-bit tokens this instance owns on the circle.
    pub tokens: Vec<u32>,
    /// Unix milliseconds of the last heartbeat.
    pub heartbeat_ts: i64,
}

impl InstanceDesc {
    /// Whether the heartbeat is fresh enough at `now`.
    ///
    /// A zero `heartbeat_timeout` disables the check.
    pub fn is_heartbeat_fresh(&self, heartbeat_timeout: Duration, now: Time) -> bool {
        if heartbeat_timeout.is_zero() {
            return true;
        }
        now.timestamp_millis() - self.heartbeat_ts <= heartbeat_timeout.as_millis() as i64
    }
}

/// The replicated ring descriptor: every registered instance, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingDesc {
    /// All registered instances.
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    /// Insert or replace an instance.
    pub fn upsert(&mut self, instance: InstanceDesc) {
        self.instances.insert(instance.id.clone(), instance);
    }

    /// All distinct zones with at least one instance.
    pub fn zones(&self) -> BTreeSet<&str> {
        self.instances.values().map(|i| i.zone.as_str()).collect()
    }

    /// The sorted (token, instance id) table used for lookups.
    pub fn token_table(&self) -> Vec<(u32, String)> {
        let mut tokens: Vec<_> = self
            .instances
            .values()
            .flat_map(|i| i.tokens.iter().map(|t| (*t, i.id.clone())))
            .collect();
        tokens.sort_unstable_by_key(|(t, _)| *t);
        tokens
    }

    /// Remove instances whose heartbeat is older than `forget_period`,
    /// returning the removed ids.
    ///
    /// This is the auto-forget delegate: it runs piggybacked on every
    /// heartbeat CAS so a crashed instance eventually disappears without
    /// operator action.
    pub fn forget_unhealthy(&mut self, forget_period: Duration, now: Time) -> Vec<String> {
        let cutoff = now.timestamp_millis() - forget_period.as_millis() as i64;
        let stale: Vec<String> = self
            .instances
            .values()
            .filter(|i| i.heartbeat_ts < cutoff)
            .map(|i| i.id.clone())
            .collect();
        for id in &stale {
            self.instances.remove(id);
        }
        stale
    }
}
