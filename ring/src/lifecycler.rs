use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::{info, warn};
use stratus_time::TimeProvider;
use tokio_util::sync::CancellationToken;

use crate::{
    generate_tokens, update_typed, InstanceDesc, InstanceState, KvError, KvStore, Ring, RingDesc,
};

/// Configuration of a [`Lifecycler`].
#[derive(Debug, Clone)]
pub struct LifecyclerConfig {
    /// The KV key under which the ring descriptor is stored (one key per
    /// service, e.g. `distributor`, `ingester`, `compactor`).
    pub ring_key: String,
    /// Stable identifier of this instance.
    pub instance_id: String,
    /// Advertised address of this instance.
    pub instance_addr: String,
    /// Availability zone of this instance.
    pub zone: String,
    /// Number of tokens to claim on the circle.
    pub num_tokens: usize,
    /// How often to heartbeat.
    pub heartbeat_period: Duration,
    /// Heartbeats older than this exclude an instance from lookups.
    pub heartbeat_timeout: Duration,
    /// Instances with heartbeats older than
    /// `auto_forget_factor * heartbeat_timeout` are removed from the
    /// descriptor entirely.
    pub auto_forget_factor: u32,
}

impl LifecyclerConfig {
    fn forget_period(&self) -> Duration {
        self.heartbeat_timeout * self.auto_forget_factor
    }
}

/// Registers this instance in the ring and keeps its heartbeat fresh.
///
/// Also acts as the auto-forget delegate: every heartbeat CAS removes
/// instances whose heartbeat has been stale for the forget period.
#[derive(Debug)]
pub struct Lifecycler {
    config: LifecyclerConfig,
    kv: Arc<dyn KvStore>,
    ring: Arc<Ring>,
    time_provider: Arc<dyn TimeProvider>,
}

impl Lifecycler {
    /// Create a lifecycler publishing into `ring`.
    pub fn new(
        config: LifecyclerConfig,
        kv: Arc<dyn KvStore>,
        ring: Arc<Ring>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            kv,
            ring,
            time_provider,
        }
    }

    /// The instance id this lifecycler manages.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// The advertised address of this instance.
    pub fn instance_addr(&self) -> &str {
        &self.config.instance_addr
    }

    /// Register this instance as ACTIVE, claiming tokens.
    ///
    /// Re-registration after a restart reuses the tokens already stored
    /// for this instance id.
    pub async fn register(&self) -> Result<(), KvError> {
        let config = self.config.clone();
        let now = self.time_provider.now().timestamp_millis();

        let desc = update_typed::<RingDesc, _>(&*self.kv, &config.ring_key, |desc| {
            let mut desc = desc.unwrap_or_default();
            let tokens = match desc.instances.get(&config.instance_id) {
                Some(existing) if !existing.tokens.is_empty() => existing.tokens.clone(),
                _ => {
                    let taken: HashSet<u32> = desc
                        .instances
                        .values()
                        .flat_map(|i| i.tokens.iter().copied())
                        .collect();
                    generate_tokens(config.num_tokens, &taken)
                }
            };
            desc.upsert(InstanceDesc {
                id: config.instance_id.clone(),
                addr: config.instance_addr.clone(),
                zone: config.zone.clone(),
                state: InstanceState::Active,
                tokens,
                heartbeat_ts: now,
            });
            Some(desc)
        })
        .await?;

        if let Some(desc) = desc {
            self.ring.reload(desc);
        }
        info!(instance_id = %self.config.instance_id, ring_key = %self.config.ring_key, "instance registered in ring");
        Ok(())
    }

    /// Refresh this instance's heartbeat and forget long-dead peers.
    pub async fn heartbeat(&self) -> Result<(), KvError> {
        let config = self.config.clone();
        let now = self.time_provider.now();

        let desc = update_typed::<RingDesc, _>(&*self.kv, &config.ring_key, |desc| {
            let mut desc = desc.unwrap_or_default();
            if let Some(me) = desc.instances.get_mut(&config.instance_id) {
                me.heartbeat_ts = now.timestamp_millis();
            }
            let removed = desc.forget_unhealthy(config.forget_period(), now);
            for id in &removed {
                warn!(instance_id = %id, ring_key = %config.ring_key, "auto-forgetting instance with stale heartbeat");
            }
            Some(desc)
        })
        .await?;

        if let Some(desc) = desc {
            self.ring.reload(desc);
        }
        Ok(())
    }

    /// Remove this instance from the ring.
    pub async fn deregister(&self) -> Result<(), KvError> {
        let config = self.config.clone();

        let desc = update_typed::<RingDesc, _>(&*self.kv, &config.ring_key, |desc| {
            let mut desc = desc.unwrap_or_default();
            desc.instances.remove(&config.instance_id);
            Some(desc)
        })
        .await?;

        if let Some(desc) = desc {
            self.ring.reload(desc);
        }
        info!(instance_id = %self.config.instance_id, ring_key = %self.config.ring_key, "instance deregistered from ring");
        Ok(())
    }

    /// Register, heartbeat until cancelled, then deregister.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), KvError> {
        self.register().await?;

        let mut ticker = tokio::time::interval(self.config.heartbeat_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(error = %e, "ring heartbeat failed");
                    }
                }
            }
        }

        self.deregister().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryKv, Operation, RingConfig};
    use stratus_time::{MockProvider, Time};

    fn lifecycler(
        id: &str,
        kv: Arc<MemoryKv>,
        provider: Arc<MockProvider>,
    ) -> (Lifecycler, Arc<Ring>) {
        let ring = Arc::new(Ring::new(
            RingConfig {
                replication_factor: 1,
                ..Default::default()
            },
            Arc::<MockProvider>::clone(&provider) as _,
        ));
        let lifecycler = Lifecycler::new(
            LifecyclerConfig {
                ring_key: "collectors/ingester".to_owned(),
                instance_id: id.to_owned(),
                instance_addr: format!("{id}:9095"),
                zone: "a".to_owned(),
                num_tokens: 32,
                heartbeat_period: Duration::from_secs(5),
                heartbeat_timeout: Duration::from_secs(60),
                auto_forget_factor: 4,
            },
            kv,
            Arc::clone(&ring),
            provider as _,
        );
        (lifecycler, ring)
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let kv = Arc::new(MemoryKv::new());
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));

        let (lifecycler, ring) = lifecycler("i1", Arc::clone(&kv), Arc::clone(&provider));
        lifecycler.register().await.unwrap();
        assert_eq!(ring.instance_count(), 1);
        assert_eq!(ring.healthy_instance_count(Operation::Write), 1);

        // Tokens survive re-registration.
        let tokens_before = ring.desc().instances["i1"].tokens.clone();
        lifecycler.register().await.unwrap();
        assert_eq!(ring.desc().instances["i1"].tokens, tokens_before);

        provider.inc(Duration::from_secs(30));
        lifecycler.heartbeat().await.unwrap();
        assert_eq!(ring.desc().instances["i1"].heartbeat_ts, 30_000);
    }

    #[tokio::test]
    async fn test_auto_forget() {
        let kv = Arc::new(MemoryKv::new());
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));

        let (dead, _) = lifecycler("dead", Arc::clone(&kv), Arc::clone(&provider));
        dead.register().await.unwrap();

        let (alive, ring) = lifecycler("alive", Arc::clone(&kv), Arc::clone(&provider));
        alive.register().await.unwrap();
        assert_eq!(ring.instance_count(), 2);

        // Beyond the forget period (4 * 60s) the dead instance goes away
        // on the next heartbeat of any peer.
        provider.inc(Duration::from_secs(241));
        alive.heartbeat().await.unwrap();
        assert_eq!(ring.instance_count(), 1);
        assert!(ring.desc().instances.contains_key("alive"));
    }

    #[tokio::test]
    async fn test_deregister() {
        let kv = Arc::new(MemoryKv::new());
        let provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));

        let (lifecycler, ring) = lifecycler("i1", Arc::clone(&kv), provider);
        lifecycler.register().await.unwrap();
        lifecycler.deregister().await.unwrap();
        assert_eq!(ring.instance_count(), 0);
    }
}
