use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use data_types::{DynError, TenantId};
use metric::Registry;
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use stratus_time::TimeProvider;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::lazy_reader::OnReaderClosed;
use crate::{
    persist_lazy_loaded_state, IndexHeaderFactory, LazyLoadedState, LazyReader,
    LazyReaderMetrics, NotIdleError,
};

/// Configuration of a [`ReaderPool`].
#[derive(Debug, Clone)]
pub struct ReaderPoolConfig {
    /// The tenant the pool serves.
    pub tenant: TenantId,
    /// Whether index headers load lazily and get idle-evicted at all.
    pub lazy_reader_enabled: bool,
    /// Headers unused for this long are unloaded; zero disables the
    /// checker.
    pub lazy_reader_idle_timeout: Duration,
    /// How often the warm set is persisted.
    pub snapshot_interval: Duration,
    /// Where the warm set is persisted.
    pub snapshot_path: PathBuf,
}

#[derive(Debug)]
struct PoolShared {
    config: ReaderPoolConfig,
    readers: Mutex<HashMap<u64, Arc<LazyReader>>>,
    next_id: AtomicU64,
    time_provider: Arc<dyn TimeProvider>,
    metrics: LazyReaderMetrics,
}

impl OnReaderClosed for PoolShared {
    fn reader_closed(&self, registration_id: u64) {
        // A reader closed by its consumer can't be used anymore, so it
        // leaves the pool entirely.
        self.readers.lock().remove(&registration_id);
    }
}

/// Instantiates lazy index-header readers and keeps track of them.
///
/// One background task drives two tickers: an idle check every tenth of
/// the idle timeout, and a snapshot of the warm set once per
/// `snapshot_interval`. Both stop within one tick of [`ReaderPool::close`].
#[derive(Debug)]
pub struct ReaderPool {
    shared: Arc<PoolShared>,
    shutdown: CancellationToken,
}

impl ReaderPool {
    /// Create the pool and start its background task if lazy loading is
    /// enabled.
    pub fn new(
        config: ReaderPoolConfig,
        time_provider: Arc<dyn TimeProvider>,
        registry: &Registry,
    ) -> Self {
        let metrics = LazyReaderMetrics {
            load_count: registry
                .register_metric::<metric::U64Counter>(
                    "indexheader_lazy_load_total",
                    "index headers lazy loaded",
                )
                .recorder([("tenant", config.tenant.to_string())]),
            load_failures: registry
                .register_metric::<metric::U64Counter>(
                    "indexheader_lazy_load_failed_total",
                    "index header lazy loads that failed",
                )
                .recorder([("tenant", config.tenant.to_string())]),
            unload_count: registry
                .register_metric::<metric::U64Counter>(
                    "indexheader_lazy_unload_total",
                    "index headers unloaded",
                )
                .recorder([("tenant", config.tenant.to_string())]),
        };

        let shared = Arc::new(PoolShared {
            config: config.clone(),
            readers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            time_provider,
            metrics,
        });
        let shutdown = CancellationToken::new();

        if config.lazy_reader_enabled && !config.lazy_reader_idle_timeout.is_zero() {
            Self::spawn_background(Arc::clone(&shared), shutdown.clone());
        }

        Self { shared, shutdown }
    }

    fn spawn_background(shared: Arc<PoolShared>, shutdown: CancellationToken) {
        let check_period = (shared.config.lazy_reader_idle_timeout / 10).max(Duration::from_millis(1));
        let snapshot_period = shared.config.snapshot_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut idle_ticker = tokio::time::interval(check_period);
            idle_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut snapshot_ticker = tokio::time::interval(snapshot_period);
            snapshot_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip
            // the snapshot one so an empty pool isn't persisted at boot.
            snapshot_ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = idle_ticker.tick() => Self::close_idle(&shared).await,
                    _ = snapshot_ticker.tick() => {
                        if let Err(e) = Self::snapshot(&shared).await {
                            warn!(error = %e, "failed to persist list of lazy-loaded index headers");
                        }
                    }
                }
            }
        });
    }

    /// Create (and track) a lazy reader for `block_id`.
    ///
    /// The reader stays in the pool until its consumer calls
    /// [`LazyReader::close`].
    pub fn lazy_reader(
        &self,
        block_id: Ulid,
        factory: Arc<dyn IndexHeaderFactory>,
    ) -> Arc<LazyReader> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let on_closed: Arc<dyn OnReaderClosed> = Arc::clone(&self.shared) as _;
        let reader = Arc::new(LazyReader::new(
            id,
            block_id,
            factory,
            Arc::clone(&self.shared.time_provider),
            self.shared.metrics.clone(),
            Arc::downgrade(&on_closed),
        ));

        if self.shared.config.lazy_reader_enabled
            && !self.shared.config.lazy_reader_idle_timeout.is_zero()
        {
            self.shared
                .readers
                .lock()
                .insert(id, Arc::clone(&reader));
        }
        reader
    }

    /// Unload every reader idle for longer than the idle timeout.
    ///
    /// Also driven by the background ticker; exposed so tests and
    /// operators can force a pass.
    pub async fn close_idle_readers(&self) {
        Self::close_idle(&self.shared).await
    }

    async fn close_idle(shared: &PoolShared) {
        let cutoff = shared.time_provider.now().timestamp_nanos()
            - shared.config.lazy_reader_idle_timeout.as_nanos() as i64;

        let idle: Vec<Arc<LazyReader>> = {
            let readers = shared.readers.lock();
            readers
                .values()
                .filter(|r| r.is_idle_since(cutoff))
                .map(Arc::clone)
                .collect()
        };

        for reader in idle {
            match reader.unload_if_idle_since(cutoff).await {
                Ok(()) => {}
                // The reader was used between the scan and the unload;
                // leaving it loaded is exactly right.
                Err(NotIdleError) => {
                    debug!(block = %reader.block_id(), "reader became busy again, skipping unload");
                }
            }
        }
    }

    /// The warm set: loaded block IDs with their last-used time in unix
    /// milliseconds.
    pub fn loaded_blocks(&self) -> BTreeMap<String, i64> {
        let readers = self.shared.readers.lock();
        readers
            .values()
            .filter_map(|r| {
                r.loaded_used_at_millis()
                    .map(|used_at| (r.block_id().to_string(), used_at))
            })
            .collect()
    }

    /// Number of readers currently tracked.
    pub fn tracked_readers(&self) -> usize {
        self.shared.readers.lock().len()
    }

    /// Persist the warm set immediately.
    pub async fn snapshot_now(&self) -> Result<(), DynError> {
        Self::snapshot(&self.shared).await
    }

    async fn snapshot(shared: &PoolShared) -> Result<(), DynError> {
        // Copy under the lock, serialize and fsync outside of it.
        let state = {
            let readers = shared.readers.lock();
            LazyLoadedState {
                tenant: shared.config.tenant.to_string(),
                blocks: readers
                    .values()
                    .filter_map(|r| {
                        r.loaded_used_at_millis()
                            .map(|used_at| (r.block_id().to_string(), used_at))
                    })
                    .collect(),
            }
        };

        let path = shared.config.snapshot_path.clone();
        tokio::task::spawn_blocking(move || persist_lazy_loaded_state(&state, &path))
            .await
            .map_err(|e| DynError::from(e.to_string()))?
    }

    /// Stop the background tickers. Tracked readers are not closed; that
    /// stays the consumers' responsibility.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
