use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use data_types::DynError;
use metric::U64Counter;
use observability_deps::tracing::debug;
use stratus_time::TimeProvider;
use thiserror::Error;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::{IndexHeaderFactory, IndexHeaderReader};

/// Returned by [`LazyReader::unload_if_idle_since`] when the reader was
/// used again after it was observed as idle.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("the reader is not idle")]
pub struct NotIdleError;

/// Counters shared by all lazy readers of one pool.
#[derive(Debug, Clone)]
pub struct LazyReaderMetrics {
    pub(crate) load_count: U64Counter,
    pub(crate) load_failures: U64Counter,
    pub(crate) unload_count: U64Counter,
}

pub(crate) trait OnReaderClosed: std::fmt::Debug + Send + Sync {
    fn reader_closed(&self, registration_id: u64);
}

/// A lazily loaded index-header reader.
///
/// The first use runs the factory (exactly once, the slot's write lock is
/// the per-entry initializer) and installs the underlying reader; later
/// uses share it and refresh `used_at`. The idle checker unloads the
/// underlying reader but keeps this wrapper alive, so the next use
/// reloads transparently. Unloading takes the write lock, so a close
/// never overlaps an in-flight read.
#[derive(Debug)]
pub struct LazyReader {
    registration_id: u64,
    block_id: Ulid,
    factory: Arc<dyn IndexHeaderFactory>,
    reader: RwLock<Option<Box<dyn IndexHeaderReader>>>,
    used_at_nanos: AtomicI64,
    time_provider: Arc<dyn TimeProvider>,
    metrics: LazyReaderMetrics,
    pool: Weak<dyn OnReaderClosed>,
}

impl LazyReader {
    pub(crate) fn new(
        registration_id: u64,
        block_id: Ulid,
        factory: Arc<dyn IndexHeaderFactory>,
        time_provider: Arc<dyn TimeProvider>,
        metrics: LazyReaderMetrics,
        pool: Weak<dyn OnReaderClosed>,
    ) -> Self {
        let now = time_provider.now().timestamp_nanos();
        Self {
            registration_id,
            block_id,
            factory,
            reader: RwLock::new(None),
            used_at_nanos: AtomicI64::new(now),
            time_provider,
            metrics,
            pool,
        }
    }

    /// The block this reader serves.
    pub fn block_id(&self) -> Ulid {
        self.block_id
    }

    /// Unix nanoseconds of the last use.
    pub fn used_at_nanos(&self) -> i64 {
        self.used_at_nanos.load(Ordering::Relaxed)
    }

    /// Whether the reader has been idle since `ts_nanos` with its
    /// underlying reader loaded.
    pub fn is_idle_since(&self, ts_nanos: i64) -> bool {
        if self.used_at_nanos() > ts_nanos {
            return false;
        }
        // A locked slot means a use is in flight, which is not idle.
        match self.reader.try_read() {
            Ok(slot) => slot.is_some(),
            Err(_) => false,
        }
    }

    /// The last-used time in unix milliseconds, if the underlying reader
    /// is currently loaded (or busy loading).
    pub fn loaded_used_at_millis(&self) -> Option<i64> {
        let millis = self.used_at_nanos() / 1_000_000;
        match self.reader.try_read() {
            Ok(slot) => slot.is_some().then_some(millis),
            // Busy readers are by definition in use.
            Err(_) => Some(millis),
        }
    }

    fn touch(&self) {
        self.used_at_nanos.store(
            self.time_provider.now().timestamp_nanos(),
            Ordering::Relaxed,
        );
    }

    async fn with_reader<R>(
        &self,
        f: impl FnOnce(&dyn IndexHeaderReader) -> R,
    ) -> Result<R, DynError> {
        self.touch();

        {
            let slot = self.reader.read().await;
            if let Some(reader) = slot.as_deref() {
                return Ok(f(reader));
            }
        }

        let mut slot = self.reader.write().await;
        if slot.is_none() {
            match self.factory.build(self.block_id).await {
                Ok(reader) => {
                    self.metrics.load_count.inc(1);
                    debug!(block = %self.block_id, "lazy loaded index header");
                    *slot = Some(reader);
                }
                Err(e) => {
                    self.metrics.load_failures.inc(1);
                    return Err(e);
                }
            }
        }
        self.touch();

        match slot.as_deref() {
            Some(reader) => Ok(f(reader)),
            None => Err("lazy reader failed to initialise".into()),
        }
    }

    /// The version of the block index this header was built from.
    pub async fn index_version(&self) -> Result<u32, DynError> {
        self.with_reader(|r| r.index_version()).await
    }

    /// The symbol stored at `offset`.
    pub async fn lookup_symbol(&self, offset: u32) -> Result<Option<String>, DynError> {
        self.with_reader(|r| r.lookup_symbol(offset).map(str::to_owned))
            .await
    }

    /// All values of `name` in this block.
    pub async fn label_values(&self, name: &str) -> Result<Vec<String>, DynError> {
        self.with_reader(|r| r.label_values(name)).await
    }

    /// All label names in this block.
    pub async fn label_names(&self) -> Result<Vec<String>, DynError> {
        self.with_reader(|r| r.label_names()).await
    }

    /// Whether the underlying reader is currently loaded.
    pub async fn is_loaded(&self) -> bool {
        self.reader.read().await.is_some()
    }

    /// Unload the underlying reader if it has not been used after
    /// `ts_nanos`.
    ///
    /// The check is repeated under the slot's write lock, so a use racing
    /// with the idle checker wins and the unload aborts with
    /// [`NotIdleError`].
    pub async fn unload_if_idle_since(&self, ts_nanos: i64) -> Result<(), NotIdleError> {
        let mut slot = self.reader.write().await;
        if self.used_at_nanos() > ts_nanos {
            return Err(NotIdleError);
        }
        if slot.take().is_some() {
            self.metrics.unload_count.inc(1);
            debug!(block = %self.block_id, "unloaded idle index header");
        }
        Ok(())
    }

    /// Close the reader for good: unload unconditionally and deregister
    /// from the pool. The entry must not be used afterwards.
    pub async fn close(&self) {
        {
            let mut slot = self.reader.write().await;
            if slot.take().is_some() {
                self.metrics.unload_count.inc(1);
            }
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.reader_closed(self.registration_id);
        }
    }
}
