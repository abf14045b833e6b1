use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use data_types::Labels;
use parking_lot::Mutex;
use thiserror::Error;

/// Errors from a [`QueryLimiter`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryLimitError {
    /// The query selected too many distinct series.
    #[error("the query exceeded the maximum number of series (limit: {limit})")]
    MaxSeries {
        /// Configured cap.
        limit: usize,
    },

    /// The query fetched too many chunk bytes.
    #[error("the query exceeded the aggregated chunks size limit (limit: {limit} bytes)")]
    MaxChunkBytes {
        /// Configured cap, bytes.
        limit: usize,
    },

    /// The query fetched too many chunks.
    #[error("the query exceeded the maximum number of chunks (limit: {limit})")]
    MaxChunks {
        /// Configured cap.
        limit: usize,
    },
}

/// Guards a single query's resource usage across all ingester and
/// store-gateway responses feeding it.
///
/// One limiter is created per query and shared by every merging branch; a
/// zero limit disables the corresponding check.
#[derive(Debug, Default)]
pub struct QueryLimiter {
    max_series: usize,
    max_chunk_bytes: usize,
    max_chunks: usize,

    unique_series: Mutex<HashSet<u64>>,
    chunk_bytes: AtomicUsize,
    chunks: AtomicUsize,
}

impl QueryLimiter {
    /// Create a limiter with the tenant's per-query caps.
    pub fn new(max_series: usize, max_chunk_bytes: usize, max_chunks: usize) -> Self {
        Self {
            max_series,
            max_chunk_bytes,
            max_chunks,
            ..Default::default()
        }
    }

    /// Track one series; errors when the distinct-series cap is crossed.
    pub fn add_series(&self, labels: &Labels) -> Result<(), QueryLimitError> {
        if self.max_series == 0 {
            return Ok(());
        }
        let mut unique = self.unique_series.lock();
        unique.insert(labels.fingerprint());
        if unique.len() > self.max_series {
            return Err(QueryLimitError::MaxSeries {
                limit: self.max_series,
            });
        }
        Ok(())
    }

    /// Track fetched chunk bytes.
    pub fn add_chunk_bytes(&self, bytes: usize) -> Result<(), QueryLimitError> {
        if self.max_chunk_bytes == 0 {
            return Ok(());
        }
        let total = self.chunk_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if total > self.max_chunk_bytes {
            return Err(QueryLimitError::MaxChunkBytes {
                limit: self.max_chunk_bytes,
            });
        }
        Ok(())
    }

    /// Track fetched chunk count.
    pub fn add_chunks(&self, count: usize) -> Result<(), QueryLimitError> {
        if self.max_chunks == 0 {
            return Ok(());
        }
        let total = self.chunks.fetch_add(count, Ordering::Relaxed) + count;
        if total > self.max_chunks {
            return Err(QueryLimitError::MaxChunks {
                limit: self.max_chunks,
            });
        }
        Ok(())
    }

    /// The number of distinct series tracked so far.
    pub fn series_count(&self) -> usize {
        self.unique_series.lock().len()
    }
}
