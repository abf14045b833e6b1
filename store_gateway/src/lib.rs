//! The store-gateway's index-header reader pool.
//!
//! Opening a block's index header is expensive, so headers load lazily on
//! first use and idle ones are evicted to bound memory. The set of warm
//! block IDs is persisted periodically so a restarting process can
//! prewarm the same working set.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod index_header;
mod lazy_reader;
mod persist;
mod reader_pool;

pub use index_header::*;
pub use lazy_reader::*;
pub use persist::*;
pub use reader_pool::*;
