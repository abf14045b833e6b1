//! The compactor: a long-running background worker that discovers
//! immutable blocks in the object store, groups and plans compactions,
//! runs merges (optionally splitting into shards), garbage-collects
//! superseded blocks, and shards work across replicas via a ring.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod bucket;
mod config;
#[cfg(test)]
pub(crate) mod test_util;
mod fetcher;
mod filters;
mod grouper;
mod job;
mod metrics;
mod multitenant;
mod planner;
mod runner;
mod sharding;
mod syncer;

pub use bucket::*;
pub use config::*;
pub use fetcher::*;
pub use filters::*;
pub use grouper::*;
pub use job::*;
pub use metrics::*;
pub use multitenant::*;
pub use planner::*;
pub use runner::*;
pub use sharding::*;
pub use syncer::*;
