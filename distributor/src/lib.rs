//! The distributor: entry point of the write path.
//!
//! Each push request flows through a chain of handlers (instance limits →
//! receive metrics → HA dedup → relabel → validation → dispatch), each
//! wrapping the next; the dispatch stage shards the request across the
//! ingester ring and waits for a write quorum. The read-path methods on
//! [`Distributor`] fan matching queries out to ingesters and merge the
//! responses.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod client;
mod config;
mod distributor;
mod error;
mod ha_tracker;
mod handlers;
mod instance_limits;
mod limits;
mod metrics;
mod query;
mod query_limiter;
mod rate_limiter;
mod relabel;
mod shard;
mod validation;

pub use config::*;
pub use distributor::*;
pub use error::*;
pub use ha_tracker::*;
pub use handlers::*;
pub use instance_limits::*;
pub use limits::*;
pub use metrics::*;
pub use query::*;
pub use query_limiter::*;
pub use rate_limiter::*;
pub use relabel::*;
pub use shard::*;
pub use validation::*;
