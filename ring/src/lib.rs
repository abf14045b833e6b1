//! Consistent-hash ring membership for the stratus cluster.
//!
//! Instances register themselves (with a set of random 32-bit tokens) in a
//! shared key-value store and heartbeat periodically; readers take
//! snapshots of the ring and resolve keys to [`ReplicationSet`]s. Writes
//! fan out through [`do_batch`], reads through [`do_until_quorum`].
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod batch;
mod instance;
mod kv;
mod lifecycler;
mod quorum;
mod ring;
mod shuffle_shard;
mod tokens;

pub use batch::*;
pub use instance::*;
pub use kv::*;
pub use lifecycler::*;
pub use quorum::*;
pub use ring::*;
pub use shuffle_shard::*;
pub use tokens::*;
