//! Shared data types for the stratus multi-tenant TSDB cluster.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod block;
mod error;
mod labels;
mod series;
mod tenant;

pub use block::*;
pub use error::*;
pub use labels::*;
pub use series::*;
pub use tenant::*;
