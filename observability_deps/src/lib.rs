//! This crate exists to coordinate versions of observability dependencies
//! (e.g. `tracing`) across the workspace.
//!
//! Add methods to the re-exported crates only via their public interfaces;
//! this crate deliberately contains no logic of its own.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
