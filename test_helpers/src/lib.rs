//! Utilities shared by tests across the workspace.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self)]

use std::sync::Once;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the `RUST_LOG` environment variable is set.
///
/// Safe to call from every test; the subscriber is installed once.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Enables debug logging regardless of the environment.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    })
}

/// Return a temporary directory that is deleted on drop.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    let _ = std::fs::create_dir_all(std::env::temp_dir());
    tempfile::Builder::new()
        .prefix("stratus")
        .tempdir()
}
