//! Diagnostics go to stderr through a tracing subscriber. Filter from PEERLINK_LOG, then RUST_LOG,
//! else `info`.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber. Later calls, or an embedder that already installed one, are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env("PEERLINK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
