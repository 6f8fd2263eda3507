//! Tracing setup helper.

use tracing_subscriber::EnvFilter;

/// Install a formatted tracing subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; subsequent calls are no-ops. Embedding
/// applications with their own subscriber simply skip this.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
