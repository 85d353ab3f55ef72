//! Tracing subscriber setup for the binaries.

use std::io;

use tracing_subscriber::EnvFilter;

/// Installs a stderr subscriber. `RUST_LOG` wins; otherwise `verbose`
/// selects `debug` over `info`. Returns `false` if a subscriber was already set.
pub fn init(verbose: bool) -> bool {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
