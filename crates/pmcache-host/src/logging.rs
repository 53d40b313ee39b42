//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the engine's
//! `verbose` setting.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive for a `verbose` level
pub fn level_for(verbose: usize) -> &'static str {
    match verbose {
        0 => "warn,pmcache_core=info,pmcache_host=info",
        1 => "info,pmcache_core=debug,pmcache_host=debug",
        _ => "debug,pmcache_core=trace,pmcache_host=trace",
    }
}

/// Install the global subscriber.
///
/// Returns false if one was already installed (by an earlier call or by
/// the embedding host); the existing subscriber is left in place.
pub fn init(verbose: usize) -> bool {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level_for(verbose))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init()
        .is_ok()
}
