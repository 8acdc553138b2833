//! Diagnostic tracing to stderr.
//!
//! Terminal output of a run is rendered by [`crate::ui`] from the event
//! stream; this module only covers diagnostics such as swallowed store
//! failures and dropped events.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "PAIRLOOP_LOG";

/// Filter directive: `PAIRLOOP_LOG`, then `RUST_LOG`, then `warn` (or
/// `pairloop=debug` with `--verbose`).
pub fn filter_directive(verbose: bool, lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup(LOG_ENV)
        .or_else(|| lookup("RUST_LOG"))
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| {
            if verbose {
                "warn,pairloop=debug".to_string()
            } else {
                "warn".to_string()
            }
        })
}

/// Install the global subscriber. Call once from `main`.
pub fn init(verbose: bool) {
    let directive = filter_directive(verbose, |key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

    // Ignore the error if a subscriber is already installed (tests).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
