//! Tracing subscriber setup. Logs go to stderr so stdout carries only the report.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,rostersync=debug";
const VERBOSE_FILTER: &str = "debug";

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        VERBOSE_FILTER
    } else {
        DEFAULT_FILTER
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
