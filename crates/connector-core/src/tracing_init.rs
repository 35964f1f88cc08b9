//! Logging setup for the connector binaries.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter enabling `level` for the connector crates only.
pub fn default_filter(level: &str) -> String {
    format!("connector_daemon={level},connector_core={level}")
}

/// Install the global subscriber, writing to stderr.
///
/// `default_filter` applies when `RUST_LOG` is unset. With `log_json` each
/// record is one JSON object per line.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(filter);
    if log_json {
        registry.with(fmt.json()).init();
    } else {
        registry.with(fmt).init();
    }
}
