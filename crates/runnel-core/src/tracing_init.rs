//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when it holds a valid filter; otherwise `default_filter`
/// (e.g. `"runnel_worker=info"`) applies. With `log_json` each event is one
/// JSON line. Everything goes to stderr; stdout carries execution output.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if log_json {
        registry.with(fmt.json()).init();
    } else {
        registry.with(fmt).init();
    }
}
