use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Default filter: info+ from infinivirt crates, warnings from everything
/// else. `RUST_LOG` overrides.
const DEFAULT_FILTER: &str = "infinivirt=info,infinivirt_core=info,infinivirt_host=info,infinivirt_runtime=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable output for interactive CLI use.
    Human,
    /// Structured JSON output for daemon mode.
    Json,
}

/// Initialize the global tracing subscriber. Call once at program startup.
pub fn init(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Human => registry
            .with(fmt::layer().compact().with_target(false))
            .init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
    }
}
