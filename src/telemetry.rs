use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Applied when `RUST_LOG` is unset or unparsable
const DEFAULT_FILTER: &str = "info";

/// JSON logs to stderr, filtered by `RUST_LOG` (default `info`). Stdout is
/// reserved for the cycle report.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

fn default_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}
