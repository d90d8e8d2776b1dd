use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "companion=info,chat_companion=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .try_init();
}
