//! `tracing` subscriber setup for binaries, benches and tests embedding the engine.

use tracing::{Subscriber, metadata::LevelFilter};
use tracing_subscriber::{
    EnvFilter, Layer, prelude::__tracing_subscriber_SubscriberExt, registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// Panics if a global subscriber is already set.
pub fn init(default_level: LevelFilter) {
    tracing_subscriber::registry()
        .with(stdout_layer(default_level))
        .init();
}

/// Like [`init`], but leaves an existing subscriber in place.
pub fn try_init(default_level: LevelFilter) -> bool {
    tracing_subscriber::registry()
        .with(stdout_layer(default_level))
        .try_init()
        .is_ok()
}

fn stdout_layer<S>(default_level: LevelFilter) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_target(true)
        .and_then(env_filter)
}

#[cfg(test)]
pub fn test_init(default_level: LevelFilter) {
    use std::sync::OnceLock;
    static INITIALIZED: OnceLock<()> = OnceLock::new();

    INITIALIZED.get_or_init(|| {
        try_init(default_level);
    });
}
