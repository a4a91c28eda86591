use tracing_subscriber::EnvFilter;

/// Level used when the configured one does not parse.
const FALLBACK_LEVEL: &str = "info";

/// Build the log filter: `RUST_LOG` wins when set, otherwise the configured
/// `[logging] level` (e.g. `debug` or `railsub=trace,sled=warn`).
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(level).unwrap_or_else(|e| {
            eprintln!("invalid log level {level:?} ({e}), using {FALLBACK_LEVEL}");
            EnvFilter::new(FALLBACK_LEVEL)
        })
    })
}

/// Install the global fmt subscriber. Later calls are ignored, so tests may
/// call this freely.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_for(level))
        .with_target(false)
        .try_init();
}
