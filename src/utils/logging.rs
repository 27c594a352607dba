use tracing_subscriber::EnvFilter;

/// Normalizes a configured level name; unknown names fall back to `info`.
pub fn level_name(level: &str) -> &'static str {
    match level.trim().to_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    }
}

/// Initialize tracing for the process.
///
/// `RUST_LOG` wins when it is set, otherwise `default_level` applies to
/// every target. Uses `try_init` so tests and embedders can call this more
/// than once.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_name(default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
