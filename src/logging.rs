//! Log setup for binaries built on this crate. The level comes from the `LOGLEVEL` environment variable.
use tracing::Level;

pub const LOGLEVEL_VAR: &str = "LOGLEVEL";

/// Parse a `LOGLEVEL` value. Unknown values fall back to info.
pub fn parse_level(level: Option<&str>) -> Level {
    match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("trace") => Level::TRACE,
        Some("debug") => Level::DEBUG,
        Some("warning" | "warn") => Level::WARN,
        Some("error") => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a fmt subscriber. Does nothing if one is already installed.
pub fn init() {
    let level = parse_level(std::env::var(LOGLEVEL_VAR).ok().as_deref());
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .try_init();
}
