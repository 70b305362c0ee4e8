//! Log subscriber setup for hosts that do not install their own.

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Filter expression in effect: `VESSEL_LOG`, then `RUST_LOG`, then `default_level`
pub fn filter_expr(default_level: &str) -> String {
    std::env::var("VESSEL_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .filter(|expr| !expr.trim().is_empty())
        .unwrap_or_else(|| default_level.to_string())
}

/// Install a stderr `fmt` subscriber
///
/// Does nothing if this (or any other) global subscriber is already set, so
/// it is safe to call from every entry point.
pub fn init_logging(default_level: &str) {
    INIT.call_once(|| {
        let expr = filter_expr(default_level);
        let builder = fmt().with_writer(std::io::stderr).with_target(false);
        let builder = match EnvFilter::try_new(&expr) {
            Ok(filter) => builder.with_env_filter(filter),
            Err(_) => builder.with_env_filter(EnvFilter::new("info")),
        };
        let _ = builder.try_init();
    });
}
