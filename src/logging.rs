//! Tracing subscriber for the binary.
//!
//! The library crates log through `log`; the subscriber's `tracing-log` bridge
//! picks those records up. Output goes to stderr so stdout stays clean for
//! results.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(level: &str, verbose: bool) -> String {
    if verbose {
        return "debug".to_string();
    }
    match level.trim().to_ascii_lowercase().as_str() {
        "" => "info".to_string(),
        level @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => level.to_string(),
        // Anything else is taken as a full directive, e.g. "awskit_core=debug,info".
        _ => level.trim().to_string(),
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`
/// and `verbose`. Fails if a subscriber is already installed.
pub fn init(level: &str, verbose: bool, json: bool) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(ref value) if !value.trim().is_empty() => EnvFilter::try_from_default_env()?,
        _ => EnvFilter::try_new(default_directive(level, verbose))?,
    };

    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()?;
    Ok(())
}
