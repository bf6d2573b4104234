//! Logger installation for hosts that do not bring their own
//!
//! Android builds log to logcat under [`LOG_TAG`]; everything else logs to
//! stderr through `env_logger`.

use log::LevelFilter;

use crate::error::{BridgeError, Result};

/// logcat tag for bridge output
pub const LOG_TAG: &str = "clash_core";

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .parse()
        .map_err(|_| BridgeError::Configuration(format!("Unknown log level: {level}")))
}

/// Install an `env_logger` at `level`. `RUST_LOG` still overrides it.
///
/// Returns `Ok(false)` when a logger was already installed.
pub fn init(level: &str) -> Result<bool> {
    let filter = parse_level(level)?;

    let installed = env_logger::Builder::new()
        .filter_level(filter)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init()
        .is_ok();
    Ok(installed)
}

/// Install the platform logger: logcat on Android, stderr elsewhere.
#[cfg(target_os = "android")]
pub fn init_platform(level: &str) -> Result<bool> {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INSTALLED: AtomicBool = AtomicBool::new(false);

    let filter = parse_level(level)?;
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(filter)
            .with_tag(LOG_TAG),
    );
    Ok(!INSTALLED.swap(true, Ordering::SeqCst))
}

/// Install the platform logger: logcat on Android, stderr elsewhere.
#[cfg(not(target_os = "android"))]
pub fn init_platform(level: &str) -> Result<bool> {
    init(level)
}
