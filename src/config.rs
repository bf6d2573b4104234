//! Configuration module for the core bridge
//!
//! This module provides TOML-based configuration parsing and validation.
//! Every section has defaults, so an empty document is a valid configuration.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Core library location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Library file name
    pub library: String,
    /// Directory holding the library (the app's native library dir on Android)
    pub library_dir: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            library: default_library(),
            library_dir: None,
        }
    }
}

/// Managed classes and methods the callbacks dispatch to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JniConfig {
    /// Class declaring the socket-protect method
    pub vpn_service_class: String,
    pub protect_method: String,
    pub protect_signature: String,
    /// Class declaring the result-delivery method
    pub result_callback_class: String,
    pub result_method: String,
    pub result_signature: String,
}

impl Default for JniConfig {
    fn default() -> Self {
        Self {
            vpn_service_class: "android/net/VpnService".to_string(),
            protect_method: "protect".to_string(),
            protect_signature: "(I)Z".to_string(),
            result_callback_class:
                "io/github/stelliberty/android/clash_core/ClashCoreResultCallback".to_string(),
            result_method: "onResult".to_string(),
            result_signature: "(Ljava/lang/String;)V".to_string(),
        }
    }
}

/// Synchronous invoke settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeConfig {
    /// Time to wait for an action result, in milliseconds
    pub timeout_ms: u64,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub core: CoreConfig,
    pub jni: JniConfig,
    pub invoke: InvokeConfig,
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Configuration(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.core.library.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "Core library name cannot be empty".to_string(),
            ));
        }

        let jni = &self.jni;
        for (name, value) in [
            ("vpn_service_class", &jni.vpn_service_class),
            ("protect_method", &jni.protect_method),
            ("protect_signature", &jni.protect_signature),
            ("result_callback_class", &jni.result_callback_class),
            ("result_method", &jni.result_method),
            ("result_signature", &jni.result_signature),
        ] {
            if value.is_empty() {
                return Err(BridgeError::Configuration(format!(
                    "jni.{name} cannot be empty"
                )));
            }
        }

        if self.invoke.timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "Invoke timeout must be greater than zero".to_string(),
            ));
        }

        crate::logging::parse_level(&self.logging.level)?;

        Ok(())
    }

    /// Full path of the core library
    pub fn resolve_library_path(&self) -> PathBuf {
        match &self.core.library_dir {
            Some(dir) => Path::new(dir).join(&self.core.library),
            None => PathBuf::from(&self.core.library),
        }
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke.timeout_ms)
    }
}

impl FromStr for BridgeConfig {
    type Err = BridgeError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BridgeError::Configuration(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_library() -> String {
    "libclash.so".to_string()
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_log_level() -> String {
    "info".to_string()
}
