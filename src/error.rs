//! Error types and handling for the core bridge

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors (empty or invalid core path, bad config document)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The core library could not be opened
    #[error("Failed to load core library: {0}")]
    Load(String),

    /// The core library opened but lacks required symbols
    #[error("Core library is missing required symbols: {}", .0.join(", "))]
    MissingSymbols(Vec<&'static str>),

    /// A command was issued before the core was loaded
    #[error("Core not initialized")]
    NotInitialized,

    /// A required argument was absent
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A persistent reference could not be created for a managed object
    #[error("Failed to create persistent reference: {0}")]
    HandleCreation(String),

    /// The calling thread could not be attached to the managed runtime
    #[error("Failed to attach thread: {0}")]
    Attach(String),

    /// A synchronous action did not receive a result in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Action payload encode/decode errors
    #[error("JSON error: {0}")]
    Json(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Helper trait for converting errors to BridgeError
pub trait IntoBridgeError<T> {
    fn into_bridge_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoBridgeError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_bridge_error(self, context: &str) -> Result<T> {
        self.map_err(|e| BridgeError::Configuration(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Configuration(format!("TOML parsing error: {err}"))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Json(err.to_string())
    }
}
