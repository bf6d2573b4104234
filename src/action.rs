//! JSON envelopes exchanged with the core through invoke-action and the event listener

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BridgeError, Result};

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Nanosecond timestamp id, strictly increasing within the process
fn next_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default();
    let previous = LAST_ID
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(previous + 1).to_string()
}

/// A request for the core's action dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl Action {
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            id: next_id(),
            method: method.into(),
            data,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The core's reply to an [`Action`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl ActionResult {
    pub fn parse(payload: &str) -> Result<Self> {
        if payload.is_empty() {
            return Err(BridgeError::Json("empty action result".to_string()));
        }
        Ok(serde_json::from_str(payload)?)
    }

    /// `data` as a boolean; anything else counts as `false`.
    pub fn bool_data(&self) -> bool {
        self.data.as_bool().unwrap_or(false)
    }

    /// `data` as a string. Non-string values are rendered as JSON, null as empty.
    pub fn str_data(&self) -> String {
        match &self.data {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Log line pushed by the core
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub payload: String,
}

/// Messages delivered to the event listener
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Log(LogEntry),
    /// Any other message type, kept as raw JSON
    Other { kind: String, data: Value },
}

#[derive(Deserialize)]
struct Message {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl CoreEvent {
    /// Decode a listener payload of the form `{"method":"message","data":{"type":..,"data":..}}`.
    pub fn parse(payload: &str) -> Result<Self> {
        let envelope = ActionResult::parse(payload)?;
        if envelope.method != "message" {
            return Ok(CoreEvent::Other {
                kind: envelope.method,
                data: envelope.data,
            });
        }

        let message: Message = serde_json::from_value(envelope.data)?;
        match message.kind.as_str() {
            "log" => Ok(CoreEvent::Log(serde_json::from_value(message.data)?)),
            _ => Ok(CoreEvent::Other {
                kind: message.kind,
                data: message.data,
            }),
        }
    }
}
