//! Clash Core Bridge - runtime bridge between a managed host and the Clash core
//!
//! The Clash core ships as a separate shared library exporting a small C ABI.
//! This crate loads it at runtime, fills the core's callback slots with its own
//! functions, and exposes the core's commands to the host.
//!
//! ## What This Crate Provides
//! - Runtime loading and symbol resolution of the core library
//! - Reverse callbacks that reach the host from any core thread
//! - Ownership-correct marshaling of strings and object references
//! - One serialized command surface ([`core::Core`])
//! - JVM exports for the Android `ClashCoreBridge` class (feature `jni`)
//! - A native runtime for Rust hosts and the `core-probe` tool
//!
//! ## What The Host Must Provide
//! - The core library itself (`libclash.so` by default)
//! - A [`runtime::ManagedRuntime`], installed before the core is loaded

pub mod action;
pub mod callbacks;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod loader;
pub mod logging;
pub mod marshal;
pub mod native;
pub mod runtime;

#[cfg(feature = "jni")]
pub mod jni;

#[cfg(test)]
mod testing;

pub use action::{Action, ActionResult, CoreEvent};
pub use config::BridgeConfig;
pub use crate::core::Core;
pub use error::{BridgeError, Result};
pub use marshal::{Absent, BufferStats, ForeignString, HandleSource, ObjectHandle};
pub use native::{NativeHost, NativeObject, NativeRuntime};
pub use runtime::{ManagedRuntime, ThreadStatus};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
