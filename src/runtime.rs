//! Seam between the bridge and the managed runtime it serves.
//!
//! The JVM binding lives in [`crate::jni`]; [`crate::native`] serves plain Rust
//! hosts. Exactly one runtime is installed per process, before the core is
//! loaded. Callbacks fired while no runtime is installed are dropped.

use std::ffi::c_int;
use std::sync::OnceLock;

use crate::error::Result;
use crate::marshal::ObjectHandle;

/// Attachment state of the calling OS thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// The thread already has an execution context
    Attached,
    /// The thread is unknown to the runtime and must be attached first
    Detached,
    /// The runtime cannot hand out a context at all
    Unavailable,
}

/// Operations the bridge needs from the managed runtime.
///
/// The per-object methods are only called on a thread that holds a context
/// (see [`crate::context::ContextGuard`]).
pub trait ManagedRuntime: Send + Sync {
    fn thread_status(&self) -> ThreadStatus;

    fn attach_current_thread(&self) -> Result<()>;

    /// Detach the calling thread. Only called by the guard that attached it.
    fn detach_current_thread(&self);

    /// Drop the persistent reference behind `handle`.
    fn release(&self, handle: ObjectHandle);

    /// Ask the service object behind `handle` to exempt `fd` from the tunnel.
    fn protect_socket(&self, handle: ObjectHandle, fd: c_int) -> bool;

    /// Deliver `data` to the callback object behind `handle`.
    fn deliver_result(&self, handle: ObjectHandle, data: &str);

    /// Clear any exception left pending on the calling thread.
    fn clear_pending_exception(&self);
}

static RUNTIME: OnceLock<&'static dyn ManagedRuntime> = OnceLock::new();

/// Install the process-wide runtime. Returns `false` if one was already set.
///
/// The runtime lives for the rest of the process; callers usually pass
/// `Box::leak(Box::new(runtime))`.
pub fn install(runtime: &'static dyn ManagedRuntime) -> bool {
    match RUNTIME.set(runtime) {
        Ok(()) => true,
        Err(_) => {
            log::warn!("managed runtime already installed, keeping the first one");
            false
        }
    }
}

pub fn installed() -> Option<&'static dyn ManagedRuntime> {
    RUNTIME.get().copied()
}
