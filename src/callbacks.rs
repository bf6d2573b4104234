//! Reverse callbacks the core uses to reach the managed side
//!
//! Right after a successful load the bridge writes the four functions below
//! into the core's slots. The core may call them from any thread, including
//! its own workers, so each one acquires a [`ContextGuard`] before touching
//! the runtime. Panics are caught at the boundary.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};

use crate::context::ContextGuard;
use crate::loader::{CoreSymbols, FreeStringFn, ProtectSocketFn, ReleaseObjectFn, ResultFn};
use crate::marshal::{ForeignString, ObjectHandle};
use crate::runtime::{self, ManagedRuntime};

/// The four functions written into the core's slots
#[derive(Clone, Copy)]
pub struct CallbackTable {
    pub release_object: ReleaseObjectFn,
    pub free_string: FreeStringFn,
    pub protect_socket: ProtectSocketFn,
    pub result: ResultFn,
}

impl CallbackTable {
    /// The bridge's own implementations
    pub const BRIDGE: CallbackTable = CallbackTable {
        release_object,
        free_string,
        protect_socket,
        result: deliver_result,
    };
}

/// Write `table` into the core's slots.
///
/// # Safety
///
/// Must run before any command that lets the core fire a callback, while no
/// core thread can be reading the slots.
pub(crate) unsafe fn inject(symbols: &CoreSymbols, table: &CallbackTable) {
    symbols.release_object_slot.install(table.release_object);
    symbols.free_string_slot.install(table.free_string);
    symbols.protect_socket_slot.install(table.protect_socket);
    symbols.result_slot.install(table.result);
    log::debug!("callbacks injected into core slots");
}

fn guarded(name: &str, callback: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        log::error!("{name} callback panicked");
    }
}

fn with_runtime(name: &str, callback: impl FnOnce(&'static dyn ManagedRuntime)) {
    guarded(name, || match runtime::installed() {
        Some(runtime) => callback(runtime),
        None => log::debug!("{name}: no managed runtime installed"),
    });
}

/// Release a handle the core is done with. Returns whether it was released.
pub fn release_object_with(runtime: &dyn ManagedRuntime, handle: *mut c_void) -> bool {
    let Some(handle) = ObjectHandle::from_raw(handle) else {
        return false;
    };
    let Some(context) = ContextGuard::acquire(runtime) else {
        log::warn!("release_object: no execution context, handle leaked");
        return false;
    };
    context.runtime().release(handle);
    true
}

/// Forward a socket-protect request. Returns the managed method's answer.
pub fn protect_socket_with(runtime: &dyn ManagedRuntime, handle: *mut c_void, fd: c_int) -> bool {
    let Some(handle) = ObjectHandle::from_raw(handle) else {
        return false;
    };
    let Some(context) = ContextGuard::acquire(runtime) else {
        log::warn!("protect_socket: no execution context for fd {fd}");
        return false;
    };
    let protected = context.runtime().protect_socket(handle, fd);
    if !protected {
        log::warn!("protect_socket: fd {fd} was not protected");
    }
    protected
}

/// Deliver a result payload. Returns whether it reached the managed side.
pub fn deliver_result_with(runtime: &dyn ManagedRuntime, handle: *mut c_void, data: &str) -> bool {
    let Some(handle) = ObjectHandle::from_raw(handle) else {
        return false;
    };
    let Some(context) = ContextGuard::acquire(runtime) else {
        log::debug!("deliver_result: no execution context, result dropped");
        return false;
    };
    context.runtime().deliver_result(handle, data);
    true
}

unsafe extern "C" fn release_object(handle: *mut c_void) {
    with_runtime("release_object", |runtime| {
        release_object_with(runtime, handle);
    });
}

unsafe extern "C" fn free_string(data: *mut c_char) {
    guarded("free_string", || drop(ForeignString::from_raw(data)));
}

unsafe extern "C" fn protect_socket(handle: *mut c_void, fd: c_int) {
    with_runtime("protect_socket", |runtime| {
        protect_socket_with(runtime, handle, fd);
    });
}

unsafe extern "C" fn deliver_result(handle: *mut c_void, data: *const c_char) {
    with_runtime("deliver_result", |runtime| {
        let text = if data.is_null() {
            String::new()
        } else {
            CStr::from_ptr(data).to_string_lossy().into_owned()
        };
        deliver_result_with(runtime, handle, &text);
    });
}
