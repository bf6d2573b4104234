//! Managed runtime for plain Rust hosts
//!
//! Objects handed to the core are boxed [`NativeObject`]s holding closures.
//! Rust threads need no attaching, so every thread always has a context.

use std::ffi::c_int;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;

use crate::action::{Action, ActionResult};
use crate::core::Core;
use crate::error::{BridgeError, Result};
use crate::marshal::{Absent, HandleSource, ObjectHandle};
use crate::runtime::{ManagedRuntime, ThreadStatus};

type ProtectFn = Box<dyn Fn(c_int) -> bool + Send + Sync>;
type ResultFn = Box<dyn Fn(&str) + Send + Sync>;

/// Object behind every handle the native runtime hands out
pub struct NativeObject {
    label: String,
    protect: Option<ProtectFn>,
    on_result: Option<ResultFn>,
}

impl NativeObject {
    /// An object that ignores every call
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            protect: None,
            on_result: None,
        }
    }

    /// A VPN service answering socket-protect requests with `protect`
    pub fn service<F>(label: impl Into<String>, protect: F) -> Self
    where
        F: Fn(c_int) -> bool + Send + Sync + 'static,
    {
        Self {
            protect: Some(Box::new(protect)),
            ..Self::labelled(label)
        }
    }

    /// A result callback or event listener
    pub fn callback<F>(label: impl Into<String>, on_result: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            on_result: Some(Box::new(on_result)),
            ..Self::labelled(label)
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn into_handle(self) -> ObjectHandle {
        ObjectHandle::from_box(Box::new(self))
    }

    /// # Safety
    ///
    /// `handle` must come from [`NativeObject::into_handle`] and must not have been released.
    pub(crate) unsafe fn from_handle<'a>(handle: ObjectHandle) -> &'a NativeObject {
        handle.as_ref::<NativeObject>()
    }

    pub fn protect(&self, fd: c_int) -> bool {
        match &self.protect {
            Some(protect) => protect(fd),
            None => {
                log::warn!("{}: no protect handler for fd {fd}", self.label);
                false
            }
        }
    }

    pub fn deliver(&self, data: &str) {
        if let Some(on_result) = &self.on_result {
            on_result(data);
        }
    }
}

impl HandleSource for NativeObject {
    fn is_absent(&self) -> bool {
        false
    }

    fn into_handle(self) -> Result<ObjectHandle> {
        Ok(NativeObject::into_handle(self))
    }
}

/// [`ManagedRuntime`] over [`NativeObject`] handles
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRuntime;

impl ManagedRuntime for NativeRuntime {
    fn thread_status(&self) -> ThreadStatus {
        ThreadStatus::Attached
    }

    fn attach_current_thread(&self) -> Result<()> {
        Ok(())
    }

    fn detach_current_thread(&self) {}

    fn release(&self, handle: ObjectHandle) {
        let object = unsafe { handle.into_box::<NativeObject>() };
        log::debug!("released {}", object.label);
    }

    fn protect_socket(&self, handle: ObjectHandle, fd: c_int) -> bool {
        unsafe { NativeObject::from_handle(handle) }.protect(fd)
    }

    fn deliver_result(&self, handle: ObjectHandle, data: &str) {
        unsafe { NativeObject::from_handle(handle) }.deliver(data);
    }

    fn clear_pending_exception(&self) {}
}

/// Convenience layer for Rust hosts driving a loaded [`Core`]
pub struct NativeHost<'c> {
    core: &'c Core,
    timeout: Duration,
}

impl<'c> NativeHost<'c> {
    pub fn new(core: &'c Core, timeout: Duration) -> Self {
        Self { core, timeout }
    }

    /// Run `method` and wait for the core's reply.
    pub fn invoke_sync(&self, method: &str, data: Value) -> Result<ActionResult> {
        let action = Action::new(method, data);
        let payload = action.to_json()?;

        let (sender, receiver) = mpsc::channel::<String>();
        let sender = Mutex::new(Some(sender));
        let callback = NativeObject::callback(format!("action:{method}"), move |reply| {
            let sender = sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(reply.to_string());
            }
        });

        log::debug!("invoke {method} id={}", action.id);
        self.core.invoke_action(Some(&payload), callback)?;

        let reply = receiver
            .recv_timeout(self.timeout)
            .map_err(|_| BridgeError::Timeout(method.to_string()))?;
        ActionResult::parse(&reply)
    }

    /// Route core events to `listener`.
    pub fn set_event_listener<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.core
            .set_event_listener(NativeObject::callback("event-listener", listener))
    }

    pub fn clear_event_listener(&self) -> Result<()> {
        self.core.set_event_listener(Absent)
    }
}
