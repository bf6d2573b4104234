//! Execution context for callbacks arriving on arbitrary native threads

use crate::runtime::{ManagedRuntime, ThreadStatus};

/// Scoped execution context for one native-to-managed transition.
///
/// Acquiring attaches the calling thread if the runtime does not know it yet.
/// Dropping clears any pending managed exception and detaches the thread only
/// when this guard attached it.
pub struct ContextGuard<'r> {
    runtime: &'r dyn ManagedRuntime,
    attached_here: bool,
}

impl<'r> ContextGuard<'r> {
    /// Obtain a context for the current thread, or `None` if the runtime has
    /// none to give.
    pub fn acquire(runtime: &'r dyn ManagedRuntime) -> Option<Self> {
        let attached_here = match runtime.thread_status() {
            ThreadStatus::Attached => false,
            ThreadStatus::Detached => {
                if let Err(err) = runtime.attach_current_thread() {
                    log::warn!("failed to attach native thread: {err}");
                    return None;
                }
                true
            }
            ThreadStatus::Unavailable => return None,
        };

        Some(Self {
            runtime,
            attached_here,
        })
    }

    pub fn runtime(&self) -> &'r dyn ManagedRuntime {
        self.runtime
    }

    pub fn attached_here(&self) -> bool {
        self.attached_here
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.runtime.clear_pending_exception();
        if self.attached_here {
            self.runtime.detach_current_thread();
        }
    }
}
