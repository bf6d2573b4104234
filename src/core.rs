//! Command surface over the loaded core
//!
//! Every command runs under one process-wide lock, checks that the core is
//! loaded, validates and marshals its arguments, then forwards to the
//! resolved entry point. The lock only orders the bridge's own dispatch;
//! callbacks the core fires meanwhile do not take it.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, OnceLock};

use crate::callbacks::{self, CallbackTable};
use crate::error::{BridgeError, Result};
use crate::loader::{CoreSymbols, LoadedCore};
use crate::marshal::{self, ForeignString, HandleSource};

static CORE: Core = Core::new();

/// The process-wide core
pub fn global() -> &'static Core {
    &CORE
}

/// Loaded-once core plus the lock serializing commands
pub struct Core {
    lock: Mutex<()>,
    loaded: OnceLock<LoadedCore>,
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl Core {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            loaded: OnceLock::new(),
        }
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Load the core library at `path` and inject the bridge callbacks.
    ///
    /// Succeeds immediately if a core is already loaded, whatever `path` is.
    pub fn init<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.ensure_loaded_with(|| {
            log::info!("loading core library: {}", path.display());
            LoadedCore::open(path)
        })
    }

    /// Run `load` unless a core is already loaded, then inject the callbacks
    /// before publishing the result.
    pub fn ensure_loaded_with<F>(&self, load: F) -> Result<()>
    where
        F: FnOnce() -> Result<LoadedCore>,
    {
        let _guard = self.acquire();
        if self.is_loaded() {
            return Ok(());
        }

        let core = load()?;
        // No command has reached the core yet, so nothing reads the slots.
        unsafe { callbacks::inject(&core.symbols, &CallbackTable::BRIDGE) };
        if self.loaded.set(core).is_err() {
            log::warn!("core already published, keeping the first one");
            return Ok(());
        }
        log::info!("core library loaded");
        Ok(())
    }

    fn dispatch<T>(&self, command: &str, call: impl FnOnce(&CoreSymbols) -> Result<T>) -> Result<T> {
        let _guard = self.acquire();
        let Some(core) = self.loaded.get() else {
            log::error!("{command}: core not initialized");
            return Err(BridgeError::NotInitialized);
        };
        call(&core.symbols)
    }

    /// Start the tunnel on `fd`. Ownership of the new service handle moves to the core.
    pub fn start_tun(
        &self,
        fd: i32,
        service: impl HandleSource,
        stack: Option<&str>,
        address: Option<&str>,
        dns: Option<&str>,
    ) -> Result<bool> {
        self.dispatch("start_tun", |core| {
            if fd < 0 {
                return Err(BridgeError::InvalidArgument(format!(
                    "invalid tun file descriptor: {fd}"
                )));
            }
            if service.is_absent() {
                log::error!("start_tun: VPN service is null");
                return Err(BridgeError::InvalidArgument("VPN service is null".to_string()));
            }
            let service = service.into_handle()?;

            log::info!(
                "start_tun: fd={fd} stack={} address={} dns={}",
                stack.unwrap_or("null"),
                address.unwrap_or("null"),
                dns.unwrap_or("null")
            );
            let ok = unsafe {
                (core.start_tun)(
                    service.as_raw(),
                    fd,
                    ForeignString::encode(stack),
                    ForeignString::encode(address),
                    ForeignString::encode(dns),
                )
            };
            if ok {
                log::info!("start_tun returned true");
            } else {
                log::error!("start_tun returned false");
            }
            Ok(ok)
        })
    }

    pub fn stop_tun(&self) -> Result<()> {
        self.dispatch("stop_tun", |core| {
            unsafe { (core.stop_tun)() };
            Ok(())
        })
    }

    /// Send an action to the core; the result arrives on `callback`, whose
    /// new handle the core owns.
    pub fn invoke_action(&self, data: Option<&str>, callback: impl HandleSource) -> Result<()> {
        self.dispatch("invoke_action", |core| {
            let data = data
                .ok_or_else(|| BridgeError::InvalidArgument("action data is null".to_string()))?;
            if callback.is_absent() {
                return Err(BridgeError::InvalidArgument("callback is null".to_string()));
            }
            let data = ForeignString::new(data).ok_or_else(|| {
                BridgeError::InvalidArgument("action data cannot be encoded".to_string())
            })?;
            let callback = callback.into_handle()?;

            unsafe { (core.invoke_action)(callback.as_raw(), data.into_raw()) };
            Ok(())
        })
    }

    /// Register `listener` for core events, or clear the registration when it is absent.
    ///
    /// The previous listener's handle is not released here; the core owns it.
    pub fn set_event_listener(&self, listener: impl HandleSource) -> Result<()> {
        self.dispatch("set_event_listener", |core| {
            let handle = if listener.is_absent() {
                None
            } else {
                Some(listener.into_handle()?)
            };
            unsafe { (core.set_event_listener)(marshal::raw_handle(handle)) };
            Ok(())
        })
    }

    pub fn suspend(&self, suspended: bool) -> Result<()> {
        self.dispatch("suspend", |core| {
            unsafe { (core.suspend)(suspended) };
            Ok(())
        })
    }

    pub fn force_gc(&self) -> Result<()> {
        self.dispatch("force_gc", |core| {
            unsafe { (core.force_gc)() };
            Ok(())
        })
    }

    pub fn update_dns(&self, dns: Option<&str>) -> Result<()> {
        self.dispatch("update_dns", |core| {
            let dns = dns.ok_or_else(|| BridgeError::InvalidArgument("DNS is null".to_string()))?;
            let dns = ForeignString::new(dns)
                .ok_or_else(|| BridgeError::InvalidArgument("DNS cannot be encoded".to_string()))?;
            unsafe { (core.update_dns)(dns.into_raw()) };
            Ok(())
        })
    }

    pub fn get_traffic(&self, only_statistics_proxy: bool) -> Result<String> {
        self.dispatch("get_traffic", |core| {
            Ok(unsafe { marshal::take_core_string((core.get_traffic)(only_statistics_proxy)) })
        })
    }

    pub fn get_total_traffic(&self, only_statistics_proxy: bool) -> Result<String> {
        self.dispatch("get_total_traffic", |core| {
            Ok(unsafe {
                marshal::take_core_string((core.get_total_traffic)(only_statistics_proxy))
            })
        })
    }
}
