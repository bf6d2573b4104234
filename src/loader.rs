//! Core library loading and ABI symbol resolution
//!
//! The core exports nine functions and four writable function-pointer
//! variables ("slots"). Resolution is all-or-nothing: a library missing any
//! of the thirteen symbols is rejected as a whole.

use std::ffi::{c_char, c_int, c_void};
use std::path::Path;

use libloading::Library;

use crate::error::{BridgeError, Result};

pub type StartTunFn =
    unsafe extern "C" fn(*mut c_void, c_int, *mut c_char, *mut c_char, *mut c_char) -> bool;
pub type StopTunFn = unsafe extern "C" fn();
pub type InvokeActionFn = unsafe extern "C" fn(*mut c_void, *mut c_char);
pub type SetEventListenerFn = unsafe extern "C" fn(*mut c_void);
pub type SuspendFn = unsafe extern "C" fn(bool);
pub type ForceGcFn = unsafe extern "C" fn();
pub type UpdateDnsFn = unsafe extern "C" fn(*mut c_char);
pub type GetTrafficFn = unsafe extern "C" fn(bool) -> *mut c_char;
pub type GetTotalTrafficFn = unsafe extern "C" fn(bool) -> *mut c_char;

pub type ReleaseObjectFn = unsafe extern "C" fn(*mut c_void);
pub type FreeStringFn = unsafe extern "C" fn(*mut c_char);
pub type ProtectSocketFn = unsafe extern "C" fn(*mut c_void, c_int);
pub type ResultFn = unsafe extern "C" fn(*mut c_void, *const c_char);

/// Exported symbol names, functions first, then slots
pub const SYMBOL_NAMES: [&str; 13] = [
    "startTUN",
    "stopTun",
    "invokeAction",
    "setEventListener",
    "suspend",
    "forceGC",
    "updateDns",
    "getTraffic",
    "getTotalTraffic",
    "release_object_func",
    "free_string_func",
    "protect_socket_func",
    "result_func",
];

/// Anything that can look up a symbol address by name
pub trait SymbolSource: Send + Sync {
    /// Address of `name`, or `None` when it is not exported.
    fn symbol(&self, name: &str) -> Option<*mut c_void>;
}

/// The core shared library, opened with immediate global binding
pub struct CoreLibrary {
    library: Library,
}

impl CoreLibrary {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(BridgeError::Configuration("core path is empty".to_string()));
        }

        let library = Self::open_library(path).map_err(|e| BridgeError::Load(e.to_string()))?;
        Ok(Self { library })
    }

    #[cfg(unix)]
    fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
        use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};

        unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }.map(Library::from)
    }

    #[cfg(not(unix))]
    fn open_library(path: &Path) -> std::result::Result<Library, libloading::Error> {
        unsafe { Library::new(path) }
    }
}

impl SymbolSource for CoreLibrary {
    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        let mut bytes = Vec::with_capacity(name.len() + 1);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);

        let symbol = unsafe { self.library.get::<*mut c_void>(&bytes) }.ok()?;
        let address = *symbol;
        (!address.is_null()).then_some(address)
    }
}

/// Writable function-pointer variable owned by the core
pub struct Slot<F> {
    ptr: *mut Option<F>,
}

impl<F> Slot<F> {
    /// # Safety
    ///
    /// `ptr` must be non-null and point to a variable with the layout of
    /// `Option<F>` that lives as long as the library.
    unsafe fn from_address(ptr: *mut c_void) -> Self {
        Self {
            ptr: ptr as *mut Option<F>,
        }
    }

    /// Install `callback` into the slot.
    ///
    /// # Safety
    ///
    /// The core must not be reading the slot concurrently.
    pub unsafe fn install(&self, callback: F) {
        std::ptr::write_volatile(self.ptr, Some(callback));
    }

    /// Current slot contents.
    ///
    /// # Safety
    ///
    /// The core must not be writing the slot concurrently.
    pub unsafe fn current(&self) -> Option<F>
    where
        F: Copy,
    {
        std::ptr::read_volatile(self.ptr)
    }
}

/// Fully resolved core ABI. Never exists partially resolved.
pub struct CoreSymbols {
    pub start_tun: StartTunFn,
    pub stop_tun: StopTunFn,
    pub invoke_action: InvokeActionFn,
    pub set_event_listener: SetEventListenerFn,
    pub suspend: SuspendFn,
    pub force_gc: ForceGcFn,
    pub update_dns: UpdateDnsFn,
    pub get_traffic: GetTrafficFn,
    pub get_total_traffic: GetTotalTrafficFn,

    pub release_object_slot: Slot<ReleaseObjectFn>,
    pub free_string_slot: Slot<FreeStringFn>,
    pub protect_socket_slot: Slot<ProtectSocketFn>,
    pub result_slot: Slot<ResultFn>,
}

// Function pointers and process-lifetime slot addresses; the slots are only
// written once under the core lock.
unsafe impl Send for CoreSymbols {}
unsafe impl Sync for CoreSymbols {}

impl CoreSymbols {
    /// Resolve every required symbol from `source`.
    ///
    /// Fails with [`BridgeError::MissingSymbols`] naming all absent symbols.
    pub fn resolve(source: &dyn SymbolSource) -> Result<Self> {
        let addresses: Vec<Option<*mut c_void>> =
            SYMBOL_NAMES.iter().map(|name| source.symbol(name)).collect();

        let missing: Vec<&'static str> = SYMBOL_NAMES
            .iter()
            .zip(&addresses)
            .filter(|(_, address)| address.is_none())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            for name in &missing {
                log::error!("missing core symbol: {name}");
            }
            return Err(BridgeError::MissingSymbols(missing));
        }

        let a: Vec<*mut c_void> = addresses.into_iter().flatten().collect();

        // Every address is non-null and was exported under the expected name.
        unsafe {
            Ok(Self {
                start_tun: std::mem::transmute::<*mut c_void, StartTunFn>(a[0]),
                stop_tun: std::mem::transmute::<*mut c_void, StopTunFn>(a[1]),
                invoke_action: std::mem::transmute::<*mut c_void, InvokeActionFn>(a[2]),
                set_event_listener: std::mem::transmute::<*mut c_void, SetEventListenerFn>(a[3]),
                suspend: std::mem::transmute::<*mut c_void, SuspendFn>(a[4]),
                force_gc: std::mem::transmute::<*mut c_void, ForceGcFn>(a[5]),
                update_dns: std::mem::transmute::<*mut c_void, UpdateDnsFn>(a[6]),
                get_traffic: std::mem::transmute::<*mut c_void, GetTrafficFn>(a[7]),
                get_total_traffic: std::mem::transmute::<*mut c_void, GetTotalTrafficFn>(a[8]),
                release_object_slot: Slot::from_address(a[9]),
                free_string_slot: Slot::from_address(a[10]),
                protect_socket_slot: Slot::from_address(a[11]),
                result_slot: Slot::from_address(a[12]),
            })
        }
    }
}

/// A resolved core together with the source that keeps its code mapped
pub struct LoadedCore {
    _source: Box<dyn SymbolSource>,
    pub symbols: CoreSymbols,
}

impl LoadedCore {
    pub fn from_source(source: Box<dyn SymbolSource>) -> Result<Self> {
        let symbols = CoreSymbols::resolve(source.as_ref())?;
        Ok(Self {
            _source: source,
            symbols,
        })
    }

    /// Open the library at `path` and resolve it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let library = CoreLibrary::open(path)?;
        Self::from_source(Box::new(library))
    }
}
