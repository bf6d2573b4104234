//! Marshaling between managed values and what the core accepts
//!
//! Two kinds of values cross the core boundary:
//!
//! - [`ForeignString`]: a `malloc`ed, NUL-terminated copy of a string. A buffer
//!   handed to the core as an argument belongs to the core from then on; it asks
//!   for it back through the free-string callback. A buffer the core returns is
//!   adopted, copied out and freed when the wrapper drops.
//! - [`ObjectHandle`]: an opaque persistent reference to a managed object. The
//!   core is the sole releaser of every handle the bridge gives it.

use std::ffi::{c_char, c_void, CStr};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

static ALLOCATED: AtomicU64 = AtomicU64::new(0);
static TRANSFERRED: AtomicU64 = AtomicU64::new(0);
static ADOPTED: AtomicU64 = AtomicU64::new(0);
static RELEASED: AtomicU64 = AtomicU64::new(0);

/// Process-wide counters for buffers crossing the core boundary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Buffers allocated by the bridge
    pub allocated: u64,
    /// Allocated buffers whose ownership moved to the core
    pub transferred: u64,
    /// Core-owned buffers taken back by the bridge
    pub adopted: u64,
    /// Buffers freed by the bridge
    pub released: u64,
}

impl BufferStats {
    pub fn snapshot() -> Self {
        Self {
            allocated: ALLOCATED.load(Ordering::Relaxed),
            transferred: TRANSFERRED.load(Ordering::Relaxed),
            adopted: ADOPTED.load(Ordering::Relaxed),
            released: RELEASED.load(Ordering::Relaxed),
        }
    }
}

/// Single-owner `malloc`ed C string.
///
/// Dropping the value frees the buffer. [`ForeignString::into_raw`] gives up
/// ownership without freeing, [`ForeignString::from_raw`] takes it back.
#[derive(Debug)]
pub struct ForeignString {
    ptr: NonNull<c_char>,
}

// The buffer is plain heap memory with a single owner.
unsafe impl Send for ForeignString {}

impl ForeignString {
    /// Copy `value` into a new buffer.
    ///
    /// Returns `None` when `value` holds an interior NUL or allocation fails.
    pub fn new(value: &str) -> Option<Self> {
        if value.as_bytes().contains(&0) {
            log::warn!("string with interior NUL cannot cross the core boundary");
            return None;
        }

        let len = value.len();
        let raw = unsafe { libc::malloc(len + 1) } as *mut c_char;
        let ptr = NonNull::new(raw)?;
        unsafe {
            ptr::copy_nonoverlapping(value.as_ptr() as *const c_char, raw, len);
            *raw.add(len) = 0;
        }
        ALLOCATED.fetch_add(1, Ordering::Relaxed);
        Some(Self { ptr })
    }

    /// Encode an optional argument: absent values and failed conversions become null.
    pub fn encode(value: Option<&str>) -> *mut c_char {
        value
            .and_then(Self::new)
            .map_or(ptr::null_mut(), Self::into_raw)
    }

    /// Hand the buffer over. The receiver must eventually pass it back to
    /// [`ForeignString::from_raw`] (the core does so through `free_string`).
    pub fn into_raw(self) -> *mut c_char {
        let raw = self.ptr.as_ptr();
        std::mem::forget(self);
        TRANSFERRED.fetch_add(1, Ordering::Relaxed);
        raw
    }

    /// Take ownership of a `malloc`ed, NUL-terminated buffer. Null yields `None`.
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live `malloc` allocation holding a NUL-terminated
    /// string that nobody else will free.
    pub unsafe fn from_raw(raw: *mut c_char) -> Option<Self> {
        let ptr = NonNull::new(raw)?;
        ADOPTED.fetch_add(1, Ordering::Relaxed);
        Some(Self { ptr })
    }

    pub fn as_c_str(&self) -> &CStr {
        unsafe { CStr::from_ptr(self.ptr.as_ptr()) }
    }

    pub fn to_string_lossy(&self) -> String {
        self.as_c_str().to_string_lossy().into_owned()
    }
}

impl Drop for ForeignString {
    fn drop(&mut self) {
        #[cfg(test)]
        crate::testing::note_released(self.ptr.as_ptr() as usize);

        unsafe { libc::free(self.ptr.as_ptr() as *mut c_void) };
        RELEASED.fetch_add(1, Ordering::Relaxed);
    }
}

/// Copy a core-returned buffer into an owned string and free it.
///
/// A null buffer yields an empty string.
///
/// # Safety
///
/// Same contract as [`ForeignString::from_raw`].
pub unsafe fn take_core_string(raw: *mut c_char) -> String {
    match ForeignString::from_raw(raw) {
        Some(buffer) => buffer.to_string_lossy(),
        None => String::new(),
    }
}

/// Opaque persistent reference to a managed object.
///
/// What the pointer refers to is decided by the installed
/// [`ManagedRuntime`](crate::runtime::ManagedRuntime); the core only stores it
/// and passes it back to the callbacks.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(NonNull<c_void>);

unsafe impl Send for ObjectHandle {}
unsafe impl Sync for ObjectHandle {}

impl ObjectHandle {
    pub fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Leak `value` behind a new handle.
    pub fn from_box<T>(value: Box<T>) -> Self {
        Self(NonNull::from(Box::leak(value)).cast())
    }

    /// Reclaim the box behind a handle created by [`ObjectHandle::from_box`].
    ///
    /// # Safety
    ///
    /// The handle must come from `from_box::<T>` and must not be used afterwards.
    pub unsafe fn into_box<T>(self) -> Box<T> {
        Box::from_raw(self.0.cast::<T>().as_ptr())
    }

    /// Borrow the value behind a handle created by [`ObjectHandle::from_box`].
    ///
    /// # Safety
    ///
    /// The handle must come from `from_box::<T>` and must not have been released.
    pub unsafe fn as_ref<'a, T>(self) -> &'a T {
        self.0.cast::<T>().as_ref()
    }
}

/// Raw form of an optional handle; `None` is the null handle.
pub fn raw_handle(handle: Option<ObjectHandle>) -> *mut c_void {
    handle.map_or(ptr::null_mut(), ObjectHandle::as_raw)
}

/// A managed object reference that can be turned into an [`ObjectHandle`].
///
/// Commands check [`HandleSource::is_absent`] before deciding whether to
/// create a handle, so argument validation never leaks a reference.
pub trait HandleSource {
    /// The managed reference is null.
    fn is_absent(&self) -> bool;

    /// Create a new persistent reference. Ownership goes to the caller.
    fn into_handle(self) -> Result<ObjectHandle>;
}

impl<F> HandleSource for Option<F>
where
    F: FnOnce() -> Result<ObjectHandle>,
{
    fn is_absent(&self) -> bool {
        self.is_none()
    }

    fn into_handle(self) -> Result<ObjectHandle> {
        match self {
            Some(create) => create(),
            None => Err(crate::BridgeError::InvalidArgument(
                "object reference is null".to_string(),
            )),
        }
    }
}

/// The null reference
#[derive(Debug, Clone, Copy, Default)]
pub struct Absent;

impl HandleSource for Absent {
    fn is_absent(&self) -> bool {
        true
    }

    fn into_handle(self) -> Result<ObjectHandle> {
        Err(crate::BridgeError::InvalidArgument(
            "object reference is null".to_string(),
        ))
    }
}
