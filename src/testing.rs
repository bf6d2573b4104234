//! Test doubles: a fake core library and a recording managed runtime

use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::{c_char, c_int, c_void, CStr};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::loader::{
    ForceGcFn, FreeStringFn, GetTotalTrafficFn, GetTrafficFn, InvokeActionFn, ProtectSocketFn,
    ReleaseObjectFn, ResultFn, SetEventListenerFn, StartTunFn, StopTunFn, SuspendFn,
    SymbolSource, UpdateDnsFn,
};
use crate::marshal::{ForeignString, ObjectHandle};
use crate::native::NativeObject;
use crate::runtime::{self, ManagedRuntime, ThreadStatus};

thread_local! {
    static RELEASED_HERE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Called by `ForeignString::drop` with the address of each freed buffer.
pub(crate) fn note_released(address: usize) {
    RELEASED_HERE.with(|released| released.borrow_mut().push(address));
}

/// Addresses of the buffers freed on the current thread, oldest first.
pub(crate) fn take_released_here() -> Vec<usize> {
    RELEASED_HERE.with(|released| std::mem::take(&mut *released.borrow_mut()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Fake core ───────────────────────────────────────────────────────

/// Calls received by the fake core, with string arguments copied out
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CoreCall {
    StartTun {
        service: usize,
        fd: c_int,
        stack: Option<String>,
        address: Option<String>,
        dns: Option<String>,
    },
    StopTun,
    InvokeAction {
        callback: usize,
        data: Option<String>,
    },
    SetEventListener(usize),
    Suspend(bool),
    ForceGc,
    UpdateDns(Option<String>),
    GetTraffic(bool),
    GetTotalTraffic(bool),
}

static SERIAL: Mutex<()> = Mutex::new(());
static CALLS: Mutex<Vec<CoreCall>> = Mutex::new(Vec::new());
static START_RESULT: AtomicBool = AtomicBool::new(true);
static TRAFFIC_REPLY: Mutex<Option<String>> = Mutex::new(None);
static ACTION_REPLY: Mutex<Option<String>> = Mutex::new(None);
static LAST_RETURNED: AtomicUsize = AtomicUsize::new(0);
static SERVICE: AtomicUsize = AtomicUsize::new(0);
static CALL_DELAY_MS: AtomicU64 = AtomicU64::new(0);
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

struct SlotCell<F>(std::cell::UnsafeCell<Option<F>>);

unsafe impl<F> Sync for SlotCell<F> {}

impl<F: Copy> SlotCell<F> {
    const fn new() -> Self {
        Self(std::cell::UnsafeCell::new(None))
    }

    fn address(&self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    fn get(&self) -> Option<F> {
        unsafe { ptr::read_volatile(self.0.get()) }
    }

    fn clear(&self) {
        unsafe { ptr::write_volatile(self.0.get(), None) }
    }
}

static RELEASE_SLOT: SlotCell<ReleaseObjectFn> = SlotCell::new();
static FREE_SLOT: SlotCell<FreeStringFn> = SlotCell::new();
static PROTECT_SLOT: SlotCell<ProtectSocketFn> = SlotCell::new();
static RESULT_SLOT: SlotCell<ResultFn> = SlotCell::new();

/// Serialize tests that share the fake core or the installed runtime, and
/// reset the fake core's state.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    let guard = lock(&SERIAL);
    lock(&CALLS).clear();
    START_RESULT.store(true, Ordering::SeqCst);
    *lock(&TRAFFIC_REPLY) = None;
    *lock(&ACTION_REPLY) = None;
    LAST_RETURNED.store(0, Ordering::SeqCst);
    SERVICE.store(0, Ordering::SeqCst);
    CALL_DELAY_MS.store(0, Ordering::SeqCst);
    IN_FLIGHT.store(0, Ordering::SeqCst);
    MAX_IN_FLIGHT.store(0, Ordering::SeqCst);
    guard
}

pub(crate) fn clear_slots() {
    RELEASE_SLOT.clear();
    FREE_SLOT.clear();
    PROTECT_SLOT.clear();
    RESULT_SLOT.clear();
}

pub(crate) fn calls() -> Vec<CoreCall> {
    lock(&CALLS).clone()
}

pub(crate) fn set_start_result(ok: bool) {
    START_RESULT.store(ok, Ordering::SeqCst);
}

/// What `getTraffic`/`getTotalTraffic` return; `None` makes them return null.
pub(crate) fn set_traffic_reply(reply: Option<&str>) {
    *lock(&TRAFFIC_REPLY) = reply.map(str::to_string);
}

/// When set, `invokeAction` delivers this payload and releases the callback.
pub(crate) fn set_action_reply(reply: Option<&str>) {
    *lock(&ACTION_REPLY) = reply.map(str::to_string);
}

pub(crate) fn last_returned_buffer() -> usize {
    LAST_RETURNED.load(Ordering::SeqCst)
}

pub(crate) fn set_call_delay(delay: Duration) {
    CALL_DELAY_MS.store(delay.as_millis() as u64, Ordering::SeqCst);
}

pub(crate) fn max_in_flight() -> usize {
    MAX_IN_FLIGHT.load(Ordering::SeqCst)
}

/// Invoke the installed protect-socket slot the way the core would.
pub(crate) fn core_protect(service: *mut c_void, fd: c_int) {
    if let Some(protect) = PROTECT_SLOT.get() {
        unsafe { protect(service, fd) };
    }
}

struct Flight;

impl Flight {
    fn enter() -> Self {
        let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
        MAX_IN_FLIGHT.fetch_max(now, Ordering::SeqCst);
        let delay = CALL_DELAY_MS.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        Flight
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    }
}

fn record(call: CoreCall) {
    lock(&CALLS).push(call);
}

/// Copy an argument buffer and hand it back through the free-string slot.
unsafe fn take_arg(raw: *mut c_char) -> Option<String> {
    if raw.is_null() {
        return None;
    }
    let text = CStr::from_ptr(raw).to_string_lossy().into_owned();
    match FREE_SLOT.get() {
        Some(free) => free(raw),
        None => drop(ForeignString::from_raw(raw)),
    }
    Some(text)
}

fn traffic_reply() -> *mut c_char {
    let raw = lock(&TRAFFIC_REPLY)
        .as_deref()
        .and_then(ForeignString::new)
        .map_or(ptr::null_mut(), ForeignString::into_raw);
    LAST_RETURNED.store(raw as usize, Ordering::SeqCst);
    raw
}

unsafe extern "C" fn fake_start_tun(
    service: *mut c_void,
    fd: c_int,
    stack: *mut c_char,
    address: *mut c_char,
    dns: *mut c_char,
) -> bool {
    let _flight = Flight::enter();
    record(CoreCall::StartTun {
        service: service as usize,
        fd,
        stack: take_arg(stack),
        address: take_arg(address),
        dns: take_arg(dns),
    });
    SERVICE.store(service as usize, Ordering::SeqCst);
    START_RESULT.load(Ordering::SeqCst)
}

unsafe extern "C" fn fake_stop_tun() {
    let _flight = Flight::enter();
    record(CoreCall::StopTun);
    let service = SERVICE.swap(0, Ordering::SeqCst);
    if service != 0 {
        if let Some(release) = RELEASE_SLOT.get() {
            release(service as *mut c_void);
        }
    }
}

unsafe extern "C" fn fake_invoke_action(callback: *mut c_void, data: *mut c_char) {
    let _flight = Flight::enter();
    record(CoreCall::InvokeAction {
        callback: callback as usize,
        data: take_arg(data),
    });
    let reply = lock(&ACTION_REPLY).clone();
    if let Some(reply) = reply {
        let payload = std::ffi::CString::new(reply).unwrap_or_default();
        if let Some(result) = RESULT_SLOT.get() {
            result(callback, payload.as_ptr());
        }
        if let Some(release) = RELEASE_SLOT.get() {
            release(callback);
        }
    }
}

unsafe extern "C" fn fake_set_event_listener(listener: *mut c_void) {
    record(CoreCall::SetEventListener(listener as usize));
}

unsafe extern "C" fn fake_suspend(suspended: bool) {
    record(CoreCall::Suspend(suspended));
}

unsafe extern "C" fn fake_force_gc() {
    let _flight = Flight::enter();
    record(CoreCall::ForceGc);
}

unsafe extern "C" fn fake_update_dns(dns: *mut c_char) {
    record(CoreCall::UpdateDns(take_arg(dns)));
}

unsafe extern "C" fn fake_get_traffic(only_proxy: bool) -> *mut c_char {
    record(CoreCall::GetTraffic(only_proxy));
    traffic_reply()
}

unsafe extern "C" fn fake_get_total_traffic(only_proxy: bool) -> *mut c_char {
    record(CoreCall::GetTotalTraffic(only_proxy));
    traffic_reply()
}

/// Symbol table standing in for the core shared library
pub(crate) struct FakeCore {
    missing: Vec<&'static str>,
    lookups: Arc<AtomicUsize>,
}

impl FakeCore {
    pub(crate) fn complete() -> Self {
        Self::without(&[])
    }

    pub(crate) fn without(missing: &[&'static str]) -> Self {
        Self {
            missing: missing.to_vec(),
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub(crate) fn lookup_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.lookups)
    }
}

impl SymbolSource for FakeCore {
    fn symbol(&self, name: &str) -> Option<*mut c_void> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&name) {
            return None;
        }
        let address = match name {
            "startTUN" => fake_start_tun as StartTunFn as *mut c_void,
            "stopTun" => fake_stop_tun as StopTunFn as *mut c_void,
            "invokeAction" => fake_invoke_action as InvokeActionFn as *mut c_void,
            "setEventListener" => fake_set_event_listener as SetEventListenerFn as *mut c_void,
            "suspend" => fake_suspend as SuspendFn as *mut c_void,
            "forceGC" => fake_force_gc as ForceGcFn as *mut c_void,
            "updateDns" => fake_update_dns as UpdateDnsFn as *mut c_void,
            "getTraffic" => fake_get_traffic as GetTrafficFn as *mut c_void,
            "getTotalTraffic" => fake_get_total_traffic as GetTotalTrafficFn as *mut c_void,
            "release_object_func" => RELEASE_SLOT.address(),
            "free_string_func" => FREE_SLOT.address(),
            "protect_socket_func" => PROTECT_SLOT.address(),
            "result_func" => RESULT_SLOT.address(),
            _ => return None,
        };
        Some(address)
    }
}

// ─── Recording runtime ───────────────────────────────────────────────

thread_local! {
    static ATTACHED: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
    static PENDING_EXCEPTION: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

static NEXT_RUNTIME_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub created: usize,
    pub attaches: usize,
    pub detaches: usize,
    pub exceptions_cleared: usize,
    /// Object calls made on a thread that held no context
    pub calls_without_context: usize,
}

#[derive(Default)]
struct Recorded {
    counters: Counters,
    released: Vec<String>,
    protected: Vec<(String, c_int)>,
    delivered: Vec<(String, String)>,
}

/// `ManagedRuntime` with per-thread attach bookkeeping that records every call.
///
/// Handles use the [`NativeObject`] layout, so objects built by
/// [`crate::native::NativeHost`] work against it too.
pub(crate) struct RecordingRuntime {
    id: usize,
    available: bool,
    attach_fails: AtomicBool,
    throw_on_deliver: AtomicBool,
    protect_result: AtomicBool,
    recorded: Mutex<Recorded>,
}

impl RecordingRuntime {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::SeqCst),
            available: true,
            attach_fails: AtomicBool::new(false),
            throw_on_deliver: AtomicBool::new(false),
            protect_result: AtomicBool::new(true),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub(crate) fn reset(&self) {
        *lock(&self.recorded) = Recorded::default();
        self.attach_fails.store(false, Ordering::SeqCst);
        self.throw_on_deliver.store(false, Ordering::SeqCst);
        self.protect_result.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_attach(&self) {
        self.attach_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn throw_on_deliver(&self) {
        self.throw_on_deliver.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_protect_result(&self, protected: bool) {
        self.protect_result.store(protected, Ordering::SeqCst);
    }

    /// New persistent reference to a labelled object
    pub(crate) fn object(&self, label: &str) -> ObjectHandle {
        lock(&self.recorded).counters.created += 1;
        NativeObject::labelled(label).into_handle()
    }

    /// Handle source that creates a labelled object on demand
    pub(crate) fn source<'a>(
        &'a self,
        label: &'a str,
    ) -> Option<impl FnOnce() -> Result<ObjectHandle> + 'a> {
        Some(move || Ok(self.object(label)))
    }

    pub(crate) fn failing_source() -> Option<impl FnOnce() -> Result<ObjectHandle>> {
        Some(|| {
            Err(BridgeError::HandleCreation(
                "global reference table exhausted".to_string(),
            ))
        })
    }

    pub(crate) fn is_attached(&self) -> bool {
        ATTACHED.with(|attached| attached.borrow().contains(&self.id))
    }

    pub(crate) fn raise_exception(&self) {
        PENDING_EXCEPTION.with(|pending| pending.borrow_mut().insert(self.id));
    }

    pub(crate) fn has_pending_exception(&self) -> bool {
        PENDING_EXCEPTION.with(|pending| pending.borrow().contains(&self.id))
    }

    pub(crate) fn counters(&self) -> Counters {
        lock(&self.recorded).counters.clone()
    }

    pub(crate) fn released(&self) -> Vec<String> {
        lock(&self.recorded).released.clone()
    }

    pub(crate) fn protected(&self) -> Vec<(String, c_int)> {
        lock(&self.recorded).protected.clone()
    }

    pub(crate) fn delivered(&self) -> Vec<(String, String)> {
        lock(&self.recorded).delivered.clone()
    }

    fn check_context(&self, recorded: &mut Recorded) {
        if !self.is_attached() {
            recorded.counters.calls_without_context += 1;
        }
    }
}

impl ManagedRuntime for RecordingRuntime {
    fn thread_status(&self) -> ThreadStatus {
        if !self.available {
            ThreadStatus::Unavailable
        } else if self.is_attached() {
            ThreadStatus::Attached
        } else {
            ThreadStatus::Detached
        }
    }

    fn attach_current_thread(&self) -> Result<()> {
        if self.attach_fails.load(Ordering::SeqCst) {
            return Err(BridgeError::Attach("attach refused".to_string()));
        }
        ATTACHED.with(|attached| attached.borrow_mut().insert(self.id));
        lock(&self.recorded).counters.attaches += 1;
        Ok(())
    }

    fn detach_current_thread(&self) {
        ATTACHED.with(|attached| attached.borrow_mut().remove(&self.id));
        lock(&self.recorded).counters.detaches += 1;
    }

    fn release(&self, handle: ObjectHandle) {
        let object = unsafe { handle.into_box::<NativeObject>() };
        let mut recorded = lock(&self.recorded);
        self.check_context(&mut recorded);
        recorded.released.push(object.label().to_string());
    }

    fn protect_socket(&self, handle: ObjectHandle, fd: c_int) -> bool {
        let object = unsafe { NativeObject::from_handle(handle) };
        let mut recorded = lock(&self.recorded);
        self.check_context(&mut recorded);
        recorded.protected.push((object.label().to_string(), fd));
        self.protect_result.load(Ordering::SeqCst)
    }

    fn deliver_result(&self, handle: ObjectHandle, data: &str) {
        let object = unsafe { NativeObject::from_handle(handle) };
        {
            let mut recorded = lock(&self.recorded);
            self.check_context(&mut recorded);
            recorded
                .delivered
                .push((object.label().to_string(), data.to_string()));
        }
        object.deliver(data);
        if self.throw_on_deliver.load(Ordering::SeqCst) {
            self.raise_exception();
        }
    }

    fn clear_pending_exception(&self) {
        let cleared = PENDING_EXCEPTION.with(|pending| pending.borrow_mut().remove(&self.id));
        if cleared {
            lock(&self.recorded).counters.exceptions_cleared += 1;
        }
    }
}

/// The runtime installed process-wide for tests that go through the trampolines.
pub(crate) fn shared_runtime() -> &'static RecordingRuntime {
    static SHARED: OnceLock<&'static RecordingRuntime> = OnceLock::new();
    SHARED.get_or_init(|| {
        let recording: &'static RecordingRuntime = Box::leak(Box::new(RecordingRuntime::new()));
        runtime::install(recording);
        recording
    })
}
