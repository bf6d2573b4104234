//! JVM bindings for `io.github.stelliberty.android.clash_core.ClashCoreBridge`
//!
//! Handles given to the core are boxed [`GlobalRef`]s. Every command error is
//! thrown to Kotlin as `java.lang.IllegalStateException`.

use std::ffi::{c_int, c_void};

use jni::errors::{Error as JniCallError, JniError};
use jni::objects::{GlobalRef, JObject, JString};
use jni::signature::{Primitive, ReturnType};
use jni::sys::{jboolean, jint, jstring, jvalue, JNI_ERR, JNI_FALSE, JNI_TRUE, JNI_VERSION_1_6};
use jni::{JNIEnv, JavaVM};

use crate::config::{BridgeConfig, JniConfig};
use crate::error::{BridgeError, Result};
use crate::marshal::{HandleSource, ObjectHandle};
use crate::runtime::{self, ManagedRuntime, ThreadStatus};

/// [`ManagedRuntime`] backed by the hosting JVM
pub struct JniRuntime {
    vm: JavaVM,
    protect: jni::objects::JMethodID,
    on_result: jni::objects::JMethodID,
}

// Method IDs stay valid for the lifetime of their class and may be used from any thread.
unsafe impl Send for JniRuntime {}
unsafe impl Sync for JniRuntime {}

impl JniRuntime {
    /// Look up the protect and result methods named by `config`.
    pub fn new(vm: JavaVM, env: &mut JNIEnv, config: &JniConfig) -> Result<Self> {
        let protect = lookup_method(
            env,
            &config.vpn_service_class,
            &config.protect_method,
            &config.protect_signature,
        )?;
        let on_result = lookup_method(
            env,
            &config.result_callback_class,
            &config.result_method,
            &config.result_signature,
        )?;
        Ok(Self {
            vm,
            protect,
            on_result,
        })
    }

    fn env(&self) -> Option<JNIEnv<'_>> {
        match self.vm.get_env() {
            Ok(env) => Some(env),
            Err(err) => {
                log::warn!("no JNI environment on this thread: {err}");
                None
            }
        }
    }

    unsafe fn object(handle: ObjectHandle) -> &'static GlobalRef {
        handle.as_ref::<GlobalRef>()
    }
}

fn lookup_method(
    env: &mut JNIEnv,
    class: &str,
    name: &str,
    signature: &str,
) -> Result<jni::objects::JMethodID> {
    env.get_method_id(class, name, signature).map_err(|err| {
        clear_exception(env);
        BridgeError::Configuration(format!("{class}.{name}{signature} not found: {err}"))
    })
}

fn clear_exception(env: &mut JNIEnv) {
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_describe();
        let _ = env.exception_clear();
    }
}

impl ManagedRuntime for JniRuntime {
    fn thread_status(&self) -> ThreadStatus {
        match self.vm.get_env() {
            Ok(_) => ThreadStatus::Attached,
            Err(JniCallError::JniCall(JniError::ThreadDetached)) => ThreadStatus::Detached,
            Err(err) => {
                log::warn!("JNI environment unavailable: {err}");
                ThreadStatus::Unavailable
            }
        }
    }

    fn attach_current_thread(&self) -> Result<()> {
        self.vm
            .attach_current_thread_permanently()
            .map(|_| ())
            .map_err(|err| BridgeError::Attach(err.to_string()))
    }

    fn detach_current_thread(&self) {
        // Only the guard that attached this thread calls here, and it holds no local references.
        unsafe { self.vm.detach_current_thread() };
    }

    fn release(&self, handle: ObjectHandle) {
        drop(unsafe { handle.into_box::<GlobalRef>() });
    }

    fn protect_socket(&self, handle: ObjectHandle, fd: c_int) -> bool {
        let Some(mut env) = self.env() else {
            return false;
        };
        let service = unsafe { Self::object(handle) };
        let answer = unsafe {
            env.call_method_unchecked(
                service.as_obj(),
                self.protect,
                ReturnType::Primitive(Primitive::Boolean),
                &[jvalue { i: fd }],
            )
        };
        match answer.and_then(|value| value.z()) {
            Ok(protected) => protected,
            Err(err) => {
                log::error!("VpnService.protect({fd}) failed: {err}");
                false
            }
        }
    }

    fn deliver_result(&self, handle: ObjectHandle, data: &str) {
        let Some(mut env) = self.env() else {
            return;
        };
        let callback = unsafe { Self::object(handle) };
        let text = match env.new_string(data) {
            Ok(text) => text,
            Err(err) => {
                log::error!("failed to create result string: {err}");
                return;
            }
        };
        let delivered = unsafe {
            env.call_method_unchecked(
                callback.as_obj(),
                self.on_result,
                ReturnType::Primitive(Primitive::Void),
                &[jvalue { l: text.as_raw() }],
            )
        };
        if let Err(err) = delivered {
            log::error!("result callback failed: {err}");
        }
        let _ = env.delete_local_ref(text);
    }

    fn clear_pending_exception(&self) {
        if let Some(mut env) = self.env() {
            clear_exception(&mut env);
        }
    }
}

/// A possibly-null Java object to hand to the core
struct JniObject<'a, 'local> {
    env: &'a JNIEnv<'local>,
    object: &'a JObject<'local>,
}

impl HandleSource for JniObject<'_, '_> {
    fn is_absent(&self) -> bool {
        self.object.is_null()
    }

    fn into_handle(self) -> Result<ObjectHandle> {
        let global = self
            .env
            .new_global_ref(self.object)
            .map_err(|err| BridgeError::HandleCreation(err.to_string()))?;
        Ok(ObjectHandle::from_box(Box::new(global)))
    }
}

fn get_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    if value.is_null() {
        return None;
    }
    env.get_string(value).ok().map(Into::into)
}

fn throw(env: &mut JNIEnv, err: &BridgeError) {
    log::error!("{err}");
    clear_exception(env);
    if let Err(throw_err) = env.throw_new("java/lang/IllegalStateException", err.to_string()) {
        log::error!("failed to throw IllegalStateException: {throw_err}");
    }
}

fn new_jstring(env: &mut JNIEnv, value: &str) -> jstring {
    match env.new_string(value) {
        Ok(text) => text.into_raw(),
        Err(err) => {
            log::error!("failed to create Java string: {err}");
            std::ptr::null_mut()
        }
    }
}

/// Record the JVM, resolve the callback methods and install the runtime.
#[no_mangle]
pub extern "system" fn JNI_OnLoad(vm: *mut jni::sys::JavaVM, _reserved: *mut c_void) -> jint {
    let config = BridgeConfig::default();
    if let Err(err) = crate::logging::init_platform(&config.logging.level) {
        eprintln!("JNI_OnLoad: logging disabled: {err}");
    }

    let Ok(vm) = (unsafe { JavaVM::from_raw(vm) }) else {
        return JNI_ERR;
    };
    let mut env = match vm.get_env() {
        Ok(env) => env,
        Err(err) => {
            log::error!("JNI_OnLoad: no environment: {err}");
            return JNI_ERR;
        }
    };
    // Method lookups need a live env, the runtime owns its own JavaVM handle.
    let owned_vm = match env.get_java_vm() {
        Ok(owned_vm) => owned_vm,
        Err(err) => {
            log::error!("JNI_OnLoad: {err}");
            return JNI_ERR;
        }
    };

    match JniRuntime::new(owned_vm, &mut env, &config.jni) {
        Ok(jni_runtime) => {
            runtime::install(Box::leak(Box::new(jni_runtime)));
            JNI_VERSION_1_6
        }
        Err(err) => {
            log::error!("JNI_OnLoad: {err}");
            JNI_ERR
        }
    }
}

fn to_jboolean(value: bool) -> jboolean {
    if value {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeInit(
    mut env: JNIEnv,
    _this: JObject,
    core_path: JString,
) {
    let Some(path) = get_string(&mut env, &core_path) else {
        throw(
            &mut env,
            &BridgeError::Configuration("core path is null".to_string()),
        );
        return;
    };
    if let Err(err) = crate::core::global().init(path) {
        throw(&mut env, &err);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeStartTun(
    mut env: JNIEnv,
    _this: JObject,
    fd: jint,
    vpn_service: JObject,
    stack: JString,
    address: JString,
    dns: JString,
) -> jboolean {
    let stack = get_string(&mut env, &stack);
    let address = get_string(&mut env, &address);
    let dns = get_string(&mut env, &dns);

    let service = JniObject {
        env: &env,
        object: &vpn_service,
    };
    let started = crate::core::global().start_tun(
        fd,
        service,
        stack.as_deref(),
        address.as_deref(),
        dns.as_deref(),
    );
    match started {
        Ok(ok) => to_jboolean(ok),
        Err(err) => {
            throw(&mut env, &err);
            JNI_FALSE
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeStopTun(
    mut env: JNIEnv,
    _this: JObject,
) {
    if let Err(err) = crate::core::global().stop_tun() {
        throw(&mut env, &err);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeInvokeAction(
    mut env: JNIEnv,
    _this: JObject,
    data: JString,
    callback: JObject,
) {
    let data = get_string(&mut env, &data);
    let callback = JniObject {
        env: &env,
        object: &callback,
    };
    if let Err(err) = crate::core::global().invoke_action(data.as_deref(), callback) {
        throw(&mut env, &err);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeSetEventListener(
    mut env: JNIEnv,
    _this: JObject,
    listener: JObject,
) {
    let listener = JniObject {
        env: &env,
        object: &listener,
    };
    if let Err(err) = crate::core::global().set_event_listener(listener) {
        throw(&mut env, &err);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeSuspend(
    mut env: JNIEnv,
    _this: JObject,
    suspended: jboolean,
) {
    if let Err(err) = crate::core::global().suspend(suspended == JNI_TRUE) {
        throw(&mut env, &err);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeForceGc(
    mut env: JNIEnv,
    _this: JObject,
) {
    if let Err(err) = crate::core::global().force_gc() {
        throw(&mut env, &err);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeUpdateDns(
    mut env: JNIEnv,
    _this: JObject,
    dns: JString,
) {
    let dns = get_string(&mut env, &dns);
    if let Err(err) = crate::core::global().update_dns(dns.as_deref()) {
        throw(&mut env, &err);
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeGetTraffic(
    mut env: JNIEnv,
    _this: JObject,
    only_statistics_proxy: jboolean,
) -> jstring {
    match crate::core::global().get_traffic(only_statistics_proxy == JNI_TRUE) {
        Ok(traffic) => new_jstring(&mut env, &traffic),
        Err(err) => {
            throw(&mut env, &err);
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_io_github_stelliberty_android_clash_1core_ClashCoreBridge_nativeGetTotalTraffic(
    mut env: JNIEnv,
    _this: JObject,
    only_statistics_proxy: jboolean,
) -> jstring {
    match crate::core::global().get_total_traffic(only_statistics_proxy == JNI_TRUE) {
        Ok(traffic) => new_jstring(&mut env, &traffic),
        Err(err) => {
            throw(&mut env, &err);
            std::ptr::null_mut()
        }
    }
}
