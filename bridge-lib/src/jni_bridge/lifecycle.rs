//! Lifecycle management for JNI bridge
//!
//! Implements init/status/shutdown.

use super::callbacks::spawn_delivery;
use super::types::*;
use crate::error::{Error, Result};
use crate::logger;
use crate::types::STATE_STOPPED;
use jni::objects::{JClass, JObject, JString};
use jni::sys::{jboolean, jint, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::{error, info, warn, LevelFilter};

/// JNI: Initialize the bridge
///
/// - Loads the TOML config (an empty path means defaults)
/// - Starts the native pool and dispatcher with the installed operations
/// - Keeps `callback` and starts the delivery thread that invokes it
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeInit(
    mut env: JNIEnv,
    _class: JClass,
    config_path_jstr: JString,
    callback: JObject,
) -> jboolean {
    // Check if already initialized
    if is_initialized() {
        error!("Already initialized!");
        return JNI_FALSE;
    }

    // Logcat first so the remaining steps can report failures. The bridge
    // logger owns the global slot and feeds both logcat and the log stream.
    let logcat = android_logger::AndroidLogger::new(
        android_logger::Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("app-bridge"),
    );
    logger::tee(Box::new(logcat), LevelFilter::Debug);

    let config_path: String = match env.get_string(&config_path_jstr) {
        Ok(s) => s.into(),
        Err(e) => {
            error!("Failed to get config path: {}", e);
            return JNI_FALSE;
        }
    };

    // Everything that can fail on bad input happens before any global is
    // stored, so the host may fix its config and call init again.
    let (dispatcher, inbox) = match crate::start_dispatcher(&config_path, installed_operations()) {
        Ok(started) => started,
        Err(e) => {
            error!("Failed to start dispatcher: {}", e);
            return JNI_FALSE;
        }
    };

    if let Err(e) = keep_callback(&mut env, callback) {
        error!("Failed to keep delivery callback: {}", e);
        return JNI_FALSE;
    }

    if let Err(e) = spawn_delivery(inbox) {
        error!("Failed to spawn delivery thread: {}", e);
        return JNI_FALSE;
    }

    if DISPATCHER.set(dispatcher).is_err() {
        error!("Dispatcher was initialized concurrently");
        return JNI_FALSE;
    }

    info!("Bridge initialized");
    JNI_TRUE
}

/// Store the VM and a global ref to `callback` for the delivery thread.
fn keep_callback(env: &mut JNIEnv, callback: JObject) -> Result<()> {
    let vm = env
        .get_java_vm()
        .map_err(|e| Error::runtime(format!("no JavaVM: {}", e)))?;
    let callback = env
        .new_global_ref(callback)
        .map_err(|e| Error::runtime(format!("global ref: {}", e)))?;
    if JAVA_VM.set(vm).is_err() || CALLBACK.set(callback).is_err() {
        return Err(Error::runtime("callback already stored"));
    }
    Ok(())
}

/// JNI: Get current state (0 = INIT, 1 = RUNNING, 2 = STOPPED)
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeGetStatus(
    _env: JNIEnv,
    _class: JClass,
) -> jint {
    get_state() as jint
}

/// JNI: Shut down the bridge
///
/// New calls are rejected; calls already running still deliver their
/// completion. The bridge cannot be re-initialized in the same process.
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeShutdown(
    _env: JNIEnv,
    _class: JClass,
) -> jboolean {
    let Some(dispatcher) = DISPATCHER.get() else {
        warn!("Shutdown before init");
        return JNI_FALSE;
    };
    if dispatcher.state() == STATE_STOPPED {
        warn!("Already stopped");
        return JNI_FALSE;
    }
    dispatcher.shutdown();
    info!("Bridge stopped");
    JNI_TRUE
}
