//! Call entry points for JNI bridge
//!
//! Arguments arrive as one framed list value. Sync calls return a framed
//! completion envelope; async and stream calls return whether they were
//! accepted and report through the delivery callback.

use super::types::*;
use crate::codec::{completion_envelope, decode_frame, discard, encode_frame, WireValue};
use crate::dispatcher::{discard_completion, Dispatcher};
use crate::error::{DecodeError, Error, Result};
use crate::handle::HandleRef;
use crate::types::{CallDescriptor, Completion, CompletionToken, StreamToken};
use jni::objects::{JByteArray, JClass, JString};
use jni::sys::{jboolean, jbyteArray, jlong, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;
use log::error;
use std::ptr;

fn dispatcher() -> Result<&'static Dispatcher> {
    DISPATCHER.get().ok_or(Error::NotRunning)
}

/// Read the operation id and the framed argument list.
fn read_call(
    env: &mut JNIEnv,
    operation: &JString,
    args: &JByteArray,
) -> Result<(String, Vec<WireValue>)> {
    let operation: String = env.get_string(operation).map_err(Error::runtime)?.into();
    let bytes = env.convert_byte_array(args).map_err(Error::runtime)?;
    match decode_frame(&bytes)? {
        WireValue::List(args) => Ok((operation, args)),
        other => {
            let found = other.kind();
            if let Ok(dispatcher) = dispatcher() {
                discard(other, dispatcher.handles());
            }
            Err(DecodeError::mismatch("argument list", found).into())
        }
    }
}

fn to_jbytes(env: &mut JNIEnv, value: &WireValue) -> Result<jbyteArray> {
    let framed = encode_frame(value)?;
    let bytes = env.byte_array_from_slice(&framed).map_err(Error::runtime)?;
    Ok(bytes.into_raw())
}

/// JNI: Invoke a sync operation
///
/// Returns the framed completion envelope, or null if it could not be built.
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeCallSync(
    mut env: JNIEnv,
    _class: JClass,
    operation: JString,
    args: JByteArray,
) -> jbyteArray {
    let completion = dispatcher()
        .and_then(|dispatcher| {
            let (operation, args) = read_call(&mut env, &operation, &args)?;
            dispatcher.call_sync(CallDescriptor::sync(operation, args))
        })
        .unwrap_or_else(Completion::Failed);
    match to_jbytes(&mut env, &completion_envelope(&completion)) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to return completion: {}", e);
            if let Ok(dispatcher) = dispatcher() {
                discard_completion(completion, dispatcher.handles());
            }
            ptr::null_mut()
        }
    }
}

/// JNI: Start an async call; its completion is delivered to `onCompletion`
/// under `token`.
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeCallAsync(
    mut env: JNIEnv,
    _class: JClass,
    operation: JString,
    args: JByteArray,
    token: jlong,
) -> jboolean {
    let started = dispatcher().and_then(|dispatcher| {
        let (operation, args) = read_call(&mut env, &operation, &args)?;
        dispatcher.call_async(CallDescriptor::asynchronous(
            operation,
            args,
            CompletionToken(token as u64),
        ))
    });
    match started {
        Ok(_) => JNI_TRUE,
        Err(e) => {
            error!("Failed to start async call: {}", e);
            JNI_FALSE
        }
    }
}

/// JNI: Open a stream; its values are delivered to `onStreamEvent` under
/// `token`.
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeOpenStream(
    mut env: JNIEnv,
    _class: JClass,
    operation: JString,
    args: JByteArray,
    token: jlong,
) -> jboolean {
    let opened = dispatcher().and_then(|dispatcher| {
        let (operation, args) = read_call(&mut env, &operation, &args)?;
        dispatcher.open_stream(CallDescriptor::stream(operation, args, StreamToken(token as u64)))
    });
    match opened {
        Ok(_) => JNI_TRUE,
        Err(e) => {
            error!("Failed to open stream: {}", e);
            JNI_FALSE
        }
    }
}

/// JNI: Stop delivering a stream the Java side no longer listens to
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeCloseStream(
    _env: JNIEnv,
    _class: JClass,
    token: jlong,
) -> jboolean {
    match dispatcher() {
        Ok(dispatcher) if dispatcher.detach_stream(StreamToken(token as u64)) => JNI_TRUE,
        _ => JNI_FALSE,
    }
}

/// JNI: Add a share for a handle embedded in a second Java object
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeShareHandle(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    let shared = dispatcher()
        .and_then(|dispatcher| dispatcher.handles().share(HandleRef::from_bits(handle as u64)));
    match shared {
        Ok(_) => JNI_TRUE,
        Err(e) => {
            error!("Failed to share handle: {}", e);
            JNI_FALSE
        }
    }
}

/// JNI: Release one share; called by `dispose()` and by the Java `Cleaner`
#[no_mangle]
pub extern "C" fn Java_com_appbridge_BridgeNative_nativeDropHandle(
    _env: JNIEnv,
    _class: JClass,
    handle: jlong,
) -> jboolean {
    let released = dispatcher()
        .and_then(|dispatcher| dispatcher.handles().release(HandleRef::from_bits(handle as u64)));
    match released {
        Ok(_) => JNI_TRUE,
        Err(e) => {
            error!("Failed to drop handle: {}", e);
            JNI_FALSE
        }
    }
}
