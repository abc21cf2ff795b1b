//! JVM callback implementations
//!
//! A dedicated delivery thread drains the host port and forwards each
//! message to the Java callback:
//!
//! - `void onCompletion(long token, byte[] envelope)`
//! - `void onStreamEvent(long token, byte[] envelope)`

use super::types::{CALLBACK, DISPATCHER, JAVA_VM};
use crate::codec::{completion_envelope, encode_frame, stream_envelope};
use crate::dispatcher::discard_message;
use crate::types::{HostInbox, HostMessage};
use jni::objects::JValue;
use log::{error, info};

/// Spawn the delivery thread
pub fn spawn_delivery(inbox: HostInbox) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("bridge-delivery".to_owned())
        .spawn(move || deliver_loop(inbox))
        .map(|_| ())
}

/// Once an envelope reaches the JVM its handle shares belong to the Java
/// side; they are released here only if delivery fails.
fn deliver_loop(mut inbox: HostInbox) {
    info!("delivery thread started");
    while let Some(message) = inbox.blocking_recv() {
        if let Err(e) = deliver(&message) {
            error!("Failed to deliver message to JVM: {}", e);
            if let Some(dispatcher) = DISPATCHER.get() {
                discard_message(message, dispatcher.handles());
            }
        }
    }
    info!("delivery thread finished");
}

fn deliver(message: &HostMessage) -> Result<(), Box<dyn std::error::Error>> {
    let vm = JAVA_VM.get().ok_or("JavaVM not initialized")?;
    let callback = CALLBACK.get().ok_or("Callback not set")?;

    // Stays attached for the lifetime of the thread
    let mut env = vm.attach_current_thread_permanently()?;

    let (method, token, envelope) = match message {
        HostMessage::Completion { token, completion } => {
            ("onCompletion", token.0, completion_envelope(completion))
        }
        HostMessage::Stream { token, event } => {
            ("onStreamEvent", token.0, stream_envelope(event))
        }
        // Calls still running after shutdown keep delivering.
        HostMessage::Stopped => return Ok(()),
    };
    let bytes = env.byte_array_from_slice(&encode_frame(&envelope)?)?;

    env.call_method(
        callback.as_obj(),
        method,
        "(J[B)V",
        &[JValue::Long(token as i64), JValue::Object(&bytes)],
    )?;
    env.delete_local_ref(bytes)?;

    Ok(())
}
