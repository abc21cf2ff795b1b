//! Global state management for JNI bridge
//!
//! Uses OnceLock for thread-safe singletons; the state values are shared
//! with the dispatcher (`crate::types::STATE_*`).

use crate::dispatcher::{Dispatcher, OperationRegistry};
use crate::types::{STATE_INIT, STATE_RUNNING};
use jni::objects::GlobalRef;
use jni::JavaVM;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Global dispatcher
pub static DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();

/// Global JavaVM for callbacks
pub static JAVA_VM: OnceLock<JavaVM> = OnceLock::new();

/// Global delivery callback
pub static CALLBACK: OnceLock<GlobalRef> = OnceLock::new();

/// Operations registered by the embedding application before `nativeInit`
static OPERATIONS: Mutex<Option<OperationRegistry>> = Mutex::new(None);

/// Register the application's operations. Call from `JNI_OnLoad`, before the
/// host calls `nativeInit`; returns `false` once the bridge has started.
pub fn install_operations(registry: OperationRegistry) -> bool {
    if DISPATCHER.get().is_some() {
        return false;
    }
    *OPERATIONS.lock().unwrap_or_else(PoisonError::into_inner) = Some(registry);
    true
}

/// A copy of the installed operations; kept so a failed init can retry.
pub(crate) fn installed_operations() -> OperationRegistry {
    OPERATIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_default()
}

/// Get current state
pub fn get_state() -> u8 {
    DISPATCHER.get().map_or(STATE_INIT, Dispatcher::state)
}

/// Helper to check if initialized (any state except 0)
pub fn is_initialized() -> bool {
    DISPATCHER.get().is_some()
}

/// Helper to check if running
pub fn is_running() -> bool {
    get_state() == STATE_RUNNING
}
