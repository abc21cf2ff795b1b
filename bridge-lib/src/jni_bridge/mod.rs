//! JNI bridge for Android
//!
//! Exposes the dispatcher to a JVM host. Arguments and results cross as
//! framed byte arrays (see `codec::encode_frame`).
//!
//! ## Architecture
//!
//! - `types`: Global state management using OnceLock pattern
//! - `lifecycle`: Init/status/shutdown
//! - `calls`: Sync, async and stream calls plus handle shares
//! - `callbacks`: Delivery thread forwarding completions and stream events
//!
//! ## State Machine
//!
//! - 0 (INIT): Not initialized
//! - 1 (RUNNING): Accepting calls
//! - 2 (STOPPED): Shut down
//!
//! ## Thread Model
//!
//! - Sync calls run on the calling Java thread
//! - Async calls and stream producers run on the native pool
//! - One delivery thread stays attached to the JVM and invokes the callback

pub mod callbacks;
pub mod calls;
pub mod lifecycle;
pub mod types;

pub use calls::{
    Java_com_appbridge_BridgeNative_nativeCallAsync, Java_com_appbridge_BridgeNative_nativeCallSync,
    Java_com_appbridge_BridgeNative_nativeCloseStream,
    Java_com_appbridge_BridgeNative_nativeDropHandle,
    Java_com_appbridge_BridgeNative_nativeOpenStream,
    Java_com_appbridge_BridgeNative_nativeShareHandle,
};
pub use lifecycle::{
    Java_com_appbridge_BridgeNative_nativeGetStatus, Java_com_appbridge_BridgeNative_nativeInit,
    Java_com_appbridge_BridgeNative_nativeShutdown,
};
pub use types::install_operations;
