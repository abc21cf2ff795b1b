#[cfg(test)]
#[macro_use]
mod tests;

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod host;
pub mod logger;
pub mod ops;
pub mod stream;
pub mod types;

// JNI bridge for Android
#[cfg(all(feature = "jni-bridge", target_os = "android"))]
pub mod jni_bridge;

use std::path::Path;

use log::{info, warn};

pub use dispatcher::{Args, Dispatcher, OperationRegistry};
pub use error::{Error, Result};
pub use handle::{HandleRef, HandleTable, OpaqueHandle};
pub use host::{EventLoop, Host, PendingCall, Subscription};
pub use stream::StreamSink;
pub use types::{load_config, BridgeConfig, HostInbox};

/// Start a bridge serving `registry` plus the built-in operations.
pub fn start(config: &BridgeConfig, registry: OperationRegistry) -> Result<(Host, EventLoop)> {
    let (dispatcher, inbox) = Dispatcher::start(config, registry)?;
    Ok(Host::new(dispatcher, inbox))
}

/// Like [`start`], with the config loaded from a TOML file.
pub fn start_from_path<P: AsRef<Path>>(
    path: P,
    registry: OperationRegistry,
) -> Result<(Host, EventLoop)> {
    let config = load_config(path)?;
    start(&config, registry)
}

/// Start a dispatcher for a host that drains the port itself. The config is
/// loaded from `config_path`, or defaulted when the path is empty. Nothing
/// global is touched, so a failed start can simply be retried.
pub fn start_dispatcher(
    config_path: &str,
    registry: OperationRegistry,
) -> Result<(Dispatcher, HostInbox)> {
    let config = if config_path.is_empty() {
        warn!("No config path given, using defaults");
        BridgeConfig::default()
    } else {
        info!("Loading config from: {}", config_path);
        load_config(config_path)?
    };
    Dispatcher::start(&config, registry)
}
