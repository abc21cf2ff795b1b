//! Operations every bridge exposes regardless of what the application
//! registers.

use anyhow::format_err;

use crate::dispatcher::OperationRegistry;
use crate::error::Result;
use crate::logger;
use crate::types::BridgeConfig;

/// Stream: binds the host's log subscriber. Takes an optional filter that
/// overrides `rust_log` from the config. Under the `reject` re-open policy a
/// second open fails with `StreamAlreadyOpen`.
pub const INIT_RUST_LOG_STREAM: &str = "init_rust_log_stream";
/// Sync: always panics, so hosts can test their trap handling.
pub const DEBUG_UNCONDITIONAL_PANIC: &str = "debug_unconditional_panic";
/// Sync: always fails with a logic error.
pub const DEBUG_UNCONDITIONAL_ERROR: &str = "debug_unconditional_error";

pub(crate) fn register_builtins(registry: &mut OperationRegistry, config: &BridgeConfig) {
    let policy = config.streams.reopen;
    let default_filter = config.rust_log.clone();

    registry
        .register_bind_stream(INIT_RUST_LOG_STREAM, move |mut args, sink| {
            let rust_log: Option<String> = match args.remaining() {
                0 => None,
                _ => args.next()?,
            };
            args.finish()?;
            logger::init(sink, rust_log.as_deref().unwrap_or(&default_filter), policy)
        })
        .register_sync(DEBUG_UNCONDITIONAL_PANIC, |args| -> Result<()> {
            args.finish()?;
            panic!("Panic inside native code");
        })
        .register_sync(DEBUG_UNCONDITIONAL_ERROR, |args| -> Result<()> {
            args.finish()?;
            Err(format_err!("Error inside native code").into())
        });
}
