use std::any::Any;
use std::future::Future;

use log::{error, info};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinError;

use crate::error::{Error, Result};
use crate::types::BridgeConfig;

/// The native thread pool async calls and stream producers run on.
pub struct NativeExecutor {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl NativeExecutor {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()
            .map_err(Error::runtime)?;
        info!(
            "native pool started with {} `{}` threads",
            config.worker_threads, config.thread_name
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Drive `fut` on the pool and hand its outcome to `on_done`, with a
    /// panic inside `fut` turned into a boundary trap.
    pub fn spawn_guarded<T, F, D>(&self, operation: String, fut: F, on_done: D)
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
        D: FnOnce(Result<T>) + Send + 'static,
    {
        let task = self.handle.spawn(fut);
        self.handle.spawn(async move {
            on_done(task.await.unwrap_or_else(|e| joined(&operation, e)));
        });
    }

    /// Like [`spawn_guarded`](Self::spawn_guarded) for blocking work.
    pub fn spawn_blocking_guarded<T, F, D>(&self, operation: String, work: F, on_done: D)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
        D: FnOnce(Result<T>) + Send + 'static,
    {
        let task = self.handle.spawn_blocking(work);
        self.handle.spawn(async move {
            on_done(task.await.unwrap_or_else(|e| joined(&operation, e)));
        });
    }
}

impl Drop for NativeExecutor {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics when it happens inside
        // another runtime's context.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn joined<T>(operation: &str, e: JoinError) -> Result<T> {
    if e.is_panic() {
        let message = panic_message(e.into_panic().as_ref());
        error!("`{}` panicked: {}", operation, message);
        Err(Error::trap(operation, message))
    } else {
        Err(Error::runtime(format!("`{}` was cancelled", operation)))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
