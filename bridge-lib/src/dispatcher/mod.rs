//! Call dispatcher
//!
//! Routes a [`CallDescriptor`] to its registered [`Operation`], decodes the
//! arguments on the native side and delivers exactly one result per call:
//!
//! - sync calls return their [`Completion`] inline
//! - async calls run on the [`NativeExecutor`] and post their completion to
//!   the host port under the caller's token
//! - stream calls bind a [`StreamSink`] to the caller's token
//!
//! Panics never cross the boundary: they are captured and reported as
//! `Error::BoundaryTrap`.

mod executor;
mod registry;

pub use executor::NativeExecutor;
pub use registry::{Args, BoxFuture, Operation, OperationRegistry};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, error::SendError};

use crate::codec::{self, IntoWire, WireValue};
use crate::error::{Error, Result};
use crate::handle::HandleTable;
use crate::ops;
use crate::stream::{StreamRegistry, StreamSink};
use crate::types::{
    BridgeConfig, CallDescriptor, CallMode, Completion, CompletionToken, HostInbox, HostMessage,
    HostPort, StreamToken, STATE_INIT, STATE_RUNNING, STATE_STOPPED,
};

struct Shared {
    registry: OperationRegistry,
    handles: Arc<HandleTable>,
    /// Async calls whose completion has not been posted yet.
    inflight: DashMap<u64, String>,
    streams: StreamRegistry,
    port: HostPort,
    state: AtomicU8,
}

impl Shared {
    fn discard_all(&self, args: Vec<WireValue>) {
        for wire in args {
            codec::discard(wire, &self.handles);
        }
    }

    /// Post the completion for `token` unless one was already posted.
    fn complete(&self, token: u64, completion: Completion) {
        let Some((_, operation)) = self.inflight.remove(&token) else {
            warn!("dropping second completion for {}", CompletionToken(token));
            discard_completion(completion, &self.handles);
            return;
        };
        debug!("{} ({}) completed", CompletionToken(token), operation);
        let message = HostMessage::Completion {
            token: CompletionToken(token),
            completion,
        };
        if let Err(SendError(message)) = self.port.send(message) {
            debug!("host is gone; discarding completion for {}", CompletionToken(token));
            discard_message(message, &self.handles);
        }
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    executor: NativeExecutor,
}

impl Dispatcher {
    /// Build the native pool, register the built-in operations alongside
    /// `registry` and open the port completions are posted to.
    pub fn start(config: &BridgeConfig, registry: OperationRegistry) -> Result<(Self, HostInbox)> {
        let mut ops = OperationRegistry::new();
        ops::register_builtins(&mut ops, config);
        ops.merge(registry);

        let executor = NativeExecutor::new(config)?;
        let (port, inbox) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: ops,
            handles: HandleTable::new(),
            inflight: DashMap::new(),
            streams: StreamRegistry::default(),
            port,
            state: AtomicU8::new(STATE_INIT),
        });
        shared.state.store(STATE_RUNNING, Ordering::SeqCst);
        info!("dispatcher running with {} operations", shared.registry.len());
        Ok((Self { shared, executor }, inbox))
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.shared.handles
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.shared.registry
    }

    pub fn state(&self) -> u8 {
        self.shared.state.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.state() == STATE_RUNNING
    }

    /// Async calls still waiting for their completion to be posted.
    pub fn in_flight(&self) -> usize {
        self.shared.inflight.len()
    }

    pub fn open_streams(&self) -> usize {
        self.shared.streams.open()
    }

    /// Route `desc` by its mode. Sync calls return their completion; async
    /// and stream calls return `None` and report through the host port.
    pub fn dispatch(&self, desc: CallDescriptor) -> Result<Option<Completion>> {
        match desc.mode {
            CallMode::Sync => self.call_sync(desc).map(Some),
            CallMode::Async => self.call_async(desc).map(|_| None),
            CallMode::Stream => self.open_stream(desc).map(|_| None),
        }
    }

    /// Look up the operation for `desc`, releasing the arguments' handle
    /// shares if the call is rejected before it starts.
    fn resolve(&self, desc: &mut CallDescriptor) -> Result<Operation> {
        let found = if self.is_running() {
            match self.shared.registry.get(&desc.operation_id) {
                None => Err(Error::UnknownOperation(desc.operation_id.clone())),
                Some(op) if !op.supports(desc.mode) => Err(Error::ModeMismatch {
                    operation: desc.operation_id.clone(),
                    mode: desc.mode,
                }),
                Some(op) => Ok(op.clone()),
            }
        } else {
            Err(Error::NotRunning)
        };
        found.map_err(|e| self.reject(desc, e))
    }

    fn reject(&self, desc: &mut CallDescriptor, e: Error) -> Error {
        error!("rejected {} call to `{}`: {}", desc.mode, desc.operation_id, e);
        self.shared.discard_all(std::mem::take(&mut desc.args));
        e
    }

    fn required_token(&self, desc: &mut CallDescriptor) -> Result<u64> {
        match desc.token {
            Some(token) => Ok(token),
            None => {
                let e = Error::runtime(format!("{} call without a token", desc.mode));
                Err(self.reject(desc, e))
            }
        }
    }

    /// Run a sync operation on the calling thread.
    pub fn call_sync(&self, mut desc: CallDescriptor) -> Result<Completion> {
        let op = self.resolve(&mut desc)?;
        let Operation::Sync(handler) = op else {
            return Err(self.reject(&mut desc, Error::runtime("operation is not sync")));
        };
        let operation = desc.operation_id;
        let args = Args::new(&operation, desc.args, Arc::clone(&self.shared.handles));
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(args))).unwrap_or_else(|payload| {
            let message = executor::panic_message(payload.as_ref());
            error!("`{}` panicked: {}", operation, message);
            Err(Error::trap(&operation, message))
        });
        Ok(into_completion(result))
    }

    /// Start an async call whose completion is posted under `desc.token`.
    pub fn call_async(&self, mut desc: CallDescriptor) -> Result<CompletionToken> {
        let token = self.required_token(&mut desc)?;
        let op = self.resolve(&mut desc)?;
        match self.shared.inflight.entry(token) {
            Entry::Occupied(_) => return Err(self.reject(&mut desc, Error::TokenInUse(token))),
            Entry::Vacant(slot) => {
                slot.insert(desc.operation_id.clone());
            }
        }

        let operation = desc.operation_id;
        let args = Args::new(&operation, desc.args, Arc::clone(&self.shared.handles));
        let shared = Arc::clone(&self.shared);
        let on_done = move |result: Result<WireValue>| shared.complete(token, into_completion(result));
        debug!("{} ({}) started", CompletionToken(token), operation);

        match op {
            Operation::Sync(handler) => {
                self.executor
                    .spawn_blocking_guarded(operation, move || handler(args), on_done)
            }
            Operation::Async(handler) => {
                // Building the future runs user code too.
                match panic::catch_unwind(AssertUnwindSafe(|| handler(args))) {
                    Ok(fut) => self.executor.spawn_guarded(operation, fut, on_done),
                    Err(payload) => {
                        let message = executor::panic_message(payload.as_ref());
                        error!("`{}` panicked: {}", operation, message);
                        on_done(Err(Error::trap(&operation, message)));
                    }
                }
            }
            Operation::Stream(_) | Operation::BindStream(_) => {
                // `resolve` never lets a stream operation through in async mode.
                self.shared.complete(
                    token,
                    Completion::Failed(Error::ModeMismatch {
                        operation,
                        mode: CallMode::Async,
                    }),
                );
            }
        }
        Ok(CompletionToken(token))
    }

    /// Bind a sink to `desc.token` and start the stream producer.
    ///
    /// A bind-stream handler runs here on the calling thread, and its error
    /// is returned instead of being delivered as the terminal event.
    pub fn open_stream(&self, mut desc: CallDescriptor) -> Result<StreamToken> {
        let token = self.required_token(&mut desc)?;
        let (handler, inline) = match self.resolve(&mut desc)? {
            Operation::Stream(handler) => (handler, false),
            Operation::BindStream(handler) => (handler, true),
            _ => return Err(self.reject(&mut desc, Error::runtime("operation is not a stream"))),
        };

        let operation = desc.operation_id;
        let sink = StreamSink::new(
            StreamToken(token),
            &operation,
            self.shared.port.clone(),
            Arc::clone(&self.shared.handles),
        );
        if let Err(e) = self.shared.streams.insert(&sink) {
            sink.detach();
            error!("rejected stream call to `{}`: {}", operation, e);
            self.shared.discard_all(desc.args);
            return Err(e);
        }

        let args = Args::new(&operation, desc.args, Arc::clone(&self.shared.handles));
        let producer = sink.clone();
        if inline {
            let bound = panic::catch_unwind(AssertUnwindSafe(|| handler(args, producer)))
                .unwrap_or_else(|payload| {
                    let message = executor::panic_message(payload.as_ref());
                    error!("`{}` panicked: {}", operation, message);
                    Err(Error::trap(&operation, message))
                });
            if let Err(e) = bound {
                self.shared.streams.detach(token);
                sink.detach();
                error!("stream `{}` refused to open: {}", operation, e);
                return Err(e);
            }
            debug!("{} ({}) bound", StreamToken(token), operation);
            return Ok(StreamToken(token));
        }

        debug!("{} ({}) opened", StreamToken(token), operation);
        self.executor.spawn_blocking_guarded(
            operation,
            move || handler(args, producer),
            move |result| {
                if let Err(e) = result {
                    sink.close_with(e);
                }
            },
        );
        Ok(StreamToken(token))
    }

    /// The host lost interest in `token`; stop delivering its values.
    pub fn detach_stream(&self, token: StreamToken) -> bool {
        self.shared.streams.detach(token.0)
    }

    /// Reject new calls, close every open stream and post
    /// [`HostMessage::Stopped`]. Calls already running still post their
    /// completion.
    pub fn shutdown(&self) {
        if self.shared.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return;
        }
        self.shared.streams.close_all();
        // Nobody may be listening any more.
        let _ = self.shared.port.send(HostMessage::Stopped);
        info!(
            "dispatcher stopped with {} calls in flight and {} live handles",
            self.in_flight(),
            self.shared.handles.live()
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A `LogicError` is data, not a failure of the call itself.
fn into_completion(result: Result<WireValue>) -> Completion {
    match result {
        Ok(value) => Completion::Value(value),
        Err(Error::Logic(e)) => match e.into_wire() {
            Ok(wire) => Completion::LogicFailure(wire),
            Err(e) => Completion::Failed(e),
        },
        Err(e) => Completion::Failed(e),
    }
}

pub(crate) fn discard_completion(completion: Completion, handles: &HandleTable) {
    match completion {
        Completion::Value(wire) | Completion::LogicFailure(wire) => codec::discard(wire, handles),
        Completion::Failed(_) => {}
    }
}

pub(crate) fn discard_message(message: HostMessage, handles: &HandleTable) {
    match message {
        HostMessage::Completion { completion, .. } => discard_completion(completion, handles),
        HostMessage::Stream { event, .. } => {
            if let crate::types::StreamEvent::Item(wire) = event {
                codec::discard(wire, handles);
            }
        }
        HostMessage::Stopped => {}
    }
}
