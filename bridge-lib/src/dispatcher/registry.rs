use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::warn;

use crate::codec::{self, FromWire, IntoWire, WireValue};
use crate::error::{DecodeError, Result};
use crate::handle::{HandleTable, OpaqueHandle};
use crate::stream::StreamSink;
use crate::types::CallMode;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type SyncFn = Arc<dyn Fn(Args) -> Result<WireValue> + Send + Sync>;
type AsyncFn = Arc<dyn Fn(Args) -> BoxFuture<Result<WireValue>> + Send + Sync>;
type StreamFn = Arc<dyn Fn(Args, StreamSink) -> Result<()> + Send + Sync>;

/// A registered native operation.
#[derive(Clone)]
pub enum Operation {
    /// Runs to completion on whichever thread calls it.
    Sync(SyncFn),
    /// Returns a future that is driven on the native pool.
    Async(AsyncFn),
    /// Emits values through a sink until it is closed.
    Stream(StreamFn),
    /// A stream whose handler only binds the sink and returns quickly. It
    /// runs on the opening thread, so its error fails the open itself.
    BindStream(StreamFn),
}

impl Operation {
    pub fn kind(&self) -> CallMode {
        match self {
            Operation::Sync(_) => CallMode::Sync,
            Operation::Async(_) => CallMode::Async,
            Operation::Stream(_) | Operation::BindStream(_) => CallMode::Stream,
        }
    }

    /// A sync operation may also be called asynchronously; it then runs on
    /// the blocking pool. Everything else must be called in its own mode.
    pub fn supports(&self, mode: CallMode) -> bool {
        matches!(
            (self, mode),
            (Operation::Sync(_), CallMode::Sync)
                | (Operation::Sync(_), CallMode::Async)
                | (Operation::Async(_), CallMode::Async)
                | (Operation::Stream(_) | Operation::BindStream(_), CallMode::Stream)
        )
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Operation::{}", self.kind())
    }
}

/// The table of operations the host may invoke, keyed by operation id.
#[derive(Clone, Default, Debug)]
pub struct OperationRegistry {
    ops: HashMap<String, Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, id: &str, op: Operation) -> &mut Self {
        if let Some(previous) = self.ops.insert(id.to_owned(), op) {
            warn!("operation `{}` re-registered, replacing {:?}", id, previous);
        }
        self
    }

    pub fn register_sync<F, R>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Args) -> Result<R> + Send + Sync + 'static,
        R: IntoWire,
    {
        let op = Operation::Sync(Arc::new(move |args| handler(args)?.into_wire()));
        self.insert(id, op)
    }

    pub fn register_async<F, Fut, R>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: IntoWire + 'static,
    {
        let op = Operation::Async(Arc::new(move |args| {
            let fut = handler(args);
            Box::pin(async move { fut.await?.into_wire() }) as BoxFuture<_>
        }));
        self.insert(id, op)
    }

    /// Register a stream operation. The handler may keep clones of the sink
    /// and keep emitting after it returns; the stream closes once every
    /// clone is dropped or [`StreamSink::close`] is called.
    pub fn register_stream<F>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Args, StreamSink) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(id, Operation::Stream(Arc::new(handler)))
    }

    /// Register a stream whose handler hands the sink to some longer-lived
    /// emitter and returns. The handler runs on the opening thread and must
    /// not block; if it fails, the open fails and no event is delivered.
    pub fn register_bind_stream<F>(&mut self, id: &str, handler: F) -> &mut Self
    where
        F: Fn(Args, StreamSink) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(id, Operation::BindStream(Arc::new(handler)))
    }

    /// Move every operation from `other` into `self`; `other` wins on
    /// conflicts.
    pub fn merge(&mut self, other: OperationRegistry) -> &mut Self {
        for (id, op) in other.ops {
            self.insert(&id, op);
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.ops.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ops.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }
}

/// The decoded-on-demand argument list of one call.
///
/// Arguments are taken in declaration order with [`next`](Self::next).
/// Handle shares carried by arguments that are never taken are released
/// when the `Args` is dropped.
pub struct Args {
    operation: String,
    values: VecDeque<WireValue>,
    taken: usize,
    handles: Arc<HandleTable>,
}

impl Args {
    pub(crate) fn new(operation: &str, values: Vec<WireValue>, handles: Arc<HandleTable>) -> Self {
        Self {
            operation: operation.to_owned(),
            values: values.into(),
            taken: 0,
            handles,
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next<T: FromWire>(&mut self) -> Result<T> {
        let wire = self
            .values
            .pop_front()
            .ok_or_else(|| DecodeError::MissingArgument {
                operation: self.operation.clone(),
                index: self.taken,
            })?;
        self.taken += 1;
        codec::decode(wire, &self.handles)
    }

    /// Fails if the host passed more arguments than were taken.
    pub fn finish(&self) -> Result<()> {
        if self.values.is_empty() {
            return Ok(());
        }
        Err(DecodeError::TooManyArguments {
            operation: self.operation.clone(),
            expected: self.taken,
            found: self.taken + self.values.len(),
        }
        .into())
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    /// Register a new native resource in the bridge's handle table.
    pub fn acquire<T: Send + Sync + 'static>(&self, value: T) -> OpaqueHandle<T> {
        self.handles.acquire(value)
    }
}

impl Drop for Args {
    fn drop(&mut self) {
        for wire in self.values.drain(..) {
            codec::discard(wire, &self.handles);
        }
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Args")
            .field("operation", &self.operation)
            .field("remaining", &self.values.len())
            .finish()
    }
}
