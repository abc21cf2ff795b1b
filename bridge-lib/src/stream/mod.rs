//! Stream channel
//!
//! A [`StreamSink`] is the native end of one subscription. Values are posted
//! to the host port in emission order, followed by exactly one terminal
//! `Closed` event; nothing is delivered after it. The sink closes itself when
//! the last clone is dropped.

mod singleton;

pub use singleton::SingletonStream;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use log::debug;
use tokio::sync::mpsc::error::SendError;

use crate::codec::IntoWire;
use crate::error::{Error, Result};
use crate::handle::HandleTable;
use crate::types::{HostMessage, HostPort, StreamEvent, StreamToken};

pub(crate) struct SinkInner {
    token: StreamToken,
    operation: String,
    port: HostPort,
    handles: Arc<HandleTable>,
    /// Held across check-and-post so a close can never overtake an emit.
    closed: Mutex<bool>,
}

impl SinkInner {
    fn lock(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, event: StreamEvent) {
        let message = HostMessage::Stream {
            token: self.token,
            event,
        };
        if let Err(SendError(message)) = self.port.send(message) {
            crate::dispatcher::discard_message(message, &self.handles);
        }
    }

    fn finish(&self, error: Option<Error>) -> bool {
        let mut closed = self.lock();
        if *closed {
            return false;
        }
        *closed = true;
        self.post(StreamEvent::Closed(error));
        true
    }

    fn is_closed(&self) -> bool {
        *self.lock()
    }
}

impl Drop for SinkInner {
    fn drop(&mut self) {
        let closed = *self.closed.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !closed {
            debug!("{} ({}) closed by drop", self.token, self.operation);
            self.post(StreamEvent::Closed(None));
        }
    }
}

/// The native end of a stream subscription.
#[derive(Clone)]
pub struct StreamSink {
    inner: Arc<SinkInner>,
}

impl StreamSink {
    pub(crate) fn new(
        token: StreamToken,
        operation: &str,
        port: HostPort,
        handles: Arc<HandleTable>,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                token,
                operation: operation.to_owned(),
                port,
                handles,
                closed: Mutex::new(false),
            }),
        }
    }

    pub fn token(&self) -> StreamToken {
        self.inner.token
    }

    pub fn operation(&self) -> &str {
        &self.inner.operation
    }

    /// Post one value. Returns `Ok(false)` without encoding `value` once the
    /// stream is closed.
    pub fn emit<T: IntoWire>(&self, value: T) -> Result<bool> {
        let closed = self.inner.lock();
        if *closed {
            return Ok(false);
        }
        let wire = value.into_wire()?;
        self.inner.post(StreamEvent::Item(wire));
        drop(closed);
        Ok(true)
    }

    /// Close the stream normally. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.inner.finish(None)
    }

    /// Close the stream with a terminal error.
    pub fn close_with(&self, error: Error) -> bool {
        debug!("{} ({}) failed: {}", self.inner.token, self.inner.operation, error);
        self.inner.finish(Some(error))
    }

    /// Stop delivering without a terminal event; the host already dropped
    /// its end.
    pub(crate) fn detach(&self) -> bool {
        let mut closed = self.inner.lock();
        !std::mem::replace(&mut *closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn downgrade(&self) -> Weak<SinkInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<SinkInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("token", &self.inner.token)
            .field("operation", &self.inner.operation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Weak index of open sinks by stream token.
#[derive(Default)]
pub(crate) struct StreamRegistry {
    sinks: DashMap<u64, Weak<SinkInner>>,
}

impl StreamRegistry {
    fn prune(&self) {
        self.sinks
            .retain(|_, sink| sink.upgrade().map_or(false, |sink| !sink.is_closed()));
    }

    pub(crate) fn insert(&self, sink: &StreamSink) -> Result<()> {
        self.prune();
        let token = sink.token().0;
        if self.sinks.contains_key(&token) {
            return Err(Error::TokenInUse(token));
        }
        self.sinks.insert(token, sink.downgrade());
        Ok(())
    }

    pub(crate) fn detach(&self, token: u64) -> bool {
        self.sinks
            .remove(&token)
            .and_then(|(_, sink)| StreamSink::upgrade(&sink))
            .map_or(false, |sink| sink.detach())
    }

    pub(crate) fn close_all(&self) {
        let open: Vec<StreamSink> = self
            .sinks
            .iter()
            .filter_map(|entry| StreamSink::upgrade(entry.value()))
            .collect();
        self.sinks.clear();
        for sink in open {
            sink.close_with(Error::NotRunning);
        }
    }

    pub(crate) fn open(&self) -> usize {
        self.prune();
        self.sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireValue;
    use tokio::sync::mpsc;

    fn sink(token: u64) -> (StreamSink, mpsc::UnboundedReceiver<HostMessage>) {
        let (port, inbox) = mpsc::unbounded_channel();
        (
            StreamSink::new(StreamToken(token), "ticks", port, HandleTable::new()),
            inbox,
        )
    }

    fn event(inbox: &mut mpsc::UnboundedReceiver<HostMessage>) -> StreamEvent {
        match inbox.try_recv().unwrap() {
            HostMessage::Stream { event, .. } => event,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_emit_then_close_in_order() {
        let (sink, mut inbox) = sink(1);
        assert!(sink.emit("hello").unwrap());
        assert!(sink.emit("world").unwrap());
        assert!(sink.close());

        assert!(matches!(event(&mut inbox), StreamEvent::Item(WireValue::Str(s)) if s == "hello"));
        assert!(matches!(event(&mut inbox), StreamEvent::Item(WireValue::Str(s)) if s == "world"));
        assert!(matches!(event(&mut inbox), StreamEvent::Closed(None)));

        assert!(!sink.emit("late").unwrap());
        assert!(!sink.close());
        drop(sink);
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn test_last_clone_drop_closes() {
        let (sink, mut inbox) = sink(2);
        let other = sink.clone();
        drop(sink);
        assert!(inbox.try_recv().is_err());
        other.emit(1u8).unwrap();
        drop(other);
        assert!(matches!(event(&mut inbox), StreamEvent::Item(WireValue::Int(1))));
        assert!(matches!(event(&mut inbox), StreamEvent::Closed(None)));
    }

    #[test]
    fn test_detached_sink_posts_nothing() {
        let (sink, mut inbox) = sink(3);
        let registry = StreamRegistry::default();
        registry.insert(&sink).unwrap();
        assert_eq!(registry.open(), 1);
        assert!(registry.detach(3));
        assert!(!sink.emit(5u8).unwrap());
        drop(sink);
        assert!(inbox.try_recv().is_err());
        assert_eq!(registry.open(), 0);
    }

    #[test]
    fn test_duplicate_open_token_rejected() {
        let (first, _inbox) = sink(4);
        let (second, _other) = sink(4);
        let registry = StreamRegistry::default();
        registry.insert(&first).unwrap();
        assert!(matches!(registry.insert(&second), Err(Error::TokenInUse(4))));
        first.close();
        registry.insert(&second).unwrap();
    }
}
