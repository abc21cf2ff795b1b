//! Host side of the bridge
//!
//! [`Host`] issues calls and hands back futures and subscriptions;
//! [`EventLoop`] is the single consumer of the host port and routes every
//! posted completion or stream event to whoever is waiting for it. Results
//! nobody is waiting for any more are discarded with their handle shares
//! released.
//!
//! The event loop ends once the dispatcher shuts down, either through
//! [`Host::shutdown`] or because the last `Host`, `PendingCall` and
//! `Subscription` were dropped.

mod pending;

pub use pending::{PendingCall, Subscription};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};

use crate::codec::{self, FromWire, WireValue};
use crate::dispatcher::{discard_completion, discard_message, Dispatcher};
use crate::error::{Error, LogicError, Result};
use crate::handle::HandleTable;
use crate::types::{
    CallDescriptor, Completion, CompletionToken, HostInbox, HostMessage, StreamEvent, StreamToken,
};

pub(crate) struct HostState {
    dispatcher: Dispatcher,
    next_token: AtomicU64,
    pending: Mutex<HashMap<CompletionToken, oneshot::Sender<Completion>>>,
    subscriptions: Mutex<HashMap<StreamToken, mpsc::UnboundedSender<StreamEvent>>>,
}

impl HostState {
    fn pending(&self) -> MutexGuard<'_, HashMap<CompletionToken, oneshot::Sender<Completion>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(
        &self,
    ) -> MutexGuard<'_, HashMap<StreamToken, mpsc::UnboundedSender<StreamEvent>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn handles(&self) -> &Arc<HandleTable> {
        self.dispatcher.handles()
    }

    /// Turn a completion into the caller's typed result.
    pub(crate) fn resolve<R: FromWire>(&self, completion: Completion) -> Result<R> {
        match completion {
            Completion::Value(wire) => codec::decode(wire, self.handles()),
            Completion::LogicFailure(wire) => {
                Err(Error::Logic(codec::decode::<LogicError>(wire, self.handles())?))
            }
            Completion::Failed(e) => Err(e),
        }
    }

    pub(crate) fn discard(&self, completion: Completion) {
        discard_completion(completion, self.handles());
    }

    pub(crate) fn discard_event(&self, event: StreamEvent) {
        if let StreamEvent::Item(wire) = event {
            codec::discard(wire, self.handles());
        }
    }

    /// The host lost interest in `token`.
    pub(crate) fn unsubscribe(&self, token: StreamToken) {
        self.subscriptions().remove(&token);
        if self.dispatcher.detach_stream(token) {
            debug!("{} unsubscribed", token);
        }
    }

    fn deliver(&self, message: HostMessage) {
        match message {
            HostMessage::Completion { token, completion } => {
                let waiter = self.pending().remove(&token);
                match waiter {
                    Some(tx) => {
                        if let Err(completion) = tx.send(completion) {
                            debug!("{} was abandoned; discarding its completion", token);
                            self.discard(completion);
                        }
                    }
                    None => {
                        warn!("completion for unknown {}", token);
                        self.discard(completion);
                    }
                }
            }
            HostMessage::Stream { token, event } => {
                let terminal = matches!(event, StreamEvent::Closed(_));
                let undelivered = {
                    let mut subscriptions = self.subscriptions();
                    let sent = match subscriptions.get(&token) {
                        Some(tx) => tx.send(event).map_err(|SendError(event)| event),
                        None => Err(event),
                    };
                    if terminal {
                        subscriptions.remove(&token);
                    }
                    sent.err()
                };
                if let Some(event) = undelivered {
                    self.discard_event(event);
                }
            }
            // Handled by the event loop itself.
            HostMessage::Stopped => {}
        }
    }
}

/// The host's handle on a running bridge.
#[derive(Clone)]
pub struct Host {
    state: Arc<HostState>,
}

impl Host {
    pub fn new(dispatcher: Dispatcher, inbox: HostInbox) -> (Host, EventLoop) {
        let state = Arc::new(HostState {
            dispatcher,
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        });
        let event_loop = EventLoop {
            inbox,
            handles: Arc::clone(state.handles()),
            state: Arc::downgrade(&state),
            stopped: false,
        };
        (Host { state }, event_loop)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.state.dispatcher
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        self.state.handles()
    }

    fn next_token(&self) -> u64 {
        self.state.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Invoke a sync operation on the calling thread.
    pub fn call_sync<R: FromWire>(&self, operation: &str, args: Vec<WireValue>) -> Result<R> {
        let completion = self
            .state
            .dispatcher
            .call_sync(CallDescriptor::sync(operation, args))?;
        self.state.resolve(completion)
    }

    /// Start an async call. The returned future resolves once the event
    /// loop delivers the completion; dropping it abandons the call.
    pub fn call_async<R: FromWire>(
        &self,
        operation: &str,
        args: Vec<WireValue>,
    ) -> Result<PendingCall<R>> {
        let token = CompletionToken(self.next_token());
        let (tx, rx) = oneshot::channel();
        self.state.pending().insert(token, tx);
        let desc = CallDescriptor::asynchronous(operation, args, token);
        if let Err(e) = self.state.dispatcher.call_async(desc) {
            self.state.pending().remove(&token);
            return Err(e);
        }
        Ok(PendingCall::new(token, rx, Arc::clone(&self.state)))
    }

    /// Open a stream subscription.
    pub fn open_stream<T: FromWire>(
        &self,
        operation: &str,
        args: Vec<WireValue>,
    ) -> Result<Subscription<T>> {
        let token = StreamToken(self.next_token());
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.subscriptions().insert(token, tx);
        let desc = CallDescriptor::stream(operation, args, token);
        if let Err(e) = self.state.dispatcher.open_stream(desc) {
            self.state.subscriptions().remove(&token);
            return Err(e);
        }
        Ok(Subscription::new(token, rx, Arc::clone(&self.state)))
    }

    /// Calls whose completion has not reached the event loop yet.
    pub fn pending_calls(&self) -> usize {
        self.state.pending().len()
    }

    pub fn subscriptions(&self) -> usize {
        self.state.subscriptions().len()
    }

    /// Stop the bridge. Waiting calls fail with `NotRunning` and every
    /// subscription receives its terminal event.
    pub fn shutdown(&self) {
        self.state.dispatcher.shutdown();
        let waiting: Vec<_> = self.state.pending().drain().collect();
        if !waiting.is_empty() {
            info!("failing {} waiting calls on shutdown", waiting.len());
        }
        for (_, tx) in waiting {
            let _ = tx.send(Completion::Failed(Error::NotRunning));
        }
    }
}

/// Routes posted messages to their waiting futures and subscriptions.
///
/// Exactly one event loop exists per bridge, so completions and stream
/// events are observed in the order native code posted them. The loop does
/// not keep the host alive.
pub struct EventLoop {
    inbox: HostInbox,
    state: Weak<HostState>,
    handles: Arc<HandleTable>,
    stopped: bool,
}

impl EventLoop {
    /// Deliver messages until the dispatcher shuts down.
    pub async fn run(mut self) {
        while self.turn().await {}
        debug!("host event loop finished");
    }

    /// Wait for and deliver one message. `false` once the dispatcher has
    /// shut down.
    pub async fn turn(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        match self.inbox.recv().await {
            Some(message) => self.deliver(message),
            None => {
                self.stopped = true;
                false
            }
        }
    }

    /// Deliver everything already posted without waiting.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        while !self.stopped {
            match self.inbox.try_recv() {
                Ok(message) => {
                    if self.deliver(message) {
                        delivered += 1;
                    }
                }
                Err(_) => break,
            }
        }
        delivered
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn deliver(&mut self, message: HostMessage) -> bool {
        if let HostMessage::Stopped = message {
            self.stop();
            return false;
        }
        match self.state.upgrade() {
            Some(state) => state.deliver(message),
            None => discard_message(message, &self.handles),
        }
        true
    }

    /// Refuse further messages; anything posted later is discarded by its
    /// sender.
    fn stop(&mut self) {
        self.stopped = true;
        self.inbox.close();
        while let Ok(message) = self.inbox.try_recv() {
            discard_message(message, &self.handles);
        }
    }
}
