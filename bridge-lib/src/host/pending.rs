use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use super::HostState;
use crate::codec::FromWire;
use crate::error::{Error, Result};
use crate::types::{Completion, CompletionToken, StreamEvent, StreamToken};

/// The host's view of one in-flight async call.
///
/// Resolves exactly once. Dropping it before the completion arrives
/// abandons the call: the completion is discarded on arrival and any
/// handles it carries are released.
pub struct PendingCall<R> {
    token: CompletionToken,
    rx: oneshot::Receiver<Completion>,
    state: Arc<HostState>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> PendingCall<R> {
    pub(super) fn new(
        token: CompletionToken,
        rx: oneshot::Receiver<Completion>,
        state: Arc<HostState>,
    ) -> Self {
        Self {
            token,
            rx,
            state,
            _marker: PhantomData,
        }
    }

    pub fn token(&self) -> CompletionToken {
        self.token
    }
}

impl<R: FromWire> Future for PendingCall<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(completion)) => Poll::Ready(this.state.resolve(completion)),
            // The sender only goes away without a value if the host state is
            // torn down under us.
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::NotRunning)),
        }
    }
}

impl<R> Drop for PendingCall<R> {
    fn drop(&mut self) {
        // A completion may have landed between delivery and the last poll.
        self.rx.close();
        if let Ok(completion) = self.rx.try_recv() {
            self.state.discard(completion);
        }
    }
}

/// The host's end of a stream subscription.
///
/// Yields values in emission order and ends after the terminal event.
/// Dropping it unsubscribes; the native side stops delivering and any
/// values still queued are discarded.
pub struct Subscription<T> {
    token: StreamToken,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    state: Arc<HostState>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Subscription<T> {
    pub(super) fn new(
        token: StreamToken,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
        state: Arc<HostState>,
    ) -> Self {
        Self {
            token,
            rx,
            state,
            done: false,
            _marker: PhantomData,
        }
    }

    pub fn token(&self) -> StreamToken {
        self.token
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<T: FromWire> Subscription<T> {
    /// The next value, an `Err` once if the stream closed with an error, then
    /// `None` forever.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(StreamEvent::Item(wire)) => Some(crate::codec::decode(wire, self.state.handles())),
            Some(StreamEvent::Closed(error)) => {
                self.done = true;
                error.map(Err)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Every remaining value, or the first error.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if !self.done {
            self.state.unsubscribe(self.token);
        }
        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            self.state.discard_event(event);
        }
    }
}
