use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use log::{info, warn};

use super::StreamSink;
use crate::codec::IntoWire;
use crate::error::{Error, Result};
use crate::types::ReopenPolicy;

/// A process-wide stream with at most one bound subscriber, such as the log
/// stream. Emitting while nothing is bound is a no-op.
///
/// Rebinding is how a host that restarted without restarting the process
/// picks the stream back up.
pub struct SingletonStream {
    name: &'static str,
    current: ArcSwapOption<StreamSink>,
    bind_lock: Mutex<()>,
}

impl SingletonStream {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            current: ArcSwapOption::const_empty(),
            bind_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bind(&self, sink: StreamSink, policy: ReopenPolicy) -> Result<()> {
        let _guard = self.bind_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current.load_full().filter(|sink| !sink.is_closed());
        if let Some(previous) = previous {
            match policy {
                ReopenPolicy::Reject => {
                    warn!(
                        "`{}` stream is bound to {}; rejecting {}",
                        self.name,
                        previous.token(),
                        sink.token()
                    );
                    return Err(Error::StreamAlreadyOpen(self.name.to_owned()));
                }
                ReopenPolicy::Handoff => {
                    info!(
                        "`{}` stream handed off from {} to {}",
                        self.name,
                        previous.token(),
                        sink.token()
                    );
                    previous.close();
                }
            }
        }
        self.current.store(Some(Arc::new(sink)));
        Ok(())
    }

    /// Emit to the bound subscriber. `Ok(false)` if none is bound or it
    /// already closed.
    pub fn emit<T: IntoWire>(&self, value: T) -> Result<bool> {
        let current = self.current.load();
        match &*current {
            Some(sink) => sink.emit(value),
            None => Ok(false),
        }
    }

    /// Close and forget the bound subscriber, if any.
    pub fn unbind(&self) -> bool {
        let _guard = self.bind_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.current.swap(None).map_or(false, |sink| sink.close())
    }

    pub fn is_bound(&self) -> bool {
        match &*self.current.load() {
            Some(sink) => !sink.is_closed(),
            None => false,
        }
    }
}
