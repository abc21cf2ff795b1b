use std::{fmt, fs, path::Path, result::Result as StdResult, str::FromStr};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::WireValue;
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// The equivalent of `$RUST_LOG`, shipped from the host since env vars
    /// don't work well on mobile.
    #[serde(default = "default_rust_log")]
    pub rust_log: String,
    #[serde(default)]
    pub streams: StreamConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    #[serde(default)]
    pub reopen: ReopenPolicy,
}

/// What happens when a process-wide singleton stream is opened while a
/// previous subscriber is still bound.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReopenPolicy {
    /// Close the previous subscriber, then bind the new one.
    #[default]
    Handoff,
    /// Fail the new `open` with `StreamAlreadyOpen`.
    Reject,
}

fn default_worker_threads() -> usize {
    4
}

fn default_thread_name() -> String {
    "bridge-worker".to_owned()
}

fn default_rust_log() -> String {
    "info".to_owned()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            thread_name: default_thread_name(),
            rust_log: default_rust_log(),
            streams: StreamConfig::default(),
        }
    }
}

impl FromStr for BridgeConfig {
    type Err = toml::de::Error;
    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        toml::from_str(s)
    }
}

impl fmt::Display for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        toml::to_string_pretty(self)
            .map_err(|_| fmt::Error)
            .and_then(|s| write!(f, "{}", s))
    }
}

/// Load config from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BridgeConfig> {
    let content = fs::read_to_string(path.as_ref()).map_err(Error::config)?;
    let config: BridgeConfig = content.parse().map_err(Error::config)?;
    if config.worker_threads == 0 {
        return Err(Error::config("worker_threads must be at least 1"));
    }
    Ok(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMode {
    Sync,
    Async,
    Stream,
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CallMode::Sync => "sync",
            CallMode::Async => "async",
            CallMode::Stream => "stream",
        };
        f.write_str(s)
    }
}

/// Correlates an async call with its single completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompletionToken(pub u64);

/// Correlates a stream subscription with its emitted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamToken(pub u64);

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallDescriptor {
    pub operation_id: String,
    pub args: Vec<WireValue>,
    pub mode: CallMode,
    /// Completion or stream token; absent for sync calls.
    pub token: Option<u64>,
}

impl CallDescriptor {
    pub fn sync(operation_id: impl Into<String>, args: Vec<WireValue>) -> Self {
        Self {
            operation_id: operation_id.into(),
            args,
            mode: CallMode::Sync,
            token: None,
        }
    }

    pub fn asynchronous(
        operation_id: impl Into<String>,
        args: Vec<WireValue>,
        token: CompletionToken,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            args,
            mode: CallMode::Async,
            token: Some(token.0),
        }
    }

    pub fn stream(operation_id: impl Into<String>, args: Vec<WireValue>, token: StreamToken) -> Self {
        Self {
            operation_id: operation_id.into(),
            args,
            mode: CallMode::Stream,
            token: Some(token.0),
        }
    }
}

/// The single result of a sync or async call.
#[derive(Debug)]
pub enum Completion {
    Value(WireValue),
    /// An encoded `LogicError`, decoded on the host like any other value.
    LogicFailure(WireValue),
    Failed(Error),
}

#[derive(Debug)]
pub enum StreamEvent {
    Item(WireValue),
    /// Terminal event; carries an error when the emitter failed or trapped.
    Closed(Option<Error>),
}

/// Messages posted from native threads into the host's event loop.
#[derive(Debug)]
pub enum HostMessage {
    Completion {
        token: CompletionToken,
        completion: Completion,
    },
    Stream {
        token: StreamToken,
        event: StreamEvent,
    },
    /// The dispatcher shut down. Posted once, after the terminal events of
    /// the streams it closed.
    Stopped,
}

pub type HostPort = mpsc::UnboundedSender<HostMessage>;
pub type HostInbox = mpsc::UnboundedReceiver<HostMessage>;

/// Lifecycle state values
/// - 0 (INIT): constructed, not yet accepting calls
/// - 1 (RUNNING): accepting calls
/// - 2 (STOPPED): shut down; calls are rejected
pub const STATE_INIT: u8 = 0;
pub const STATE_RUNNING: u8 = 1;
pub const STATE_STOPPED: u8 = 2;
