//! Forwards the crate's `log` records to the host as a stream of
//! [`LogEvent`]s.
//!
//! The host opens the stream once at startup with its log filter, since env
//! vars don't work well on mobile. Opening it again after a host restart
//! rebinds the stream instead of failing on the already-installed logger.
//! Platform logging goes through [`tee`] so it can share the global slot.

use std::fmt::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use log::{warn, LevelFilter, Log, Metadata, Record};

use crate::error::Result;
use crate::stream::{SingletonStream, StreamSink};
use crate::types::ReopenPolicy;

crate::wire_struct! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LogEvent {
        pub formatted_message: String,
    }
}

pub static LOG_STREAM: SingletonStream = SingletonStream::new("rust_log");

static LOG_FILTER: ArcSwapOption<LogFilter> = ArcSwapOption::const_empty();
static LOGGER: BridgeLogger = BridgeLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);
/// Secondary logger every record is also sent to, with its level.
static TEE: OnceLock<(Box<dyn Log>, LevelFilter)> = OnceLock::new();

/// `level` or `target=level` directives separated by commas, like
/// `$RUST_LOG`. The most specific matching target wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    default: LevelFilter,
    targets: Vec<(String, LevelFilter)>,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            default: LevelFilter::Info,
            targets: Vec::new(),
        }
    }
}

impl LogFilter {
    /// Parse a filter; an empty or entirely invalid one means `info`.
    pub fn parse(spec: &str) -> Self {
        let mut filter = Self::default();
        for directive in spec.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            match directive.split_once('=') {
                Some((target, level)) => {
                    if let Ok(level) = LevelFilter::from_str(level.trim()) {
                        filter.targets.push((target.trim().to_owned(), level));
                    }
                }
                None => match LevelFilter::from_str(directive) {
                    Ok(level) => filter.default = level,
                    Err(_) => filter.targets.push((directive.to_owned(), LevelFilter::Trace)),
                },
            }
        }
        filter
    }

    pub fn level_for(&self, target: &str) -> LevelFilter {
        self.targets
            .iter()
            .filter(|(prefix, _)| target.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.default, |(_, level)| *level)
    }

    pub fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level_for(metadata.target())
    }

    pub fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|(_, level)| *level)
            .fold(self.default, std::cmp::max)
    }
}

/// `1682371943.448209 R  INFO target: message`
pub fn format_record(record: &Record) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();
    let level = record.level().as_str();
    // Pad INFO and WARN so messages line up.
    let pad = if level.len() == 4 { " " } else { "" };
    let mut buf = String::new();
    let _ = write!(
        buf,
        "{:.06} R {}{} {}: {}",
        timestamp,
        pad,
        level,
        record.target(),
        record.args()
    );
    buf
}

pub struct BridgeLogger;

impl BridgeLogger {
    fn streamed(&self, metadata: &Metadata) -> bool {
        match &*LOG_FILTER.load() {
            Some(filter) => filter.enabled(metadata),
            None => false,
        }
    }

    fn teed(&self, metadata: &Metadata) -> Option<&'static dyn Log> {
        let (logger, level) = TEE.get()?;
        (metadata.level() <= *level).then_some(logger.as_ref())
    }
}

impl Log for BridgeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.streamed(metadata) || self.teed(metadata).is_some()
    }

    fn log(&self, record: &Record) {
        if let Some(tee) = self.teed(record.metadata()) {
            tee.log(record);
        }
        if !self.streamed(record.metadata()) {
            return;
        }
        let event = LogEvent {
            formatted_message: format_record(record),
        };
        let _ = LOG_STREAM.emit(event);
    }

    fn flush(&self) {
        if let Some((tee, _)) = TEE.get() {
            tee.flush();
        }
    }
}

/// Install the bridge logger as the global logger, unless some other
/// logger got there first. Returns whether the bridge logger is active.
fn install() -> bool {
    if log::set_logger(&LOGGER).is_ok() {
        INSTALLED.store(true, Ordering::SeqCst);
    }
    if !INSTALLED.load(Ordering::SeqCst) {
        return false;
    }
    let streamed = LOG_FILTER
        .load()
        .as_deref()
        .map_or(LevelFilter::Off, LogFilter::max_level);
    let teed = TEE.get().map_or(LevelFilter::Off, |(_, level)| *level);
    log::set_max_level(std::cmp::max(streamed, teed));
    true
}

/// Also send records up to `level` to `logger`, such as the platform log,
/// whether or not a host has opened the log stream. Only the first call
/// takes effect.
pub fn tee(logger: Box<dyn Log>, level: LevelFilter) -> bool {
    let stored = TEE.set((logger, level)).is_ok();
    install();
    stored
}

/// Bind `sink` as the log stream and install the logger.
///
/// A logger that is already installed is not an error: on a host restart
/// the stream is rebound and the filter replaced.
pub fn init(sink: StreamSink, rust_log: &str, policy: ReopenPolicy) -> Result<()> {
    LOG_STREAM.bind(sink, policy)?;
    LOG_FILTER.store(Some(Arc::new(LogFilter::parse(rust_log))));
    if !install() {
        warn!("another logger is installed; the log stream stays silent");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn test_filter_parsing() {
        let filter = LogFilter::parse("warn,app_bridge_lib::host=debug, app_bridge_lib=info");
        assert_eq!(filter.level_for("other"), LevelFilter::Warn);
        assert_eq!(filter.level_for("app_bridge_lib::codec"), LevelFilter::Info);
        assert_eq!(filter.level_for("app_bridge_lib::host::pending"), LevelFilter::Debug);
        assert_eq!(filter.max_level(), LevelFilter::Debug);
    }

    #[test]
    fn test_invalid_filter_falls_back_to_info() {
        let filter = LogFilter::parse("");
        assert_eq!(filter, LogFilter::default());
        let filter = LogFilter::parse("app=loud");
        assert_eq!(filter.level_for("app"), LevelFilter::Info);
    }

    #[test]
    fn test_bare_target_enables_everything() {
        let filter = LogFilter::parse("error,noisy");
        assert_eq!(filter.level_for("noisy::inner"), LevelFilter::Trace);
        let metadata = Metadata::builder().level(Level::Debug).target("noisy").build();
        assert!(filter.enabled(&metadata));
        let metadata = Metadata::builder().level(Level::Warn).target("quiet").build();
        assert!(!filter.enabled(&metadata));
    }

    #[test]
    fn test_format_record() {
        let message = format_record(
            &Record::builder()
                .args(format_args!("peer {} connected", 7))
                .level(Level::Info)
                .target("app::net")
                .build(),
        );
        let (timestamp, rest) = message.split_once(' ').unwrap();
        assert!(timestamp.parse::<f64>().unwrap() > 0.0);
        assert_eq!(rest, "R  INFO app::net: peer 7 connected");

        let message = format_record(
            &Record::builder()
                .args(format_args!("boom"))
                .level(Level::Error)
                .target("app")
                .build(),
        );
        assert!(message.ends_with(" R ERROR app: boom"));
    }
}
