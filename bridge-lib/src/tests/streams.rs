use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{Level, Log, Record};

use super::{eventually, spawn_bridge, test_config};
use crate::error::LogicError;
use crate::logger::{BridgeLogger, LogEvent, LOG_STREAM};
use crate::ops::INIT_RUST_LOG_STREAM;
use crate::types::{CallMode, ReopenPolicy};
use crate::{start, wire_args, Error, OperationRegistry, StreamSink};

fn greeter(accepted_late: Arc<Mutex<Option<bool>>>) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry.register_stream("greet", move |mut args, sink| {
        let words: Vec<String> = args.next()?;
        args.finish()?;
        for word in words {
            sink.emit(word)?;
        }
        sink.close();
        *accepted_late.lock().unwrap() = Some(sink.emit("again")?);
        Ok(())
    });
    registry
}

#[tokio::test]
async fn test_stream_values_then_close() {
    let late = Arc::new(Mutex::new(None));
    let host = spawn_bridge(greeter(Arc::clone(&late)));
    let mut greetings = host
        .open_stream::<String>("greet", wire_args![vec!["hello", "world"]].unwrap())
        .unwrap();

    assert_eq!(greetings.next().await.unwrap().unwrap(), "hello");
    assert_eq!(greetings.next().await.unwrap().unwrap(), "world");
    assert!(greetings.next().await.is_none());
    assert!(greetings.is_done());
    assert!(greetings.next().await.is_none());

    assert_eq!(*late.lock().unwrap(), Some(false));
    assert!(eventually(|| host.subscriptions() == 0).await);
}

#[tokio::test]
async fn test_stream_collect_and_empty_stream() {
    let host = spawn_bridge(greeter(Arc::new(Mutex::new(None))));
    let words = host
        .open_stream::<String>("greet", wire_args![vec!["a", "b", "c"]].unwrap())
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(words, ["a", "b", "c"]);

    let none = host
        .open_stream::<String>("greet", wire_args![Vec::<String>::new()].unwrap())
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_stream_error_is_terminal() {
    let mut registry = OperationRegistry::new();
    registry.register_stream("feed", |_args, sink| {
        sink.emit(1u32)?;
        Err(Error::logic("feed lost"))
    });
    let host = spawn_bridge(registry);
    let mut feed = host.open_stream::<u32>("feed", vec![]).unwrap();
    assert_eq!(feed.next().await.unwrap().unwrap(), 1);
    match feed.next().await {
        Some(Err(Error::Logic(LogicError { message }))) => assert_eq!(message, "feed lost"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(feed.next().await.is_none());
}

#[tokio::test]
async fn test_stream_producer_panic_closes_with_trap() {
    let mut registry = OperationRegistry::new();
    registry.register_stream("doomed", |_args, _sink| -> crate::Result<()> {
        panic!("producer died");
    });
    let host = spawn_bridge(registry);
    let result = host.open_stream::<u32>("doomed", vec![]).unwrap().collect().await;
    assert!(matches!(result, Err(Error::BoundaryTrap { .. })));
}

#[tokio::test]
async fn test_dropping_subscription_stops_producer() {
    let stopped = Arc::new(AtomicBool::new(false));
    let producer_stopped = Arc::clone(&stopped);
    let mut registry = OperationRegistry::new();
    registry.register_stream("ticks", move |_args, sink: StreamSink| {
        let stopped = Arc::clone(&producer_stopped);
        thread::spawn(move || {
            let mut tick = 0u64;
            while let Ok(true) = sink.emit(tick) {
                tick += 1;
                thread::sleep(Duration::from_millis(2));
            }
            stopped.store(true, Ordering::SeqCst);
        });
        Ok(())
    });
    let host = spawn_bridge(registry);

    let mut ticks = host.open_stream::<u64>("ticks", vec![]).unwrap();
    for expected in 0..3u64 {
        assert_eq!(ticks.next().await.unwrap().unwrap(), expected);
    }
    assert_eq!(host.dispatcher().open_streams(), 1);
    drop(ticks);

    assert_eq!(host.subscriptions(), 0);
    assert!(eventually(|| stopped.load(Ordering::SeqCst)).await);
    assert!(eventually(|| host.dispatcher().open_streams() == 0).await);
}

#[tokio::test]
async fn test_stream_mode_is_enforced() {
    let host = spawn_bridge(greeter(Arc::new(Mutex::new(None))));
    assert!(matches!(
        host.call_sync::<()>("greet", vec![]),
        Err(Error::ModeMismatch { .. })
    ));
    assert!(matches!(
        host.open_stream::<String>("add", vec![]),
        Err(Error::UnknownOperation(_))
    ));
    assert!(matches!(
        host.open_stream::<String>(crate::ops::DEBUG_UNCONDITIONAL_ERROR, vec![]),
        Err(Error::ModeMismatch {
            mode: CallMode::Stream,
            ..
        })
    ));
}

fn log_line(message: &str) {
    BridgeLogger.log(
        &Record::builder()
            .args(format_args!("{}", message))
            .level(Level::Warn)
            .target("app_bridge_lib::tests")
            .build(),
    );
}

/// Wait for a log event containing `needle`, skipping unrelated records.
async fn wait_for_log(logs: &mut crate::Subscription<LogEvent>, needle: &str) -> bool {
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = logs.next().await {
            if event.unwrap().formatted_message.contains(needle) {
                return true;
            }
        }
        false
    });
    found.await.unwrap_or(false)
}

// The only test that binds the process-wide log stream.
#[tokio::test]
async fn test_log_stream_reopen_policies() {
    let host = spawn_bridge(OperationRegistry::new());

    let mut first = host
        .open_stream::<LogEvent>(INIT_RUST_LOG_STREAM, wire_args![Some("debug")].unwrap())
        .unwrap();
    assert!(eventually(|| LOG_STREAM.is_bound()).await);
    log_line("first subscriber");
    assert!(wait_for_log(&mut first, "first subscriber").await);

    // A restarted host opens the stream again and takes it over.
    let mut second = host
        .open_stream::<LogEvent>(INIT_RUST_LOG_STREAM, wire_args![None::<String>].unwrap())
        .unwrap();
    let mut first_closed = false;
    for _ in 0..500 {
        if first.is_done() {
            first_closed = true;
            break;
        }
        match tokio::time::timeout(Duration::from_millis(10), first.next()).await {
            Ok(None) => {
                first_closed = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(first_closed);

    log_line("second subscriber");
    assert!(wait_for_log(&mut second, "second subscriber").await);

    // Under `reject` the open itself fails while a subscriber is bound.
    let mut config = test_config();
    config.streams.reopen = ReopenPolicy::Reject;
    let (strict, event_loop) = start(&config, OperationRegistry::new()).unwrap();
    tokio::spawn(event_loop.run());
    assert!(matches!(
        strict.open_stream::<LogEvent>(INIT_RUST_LOG_STREAM, vec![]),
        Err(Error::StreamAlreadyOpen(_))
    ));
    assert_eq!(strict.subscriptions(), 0);
    assert_eq!(strict.dispatcher().open_streams(), 0);
    log_line("still second");
    assert!(wait_for_log(&mut second, "still second").await);

    drop(second);
    assert!(eventually(|| !LOG_STREAM.is_bound()).await);

    let mut third = strict
        .open_stream::<LogEvent>(INIT_RUST_LOG_STREAM, vec![])
        .unwrap();
    assert!(LOG_STREAM.is_bound());
    log_line("third subscriber");
    assert!(wait_for_log(&mut third, "third subscriber").await);

    drop(third);
    assert!(eventually(|| !LOG_STREAM.is_bound()).await);
}
