use std::collections::HashSet;
use std::time::Duration;

use super::{init_logging, spawn_bridge, test_config, wallet_registry, Payment, PaymentStatus};
use crate::codec::WireValue;
use crate::error::DecodeError;
use crate::ops::{DEBUG_UNCONDITIONAL_ERROR, DEBUG_UNCONDITIONAL_PANIC};
use crate::types::{CallMode, STATE_STOPPED};
use crate::{start, wire_args, Error, OperationRegistry};

#[tokio::test]
async fn test_sync_call() {
    let host = spawn_bridge(wallet_registry());
    let sum: i64 = host.call_sync("add", wire_args![40i64, 2i64].unwrap()).unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn test_sync_operation_called_async() {
    let host = spawn_bridge(wallet_registry());
    let sum: i64 = host
        .call_async("add", wire_args![-1i64, 1i64].unwrap())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(sum, 0);
}

#[tokio::test]
async fn test_async_operation_cannot_be_called_sync() {
    let host = spawn_bridge(wallet_registry());
    let result: crate::Result<Payment> = host.call_sync("pay", vec![]);
    assert!(matches!(
        result,
        Err(Error::ModeMismatch {
            mode: CallMode::Sync,
            ..
        })
    ));
    assert!(matches!(
        host.call_sync::<()>("no_such_op", vec![]),
        Err(Error::UnknownOperation(_))
    ));
}

#[tokio::test]
async fn test_async_payment() {
    let host = spawn_bridge(wallet_registry());
    let payment: Payment = host
        .call_async("pay", wire_args!["bc1qxyz", 1_000u64, Some("rent")].unwrap())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(
        payment,
        Payment {
            amount_sats: 1_000,
            memo: Some("rent".to_owned()),
            status: PaymentStatus::Completed,
        }
    );
}

#[tokio::test]
async fn test_logic_error_is_typed_failure() {
    let host = spawn_bridge(wallet_registry());
    let result = host
        .call_async::<Payment>("pay", wire_args!["not-an-address", 5u64, None::<String>].unwrap())
        .unwrap()
        .await;
    match result {
        Err(Error::Logic(e)) => assert_eq!(e.message, "invalid address"),
        other => panic!("expected a logic error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_argument_arity_is_checked() {
    let host = spawn_bridge(wallet_registry());
    assert!(matches!(
        host.call_sync::<i64>("add", wire_args![1i64].unwrap()),
        Err(Error::Decode(DecodeError::MissingArgument { index: 1, .. }))
    ));
    assert!(matches!(
        host.call_sync::<i64>("add", wire_args![1i64, 2i64, 3i64].unwrap()),
        Err(Error::Decode(DecodeError::TooManyArguments {
            expected: 2,
            found: 3,
            ..
        }))
    ));
}

#[tokio::test]
async fn test_panic_is_trapped() {
    let host = spawn_bridge(OperationRegistry::new());

    let sync = host.call_sync::<()>(DEBUG_UNCONDITIONAL_PANIC, vec![]);
    assert!(matches!(sync, Err(Error::BoundaryTrap { ref operation, .. }) if operation == DEBUG_UNCONDITIONAL_PANIC));

    let result = host
        .call_async::<()>(DEBUG_UNCONDITIONAL_PANIC, vec![])
        .unwrap()
        .await;
    match result {
        Err(Error::BoundaryTrap { message, .. }) => assert_eq!(message, "Panic inside native code"),
        other => panic!("expected a trap, got {:?}", other),
    }

    // The bridge keeps serving after a trap.
    assert!(host.dispatcher().is_running());
    assert!(matches!(
        host.call_sync::<()>(DEBUG_UNCONDITIONAL_ERROR, vec![]),
        Err(Error::Logic(_))
    ));
}

#[tokio::test]
async fn test_panic_while_building_future_is_trapped() {
    let mut registry = OperationRegistry::new();
    registry.register_async("eager_panic", |_args| {
        if true {
            panic!("before the future exists");
        }
        async { Ok(()) }
    });
    let host = spawn_bridge(registry);
    let result = host.call_async::<()>("eager_panic", vec![]).unwrap().await;
    assert!(matches!(result, Err(Error::BoundaryTrap { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_each_call_completes_exactly_once() {
    let host = spawn_bridge(wallet_registry());
    let calls: Vec<_> = (0..64i64)
        .map(|i| {
            let delay = (i % 7) as u64;
            let pending = host
                .call_async::<String>("echo_after", wire_args![delay, format!("call {}", i)].unwrap())
                .unwrap();
            (i, pending)
        })
        .collect();
    assert_eq!(
        calls.iter().map(|(_, p)| p.token()).collect::<HashSet<_>>().len(),
        calls.len()
    );

    for (i, pending) in calls {
        assert_eq!(pending.await.unwrap(), format!("call {}", i));
    }
    assert_eq!(host.pending_calls(), 0);
    assert_eq!(host.dispatcher().in_flight(), 0);
}

#[tokio::test]
async fn test_timeout_race_drops_late_completion() {
    let host = spawn_bridge(wallet_registry());
    let pending = host
        .call_async::<String>("echo_after", wire_args![200u64, "too late"].unwrap())
        .unwrap();
    let token = pending.token();
    let raced = tokio::time::timeout(Duration::from_millis(20), pending).await;
    assert!(raced.is_err());

    // The late completion is discarded rather than delivered twice or leaked.
    assert!(super::eventually(|| host.pending_calls() == 0).await);
    assert_eq!(host.dispatcher().in_flight(), 0);

    let fresh: String = host
        .call_async("echo_after", wire_args![0u64, "fresh"].unwrap())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(fresh, "fresh");
    assert_ne!(token.0, 0);
}

#[tokio::test]
async fn test_shutdown_fails_waiting_calls() {
    let host = spawn_bridge(wallet_registry());
    let pending = host
        .call_async::<String>("echo_after", wire_args![500u64, "never"].unwrap())
        .unwrap();
    host.shutdown();
    assert!(matches!(pending.await, Err(Error::NotRunning)));
    assert_eq!(host.dispatcher().state(), STATE_STOPPED);
    assert!(matches!(
        host.call_sync::<i64>("add", vec![WireValue::Int(1), WireValue::Int(2)]),
        Err(Error::NotRunning)
    ));
}

#[tokio::test]
async fn test_event_loop_finishes_after_shutdown() {
    init_logging();
    let (host, event_loop) = start(&test_config(), wallet_registry()).unwrap();
    let running = tokio::spawn(event_loop.run());
    host.shutdown();
    drop(host);
    assert!(tokio::time::timeout(Duration::from_secs(2), running).await.is_ok());
}

#[tokio::test]
async fn test_event_loop_finishes_when_host_is_dropped() {
    init_logging();
    let (host, event_loop) = start(&test_config(), wallet_registry()).unwrap();
    let running = tokio::spawn(event_loop.run());
    let sum: i64 = host
        .call_async("add", wire_args![1i64, 2i64].unwrap())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(sum, 3);
    drop(host);
    assert!(tokio::time::timeout(Duration::from_secs(2), running).await.is_ok());
}

#[test]
fn test_pump_stops_at_shutdown() {
    init_logging();
    let (host, mut event_loop) = start(&test_config(), wallet_registry()).unwrap();
    assert_eq!(event_loop.pump(), 0);
    assert!(!event_loop.is_stopped());
    host.shutdown();
    assert_eq!(event_loop.pump(), 0);
    assert!(event_loop.is_stopped());
}
