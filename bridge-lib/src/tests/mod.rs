mod calls;
mod streams;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{start, Args, BridgeConfig, Error, Host, OpaqueHandle, OperationRegistry, Result};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn test_config() -> BridgeConfig {
    BridgeConfig {
        worker_threads: 2,
        ..BridgeConfig::default()
    }
}

/// Start a bridge and drive its event loop on the current runtime.
pub(crate) fn spawn_bridge(registry: OperationRegistry) -> Host {
    init_logging();
    let (host, event_loop) = start(&test_config(), registry).unwrap();
    tokio::spawn(event_loop.run());
    host
}

/// Poll `cond` until it holds or a few seconds pass.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

crate::wire_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PaymentStatus {
        Pending,
        Completed,
        Failed,
    }
}

crate::wire_struct! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Payment {
        pub amount_sats: u64,
        pub memo: Option<String>,
        pub status: PaymentStatus,
    }
}

/// A native resource that counts how often it was freed.
pub(crate) struct Wallet {
    pub name: String,
    pub freed: Arc<AtomicUsize>,
}

impl Wallet {
    pub fn new(name: &str) -> (Self, Arc<AtomicUsize>) {
        let freed = Arc::new(AtomicUsize::new(0));
        (
            Self {
                name: name.to_owned(),
                freed: Arc::clone(&freed),
            },
            freed,
        )
    }
}

impl Drop for Wallet {
    fn drop(&mut self) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

async fn pay(mut args: Args) -> Result<Payment> {
    let address: String = args.next()?;
    let amount_sats: u64 = args.next()?;
    let memo: Option<String> = args.next()?;
    args.finish()?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    if !address.starts_with("bc1") {
        return Err(Error::logic("invalid address"));
    }
    Ok(Payment {
        amount_sats,
        memo,
        status: PaymentStatus::Completed,
    })
}

async fn echo_after(mut args: Args) -> Result<String> {
    let delay_ms: u64 = args.next()?;
    let text: String = args.next()?;
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Ok(text)
}

async fn open_wallet_after(mut args: Args) -> Result<OpaqueHandle<Wallet>> {
    let delay_ms: u64 = args.next()?;
    let name: String = args.next()?;
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    let (wallet, _freed) = Wallet::new(&name);
    Ok(args.acquire(wallet))
}

/// Operations shared by the scenario tests.
pub(crate) fn wallet_registry() -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry
        .register_sync("add", |mut args| {
            let a: i64 = args.next()?;
            let b: i64 = args.next()?;
            args.finish()?;
            Ok(a + b)
        })
        .register_sync("wallet_name", |mut args| {
            let wallet: OpaqueHandle<Wallet> = args.next()?;
            args.finish()?;
            Ok(wallet.get()?.name.clone())
        })
        .register_async("pay", pay)
        .register_async("echo_after", echo_after)
        .register_async("open_wallet_after", open_wallet_after);
    registry
}
