use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use log::warn;

use super::{HandleRef, HandleTable, Released};
use crate::error::Result;

/// The host-side proxy for one share of a native resource.
///
/// Dropping the proxy is its finalizer: the share is released whenever the
/// proxy becomes unreachable, so a host that forgets to `dispose` still
/// cleans up. A proxy embedded into a second, independently owned value must
/// be [`share`](Self::share)d, never copied.
pub struct OpaqueHandle<T> {
    raw: HandleRef,
    table: Arc<HandleTable>,
    armed: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> OpaqueHandle<T> {
    /// Take ownership of a share already counted in the table.
    pub(crate) fn adopt(raw: HandleRef, table: Arc<HandleTable>) -> Self {
        Self {
            raw,
            table,
            armed: true,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> HandleRef {
        self.raw
    }

    pub fn table(&self) -> &Arc<HandleTable> {
        &self.table
    }

    pub fn get(&self) -> Result<Arc<T>> {
        self.table.get::<T>(self.raw)
    }

    /// A new, independently owned reference to the same resource.
    pub fn share(&self) -> Result<Self> {
        let raw = self.table.share(self.raw)?;
        Ok(Self::adopt(raw, Arc::clone(&self.table)))
    }

    /// Release this share now instead of waiting for the finalizer.
    pub fn dispose(mut self) -> Result<Released> {
        self.armed = false;
        self.table.release(self.raw)
    }

    /// Give up the share without releasing it; the caller now owns it.
    pub fn into_raw(mut self) -> HandleRef {
        self.armed = false;
        self.raw
    }

    pub fn refcount(&self) -> Option<usize> {
        self.table.refcount(self.raw)
    }
}

impl<T> Drop for OpaqueHandle<T> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.table.release(self.raw) {
                warn!("finalizer for handle {} failed: {}", self.raw, e);
            }
        }
    }
}

impl<T> fmt::Debug for OpaqueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("OpaqueHandle").field(&self.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Session {
        name: &'static str,
    }

    #[test]
    fn test_share_is_independent() {
        let table = HandleTable::new();
        let a = table.acquire(Session { name: "wallet" });
        let b = a.share().unwrap();
        assert_eq!(a.refcount(), Some(2));

        drop(a);
        assert_eq!(b.refcount(), Some(1));
        assert_eq!(b.get().unwrap().name, "wallet");

        drop(b);
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn test_dispose_then_finalizer_does_not_double_free() {
        let table = HandleTable::new();
        let a = table.acquire(Session { name: "wallet" });
        let raw = a.raw();
        assert_eq!(a.dispose().unwrap(), Released::Freed);
        assert_eq!(table.refcount(raw), None);
        assert!(table.release(raw).is_err());
    }

    #[test]
    fn test_into_raw_keeps_share() {
        let table = HandleTable::new();
        let raw = table.acquire(Session { name: "node" }).into_raw();
        assert_eq!(table.refcount(raw), Some(1));
        assert_eq!(table.release(raw).unwrap(), Released::Freed);
    }
}
