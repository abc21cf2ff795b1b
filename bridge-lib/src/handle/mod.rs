//! Resource handle manager
//!
//! Native resources reach the host as opaque [`HandleRef`]s into a
//! generation-checked, reference-counted table. A slot's value is alive iff
//! its refcount is above zero; freeing bumps the generation so any stale
//! reference is detected instead of reading a recycled slot.
//!
//! Refcounts are mutated from explicit disposes, proxy finalizers and native
//! calls concurrently, so every mutation happens under the table lock.

mod proxy;

pub use proxy::OpaqueHandle;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error};

use crate::error::{DecodeError, HandleLifecycleError, Result};

/// An opaque reference to a table slot, one native word on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRef {
    pub index: u32,
    pub generation: u32,
}

impl HandleRef {
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

/// What a `release` did to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other shares remain.
    Shared(usize),
    /// That was the last share; the resource was freed.
    Freed,
}

type Resource = Arc<dyn Any + Send + Sync>;

struct Slot {
    generation: u32,
    refcount: usize,
    value: Option<Resource>,
    type_name: &'static str,
}

#[derive(Default)]
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Slots {
    fn slot_mut(&mut self, handle: HandleRef) -> std::result::Result<&mut Slot, HandleLifecycleError> {
        match self.slots.get_mut(handle.index as usize) {
            None => Err(HandleLifecycleError::Unknown(handle)),
            Some(slot) if slot.generation != handle.generation || slot.refcount == 0 => {
                Err(HandleLifecycleError::Stale(handle))
            }
            Some(slot) => Ok(slot),
        }
    }
}

#[derive(Default)]
pub struct HandleTable {
    inner: Mutex<Slots>,
}

impl HandleTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new resource with a refcount of one.
    pub fn acquire<T: Send + Sync + 'static>(self: &Arc<Self>, value: T) -> OpaqueHandle<T> {
        let raw = self.insert(Arc::new(value), std::any::type_name::<T>());
        OpaqueHandle::adopt(raw, Arc::clone(self))
    }

    fn insert(&self, value: Resource, type_name: &'static str) -> HandleRef {
        let mut slots = self.lock();
        slots.live += 1;
        let handle = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.slots[index as usize];
                slot.refcount = 1;
                slot.value = Some(value);
                slot.type_name = type_name;
                HandleRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = slots.slots.len() as u32;
                slots.slots.push(Slot {
                    generation: 0,
                    refcount: 1,
                    value: Some(value),
                    type_name,
                });
                HandleRef {
                    index,
                    generation: 0,
                }
            }
        };
        drop(slots);
        debug!("acquired handle {} ({})", handle, type_name);
        handle
    }

    /// Add one share to a live resource.
    pub fn share(&self, handle: HandleRef) -> Result<HandleRef> {
        let mut slots = self.lock();
        match slots.slot_mut(handle) {
            Ok(slot) => {
                slot.refcount += 1;
                Ok(handle)
            }
            Err(e) => {
                drop(slots);
                error!("share rejected: {}", e);
                Err(e.into())
            }
        }
    }

    /// Drop one share; the resource is freed when the last share goes.
    ///
    /// Releasing an already-freed handle is rejected and never frees twice.
    pub fn release(&self, handle: HandleRef) -> Result<Released> {
        let freed = {
            let mut slots = self.lock();
            let slot = match slots.slot_mut(handle) {
                Ok(slot) => slot,
                Err(e) => {
                    drop(slots);
                    error!("release rejected: {}", e);
                    return Err(e.into());
                }
            };
            slot.refcount -= 1;
            if slot.refcount > 0 {
                return Ok(Released::Shared(slot.refcount));
            }
            slot.generation = slot.generation.wrapping_add(1);
            let value = slot.value.take();
            slots.free.push(handle.index);
            slots.live -= 1;
            value
        };
        // Dropped outside the lock: a resource may own handles of its own.
        drop(freed);
        debug!("freed handle {}", handle);
        Ok(Released::Freed)
    }

    /// Release every share in `handles`, logging failures.
    pub fn release_all(&self, handles: impl IntoIterator<Item = HandleRef>) {
        for handle in handles {
            let _ = self.release(handle);
        }
    }

    /// A strong reference to the resource, valid even if the handle is freed
    /// while the caller still uses it.
    pub fn get<T: Send + Sync + 'static>(&self, handle: HandleRef) -> Result<Arc<T>> {
        let value = {
            let mut slots = self.lock();
            let slot = slots.slot_mut(handle)?;
            slot.value.clone()
        };
        value
            .and_then(|v| v.downcast::<T>().ok())
            .ok_or_else(|| {
                DecodeError::HandleType {
                    handle,
                    expected: std::any::type_name::<T>(),
                }
                .into()
            })
    }

    /// Current refcount, or `None` once freed.
    pub fn refcount(&self, handle: HandleRef) -> Option<usize> {
        let mut slots = self.lock();
        slots.slot_mut(handle).ok().map(|slot| slot.refcount)
    }

    pub fn type_name(&self, handle: HandleRef) -> Option<&'static str> {
        let mut slots = self.lock();
        slots.slot_mut(handle).ok().map(|slot| slot.type_name)
    }

    /// Number of resources not yet freed.
    pub fn live(&self) -> usize {
        self.lock().live
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let slots = self.lock();
        f.debug_struct("HandleTable")
            .field("slots", &slots.slots.len())
            .field("live", &slots.live)
            .finish()
    }
}
