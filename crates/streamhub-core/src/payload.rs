//! Generation-stamped payload buffer pool.
//!
//! Received argument payloads are copied into recycled buffers for the
//! duration of a dispatch and returned afterwards, so steady-state traffic
//! does not allocate per frame.
//!
//! # Handles
//!
//! A [`PayloadHandle`] is a slot index plus the slot's generation at rent
//! time. Returning a slot bumps its generation, so any later access through
//! an old handle (use after return, double return) fails with
//! [`PoolError::StaleHandle`] instead of reading someone else's bytes.
//!
//! ```text
//!   rent ──> slot 3 gen 7 (occupied) ──release──> slot 3 gen 8 (free)
//!                  ▲                                    │
//!   handle {3, 7} ─┘  with()/release() now fail  <──────┘
//! ```
//!
//! [`PooledPayload`] owns a handle and releases it on drop; dispatch code only
//! ever uses that.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::error::PoolError;

/// Reference to a rented slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadHandle {
    index: u32,
    generation: u32,
}

impl PayloadHandle {
    /// Slot index
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation stamped at rent time
    pub fn generation(self) -> u32 {
        self.generation
    }

    fn stale(self) -> PoolError {
        PoolError::StaleHandle { index: self.index, generation: self.generation }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupied: bool,
    buf: Vec<u8>,
}

/// Pool occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots currently rented
    pub outstanding: usize,
    /// Slots allocated in total (rented plus free)
    pub slots: usize,
}

/// Slab of reusable payload buffers shared by all connections.
#[derive(Debug)]
pub struct PayloadPool {
    slots: RwLock<Vec<Arc<Mutex<Slot>>>>,
    free: Mutex<Vec<u32>>,
    max_retained_capacity: usize,
}

impl Default for PayloadPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_RETAINED_CAPACITY)
    }
}

impl PayloadPool {
    /// Buffers that grew beyond this are dropped on release instead of kept
    pub const DEFAULT_MAX_RETAINED_CAPACITY: usize = 64 * 1024;

    /// Create a pool that keeps buffers up to `max_retained_capacity` bytes
    pub fn new(max_retained_capacity: usize) -> Self {
        Self { slots: RwLock::new(Vec::new()), free: Mutex::new(Vec::new()), max_retained_capacity }
    }

    /// Copy `data` into a free slot.
    pub fn rent(&self, data: &[u8]) -> PayloadHandle {
        let recycled = self.free.lock().pop();
        if let Some(index) = recycled {
            let slot = self.slot(index);
            if let Some(slot) = slot {
                let mut slot = slot.lock();
                slot.buf.clear();
                slot.buf.extend_from_slice(data);
                slot.occupied = true;
                return PayloadHandle { index, generation: slot.generation };
            }
        }

        let slot = Slot { generation: 0, occupied: true, buf: data.to_vec() };
        let mut slots = self.slots.write();
        let index = slots.len() as u32;
        slots.push(Arc::new(Mutex::new(slot)));
        PayloadHandle { index, generation: 0 }
    }

    /// Run `f` over the bytes behind `handle`.
    ///
    /// Only the slot is locked while `f` runs.
    pub fn with<R>(&self, handle: PayloadHandle, f: impl FnOnce(&[u8]) -> R) -> Result<R, PoolError> {
        let slot = self.slot(handle.index).ok_or_else(|| handle.stale())?;
        let slot = slot.lock();
        if !slot.occupied || slot.generation != handle.generation {
            return Err(handle.stale());
        }
        Ok(f(&slot.buf))
    }

    /// Copy the bytes behind `handle` out of the pool
    pub fn to_bytes(&self, handle: PayloadHandle) -> Result<Bytes, PoolError> {
        self.with(handle, Bytes::copy_from_slice)
    }

    /// Return a slot to the pool.
    ///
    /// Returning the same handle twice is a caller bug and is reported as
    /// [`PoolError::StaleHandle`].
    pub fn release(&self, handle: PayloadHandle) -> Result<(), PoolError> {
        let slot = self.slot(handle.index).ok_or_else(|| handle.stale())?;
        {
            let mut slot = slot.lock();
            if !slot.occupied || slot.generation != handle.generation {
                return Err(handle.stale());
            }
            slot.occupied = false;
            slot.generation = slot.generation.wrapping_add(1);
            if slot.buf.capacity() > self.max_retained_capacity {
                slot.buf = Vec::new();
            } else {
                slot.buf.clear();
            }
        }
        self.free.lock().push(handle.index);
        Ok(())
    }

    /// Current occupancy
    pub fn stats(&self) -> PoolStats {
        // New slots need the write lock, so the free list cannot outgrow the
        // slab while the read lock is held
        let slots = self.slots.read();
        let free = self.free.lock().len();
        PoolStats { outstanding: slots.len().saturating_sub(free), slots: slots.len() }
    }

    fn slot(&self, index: u32) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().get(index as usize).cloned()
    }
}

/// A rented payload that returns itself to the pool when dropped.
#[derive(Debug)]
pub struct PooledPayload {
    pool: Arc<PayloadPool>,
    handle: PayloadHandle,
}

impl PooledPayload {
    /// Rent a slot holding a copy of `data`
    pub fn rent(pool: &Arc<PayloadPool>, data: &[u8]) -> Self {
        Self { pool: Arc::clone(pool), handle: pool.rent(data) }
    }

    /// Underlying handle
    pub fn handle(&self) -> PayloadHandle {
        self.handle
    }

    /// Run `f` over the payload bytes
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, PoolError> {
        self.pool.with(self.handle, f)
    }

    /// Copy the payload out
    pub fn to_bytes(&self) -> Result<Bytes, PoolError> {
        self.pool.to_bytes(self.handle)
    }
}

impl Drop for PooledPayload {
    fn drop(&mut self) {
        if let Err(e) = self.pool.release(self.handle) {
            tracing::warn!(error = %e, "payload released twice");
        }
    }
}
