//! Recyclable synchronization primitives.
//!
//! Fences and binary semaphores are checked out of a pool for one submission
//! and returned only once the GPU is provably done with them.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use ash::vk;
use hashbrown::HashSet;
use parking_lot::Mutex;

use crate::device::RawDevice;
use crate::error::{GpuError, Result};

/// A primitive that can live in a [`RecyclePool`].
pub trait PoolPrimitive: Copy + Eq + Hash + Debug + Send + 'static {
    /// Human-readable name for logs and errors.
    const NAME: &'static str;

    /// Allocate a new native primitive.
    fn allocate(device: &dyn RawDevice) -> Result<Self>;

    /// Destroy the native primitive.
    fn destroy(self, device: &dyn RawDevice);
}

impl PoolPrimitive for vk::Fence {
    const NAME: &'static str = "fence";

    fn allocate(device: &dyn RawDevice) -> Result<Self> {
        device.create_fence()
    }

    fn destroy(self, device: &dyn RawDevice) {
        device.destroy_fence(self);
    }
}

impl PoolPrimitive for vk::Semaphore {
    const NAME: &'static str = "semaphore";

    fn allocate(device: &dyn RawDevice) -> Result<Self> {
        device.create_semaphore()
    }

    fn destroy(self, device: &dyn RawDevice) {
        device.destroy_semaphore(self);
    }
}

struct PoolState<P> {
    free: Vec<P>,
    checked_out: HashSet<P>,
    destroyed: bool,
}

/// A pool of reusable synchronization primitives.
pub struct RecyclePool<P: PoolPrimitive> {
    device: Arc<dyn RawDevice>,
    state: Mutex<PoolState<P>>,
}

/// Pool of unsignaled fences.
pub type FencePool = RecyclePool<vk::Fence>;

/// Pool of unsignaled binary semaphores.
pub type SemaphorePool = RecyclePool<vk::Semaphore>;

impl<P: PoolPrimitive> RecyclePool<P> {
    /// Create an empty pool. Primitives are allocated lazily.
    pub fn new(device: Arc<dyn RawDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                checked_out: HashSet::new(),
                destroyed: false,
            }),
        }
    }

    /// Check out a primitive, reusing a free one when possible.
    pub fn create(&self) -> Result<P> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(GpuError::InvalidState(format!(
                "{} pool already destroyed",
                P::NAME
            )));
        }

        let primitive = match state.free.pop() {
            Some(primitive) => primitive,
            None => {
                let primitive = P::allocate(self.device.as_ref()).map_err(|e| {
                    GpuError::ResourceExhausted(format!("failed to allocate {}: {e}", P::NAME))
                })?;
                tracing::debug!(
                    "Allocated {} {:?} ({} total)",
                    P::NAME,
                    primitive,
                    state.checked_out.len() + 1
                );
                primitive
            }
        };

        state.checked_out.insert(primitive);
        Ok(primitive)
    }

    /// Return a primitive the GPU no longer uses.
    pub fn release(&self, primitive: P) {
        let mut state = self.state.lock();
        if state.checked_out.remove(&primitive) {
            state.free.push(primitive);
        } else {
            tracing::warn!("Released {} {:?} that was not checked out", P::NAME, primitive);
        }
    }

    /// Destroy a checked-out primitive that must never be reused.
    pub fn discard(&self, primitive: P) {
        let mut state = self.state.lock();
        if state.checked_out.remove(&primitive) {
            primitive.destroy(self.device.as_ref());
        } else {
            tracing::warn!("Discarded {} {:?} that was not checked out", P::NAME, primitive);
        }
    }

    /// Whether the primitive is currently checked out.
    #[must_use]
    pub fn is_checked_out(&self, primitive: P) -> bool {
        self.state.lock().checked_out.contains(&primitive)
    }

    /// Number of primitives currently checked out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().checked_out.len()
    }

    /// Number of primitives waiting for reuse.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Total number of live native primitives.
    #[must_use]
    pub fn allocated(&self) -> usize {
        let state = self.state.lock();
        state.free.len() + state.checked_out.len()
    }

    /// Destroy every primitive.
    ///
    /// Only valid after a device-idle wait. Calling it again is a no-op.
    pub fn destroy_all(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        if !state.checked_out.is_empty() {
            tracing::warn!(
                "Destroying {} pool with {} primitives still checked out",
                P::NAME,
                state.checked_out.len()
            );
        }

        let device = self.device.as_ref();
        for primitive in state.free.drain(..) {
            primitive.destroy(device);
        }
        for primitive in state.checked_out.drain() {
            primitive.destroy(device);
        }
        state.destroyed = true;
    }
}

impl<P: PoolPrimitive> Drop for RecyclePool<P> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
