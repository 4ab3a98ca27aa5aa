//! Transient staging buffer pool.
//!
//! `update_buffer` and texture uploads borrow short-lived, persistently
//! mapped staging buffers. Small buffers are recycled through this pool;
//! anything larger is destroyed on release rather than hoarded.

use crate::buffer::{BufferDesc, BufferUsage, DeviceBuffer};
use crate::error::Result;
use crate::memory::{AllocationIntent, DeviceMemoryManager};
use std::sync::Arc;

/// Smallest staging buffer ever created.
pub(crate) const MIN_STAGING_BUFFER_SIZE: u64 = 64;
/// Buffers above this size are destroyed instead of pooled on release.
pub(crate) const MAX_POOLED_STAGING_BUFFER_SIZE: u64 = 512;

/// Pool of idle staging buffers, keyed by capacity.
#[derive(Default)]
pub struct StagingPool {
    free: Vec<Arc<DeviceBuffer>>,
}

impl StagingPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of idle pooled buffers.
    pub fn pooled_count(&self) -> usize {
        self.free.len()
    }

    /// Borrow the smallest pooled buffer that fits, creating one on miss.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn acquire(
        &mut self,
        memory: &DeviceMemoryManager,
        size: u64,
    ) -> Result<Arc<DeviceBuffer>> {
        let capacities: Vec<u64> = self.free.iter().map(|b| b.size).collect();
        if let Some(index) = pick_smallest_fit(&capacities, size) {
            return Ok(self.free.swap_remove(index));
        }

        let desc = BufferDesc {
            size: size.max(MIN_STAGING_BUFFER_SIZE),
            usage: BufferUsage::STAGING,
        };
        let buffer = DeviceBuffer::new(memory, &desc, &AllocationIntent::staging())?;
        Ok(Arc::new(buffer))
    }

    /// Return a borrowed buffer; small ones are pooled, large ones destroyed.
    ///
    /// # Safety
    /// The device must be valid and the buffer must no longer be in use by
    /// any in-flight submission.
    pub(crate) unsafe fn release(
        &mut self,
        device: &ash::Device,
        memory: &DeviceMemoryManager,
        buffer: Arc<DeviceBuffer>,
    ) {
        if buffer.size <= MAX_POOLED_STAGING_BUFFER_SIZE {
            self.free.push(buffer);
            return;
        }
        match Arc::try_unwrap(buffer) {
            Ok(buffer) => buffer.destroy(device, memory),
            Err(buffer) => {
                tracing::warn!(size = buffer.size, "staging buffer released while still shared");
            }
        }
    }

    /// Destroy every pooled buffer. Called on pool shutdown only.
    ///
    /// # Safety
    /// The device must be valid and idle.
    pub(crate) unsafe fn drain(&mut self, device: &ash::Device, memory: &DeviceMemoryManager) {
        for buffer in self.free.drain(..) {
            match Arc::try_unwrap(buffer) {
                Ok(buffer) => buffer.destroy(device, memory),
                Err(buffer) => {
                    tracing::warn!(size = buffer.size, "pooled staging buffer leaked at shutdown");
                }
            }
        }
    }
}

/// Index of the smallest capacity satisfying `size`.
fn pick_smallest_fit(capacities: &[u64], size: u64) -> Option<usize> {
    capacities
        .iter()
        .enumerate()
        .filter(|(_, &capacity)| capacity >= size)
        .min_by_key(|(_, &capacity)| capacity)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smallest_fitting_buffer_wins() {
        let capacities = [512, 64, 256, 128];
        assert_eq!(pick_smallest_fit(&capacities, 100), Some(3));
        assert_eq!(pick_smallest_fit(&capacities, 64), Some(1));
        assert_eq!(pick_smallest_fit(&capacities, 300), Some(0));
    }

    #[test]
    fn oversized_requests_miss() {
        assert_eq!(pick_smallest_fit(&[64, 128], 256), None);
        assert_eq!(pick_smallest_fit(&[], 1), None);
    }
}
