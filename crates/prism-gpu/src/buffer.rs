//! Device buffers.

use crate::error::Result;
use crate::memory::{AllocationIntent, DeviceMemoryManager, MemoryFlags, MemoryRange};
use crate::resource::RefCount;
use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// How a buffer may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferUsage: u32 {
        /// Vertex input.
        const VERTEX = 1 << 0;
        /// Index input.
        const INDEX = 1 << 1;
        /// Uniform buffer.
        const UNIFORM = 1 << 2;
        /// Shader storage buffer.
        const STORAGE = 1 << 3;
        /// Indirect draw/dispatch arguments.
        const INDIRECT = 1 << 4;
        /// Host-visible staging buffer.
        const STAGING = 1 << 5;
    }
}

/// Buffer creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Size in bytes.
    pub size: u64,
    /// Usage flags.
    pub usage: BufferUsage,
}

/// A buffer and the memory range backing it.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub usage: BufferUsage,
    pub(crate) range: MemoryRange,
    pub(crate) refs: RefCount,
}

impl DeviceBuffer {
    /// Create a buffer and bind it to freshly allocated memory.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        memory: &DeviceMemoryManager,
        desc: &BufferDesc,
        intent: &AllocationIntent,
    ) -> Result<Self> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(vk_buffer_usage(desc.usage, intent))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, range) = memory.create_buffer(&info, intent)?;

        Ok(Self {
            buffer,
            size: desc.size,
            usage: desc.usage,
            range,
            refs: RefCount::new(),
        })
    }

    /// Whether this buffer is bound as a uniform buffer.
    pub fn is_uniform(&self) -> bool {
        self.usage.contains(BufferUsage::UNIFORM)
    }

    /// Whether this is a host-visible staging buffer.
    pub fn is_staging(&self) -> bool {
        self.usage.contains(BufferUsage::STAGING)
    }

    /// Host pointer into the buffer while persistently mapped.
    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.range.mapped_ptr()
    }

    /// Write raw bytes at an offset (buffer must be persistently mapped).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.range.write_bytes(offset, data)
    }

    /// Write typed data at an offset (buffer must be persistently mapped).
    pub fn write<T: bytemuck::NoUninit>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Current number of in-flight recordings referencing this buffer.
    pub fn ref_count(&self) -> u32 {
        self.refs.count()
    }

    /// Destroy the buffer and release its memory.
    ///
    /// # Safety
    /// The device must be valid and the buffer must not be referenced by any
    /// in-flight recording.
    pub(crate) unsafe fn destroy(self, device: &ash::Device, memory: &DeviceMemoryManager) {
        debug_assert!(!self.refs.is_in_use(), "buffer destroyed while in use");
        device.destroy_buffer(self.buffer, None);
        memory.free(self.range);
    }
}

fn vk_buffer_usage(usage: BufferUsage, intent: &AllocationIntent) -> vk::BufferUsageFlags {
    // Every buffer can be a copy destination so update_buffer works
    let mut flags = vk::BufferUsageFlags::TRANSFER_DST;
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::STAGING)
        || intent.flags.contains(MemoryFlags::REQUIRED_TRANSFER)
    {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    flags
}

/// Pick an allocation intent for a buffer from its usage.
pub(crate) fn default_intent(usage: BufferUsage) -> AllocationIntent {
    if usage.contains(BufferUsage::STAGING) {
        AllocationIntent::staging()
    } else {
        AllocationIntent::device_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_to_vulkan_flags() {
        let flags = vk_buffer_usage(
            BufferUsage::VERTEX | BufferUsage::UNIFORM,
            &AllocationIntent::device_only(),
        );
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn staging_buffers_are_transfer_sources() {
        let flags = vk_buffer_usage(BufferUsage::STAGING, &AllocationIntent::staging());
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn intent_follows_usage() {
        assert!(default_intent(BufferUsage::STAGING)
            .flags
            .contains(crate::memory::MemoryFlags::MAPPED));
        assert!(default_intent(BufferUsage::VERTEX).flags.is_empty());
    }
}
