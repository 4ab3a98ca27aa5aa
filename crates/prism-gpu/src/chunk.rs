//! Device memory chunks and their ref-counted persistent mapping.

use crate::error::Result;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::ptr::NonNull;

/// Host mapping state of a chunk.
///
/// The pointer is valid iff `refs > 0`; the real `vkMapMemory` happens on the
/// 0 -> 1 transition and the real `vkUnmapMemory` on 1 -> 0. Persistent
/// mappings hold one permanent reference for their whole lifetime.
struct MappedState {
    ptr: *mut c_void,
    refs: u32,
}

/// A single `VkDeviceMemory` allocation, used as backing store for one
/// dedicated resource or for many suballocated ranges.
pub struct MemoryChunk {
    memory: vk::DeviceMemory,
    size: u64,
    memory_type: u32,
    linear: bool,
    mapped: Mutex<MappedState>,
}

// The raw mapped pointer is only dereferenced through ranges that own a map
// reference, and all mutation of the state goes through the mutex.
unsafe impl Send for MemoryChunk {}
unsafe impl Sync for MemoryChunk {}

impl MemoryChunk {
    /// Allocate a chunk of device memory.
    ///
    /// `dedicated_buffer`/`dedicated_image` request the driver's dedicated
    /// allocation path for exactly that resource.
    ///
    /// # Safety
    /// The device must be valid; at most one of the dedicated handles may be
    /// set and it must belong to the device.
    pub unsafe fn allocate(
        device: &ash::Device,
        size: u64,
        memory_type: u32,
        linear: bool,
        dedicated_buffer: Option<vk::Buffer>,
        dedicated_image: Option<vk::Image>,
    ) -> Result<Self> {
        debug_assert!(dedicated_buffer.is_none() || dedicated_image.is_none());

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default()
            .buffer(dedicated_buffer.unwrap_or(vk::Buffer::null()))
            .image(dedicated_image.unwrap_or(vk::Image::null()));

        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        if dedicated_buffer.is_some() || dedicated_image.is_some() {
            alloc_info = alloc_info.push_next(&mut dedicated_info);
        }

        let memory = device.allocate_memory(&alloc_info, None)?;
        tracing::trace!(size, memory_type, linear, "allocated memory chunk");

        Ok(Self {
            memory,
            size,
            memory_type,
            linear,
            mapped: Mutex::new(MappedState {
                ptr: std::ptr::null_mut(),
                refs: 0,
            }),
        })
    }

    /// Get the raw device memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Get the chunk size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the memory type index this chunk was allocated from.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type
    }

    /// Whether this chunk backs linearly tiled resources.
    pub fn is_linear(&self) -> bool {
        self.linear
    }

    /// Map the chunk, incrementing the map reference count.
    ///
    /// # Safety
    /// The device must be valid and the chunk's memory type must be
    /// host-visible.
    pub unsafe fn map(&self, device: &ash::Device) -> Result<NonNull<u8>> {
        let mut state = self.mapped.lock();
        if state.refs == 0 {
            let ptr = device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
            state.ptr = ptr;
        }
        state.refs += 1;
        debug_assert!(!state.ptr.is_null());
        Ok(NonNull::new_unchecked(state.ptr.cast()))
    }

    /// Drop one map reference, unmapping on the last one.
    ///
    /// # Safety
    /// The device must be valid and the caller must hold a map reference.
    pub unsafe fn unmap(&self, device: &ash::Device) {
        let mut state = self.mapped.lock();
        debug_assert!(state.refs > 0, "unmap without outstanding map");
        state.refs -= 1;
        if state.refs == 0 {
            device.unmap_memory(self.memory);
            state.ptr = std::ptr::null_mut();
        }
    }

    /// Host pointer to the chunk base while mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        let state = self.mapped.lock();
        if state.refs > 0 {
            NonNull::new(state.ptr.cast())
        } else {
            None
        }
    }

    /// Number of outstanding map references.
    pub fn map_ref_count(&self) -> u32 {
        self.mapped.lock().refs
    }

    /// Free the underlying device memory.
    ///
    /// # Safety
    /// The device must be valid, no range in the chunk may be live, and all
    /// map references must have been released.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        debug_assert_eq!(
            self.map_ref_count(),
            0,
            "chunk destroyed while still mapped"
        );
        device.free_memory(self.memory, None);
    }
}
