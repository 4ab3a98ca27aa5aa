//! Device memory management.
//!
//! All device memory flows through the [`DeviceMemoryManager`]: it picks a
//! memory type for each resource, backs small resources from per-type TLSF
//! pools with growing chunks, and routes oversized or driver-preferred
//! resources through the dedicated-allocation path.

use crate::chunk::MemoryChunk;
use crate::error::{GpuError, Result};
use crate::format::align_up;
use crate::tlsf::{ChunkBackend, ChunkId, Tlsf, TlsfToken};
use ash::vk;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

/// Minimum alignment of every device memory range.
pub const MIN_ALLOCATION_ALIGNMENT: u64 = 64;
/// First chunk size of a pooled allocator.
const INITIAL_CHUNK_SIZE: u64 = 64 * 1024;
/// Chunk growth stops doubling at this size.
const MAX_CHUNK_SIZE: u64 = 256 * 1024 * 1024;
/// Default size at which an allocation is forced onto the dedicated path.
pub const DEFAULT_DEDICATED_THRESHOLD: u64 = 256 * 1024 * 1024;

bitflags! {
    /// Allocation behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryFlags: u32 {
        /// Force a standalone chunk bound via the dedicated-allocation path.
        const DEDICATED = 1 << 0;
        /// Persistently map the chunk; the range exposes a host pointer.
        const MAPPED = 1 << 1;
        /// The host writes sequentially; prefer write-combined memory.
        const MAPPABLE_FOR_SEQUENTIAL_WRITE = 1 << 2;
        /// The host reads back; prefer cached memory.
        const MAPPABLE_FOR_RANDOM_ACCESS = 1 << 3;
        /// A staging fallback exists, so non-host-visible memory is allowed.
        const ALLOW_TRANSFER = 1 << 4;
        /// Only allocate from existing chunks; never grow.
        const NEVER_ALLOCATE = 1 << 5;
        /// The resource needs transfer-source and transfer-destination usage.
        const REQUIRED_TRANSFER = 1 << 6;
    }
}

/// Broad placement preference for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryUsage {
    /// No placement preference.
    #[default]
    Default,
    /// Prefer device-local memory.
    PreferDevice,
    /// Prefer host memory.
    PreferHost,
}

/// Caller intent for one allocation.
#[derive(Debug, Clone, Default)]
pub struct AllocationIntent {
    /// Placement preference.
    pub usage: MemoryUsage,
    /// Property flags the memory type must have.
    pub required_flags: vk::MemoryPropertyFlags,
    /// Property flags that lower a type's cost when present.
    pub preferred_flags: vk::MemoryPropertyFlags,
    /// Behavior flags.
    pub flags: MemoryFlags,
}

impl AllocationIntent {
    /// Device-local resource with no host access.
    pub fn device_only() -> Self {
        Self {
            usage: MemoryUsage::PreferDevice,
            ..Self::default()
        }
    }

    /// Persistently mapped upload memory for sequential host writes.
    pub fn upload() -> Self {
        Self {
            usage: MemoryUsage::PreferHost,
            flags: MemoryFlags::MAPPED | MemoryFlags::MAPPABLE_FOR_SEQUENTIAL_WRITE,
            ..Self::default()
        }
    }

    /// Persistently mapped staging memory, coherent when available.
    pub fn staging() -> Self {
        Self {
            usage: MemoryUsage::PreferHost,
            required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            preferred_flags: vk::MemoryPropertyFlags::HOST_COHERENT,
            flags: MemoryFlags::MAPPED | MemoryFlags::REQUIRED_TRANSFER,
            ..Self::default()
        }
    }

    /// Persistently mapped readback memory for random host access.
    pub fn readback() -> Self {
        Self {
            usage: MemoryUsage::PreferHost,
            flags: MemoryFlags::MAPPED | MemoryFlags::MAPPABLE_FOR_RANDOM_ACCESS,
            ..Self::default()
        }
    }
}

/// Identifies one suballocator: a memory type plus the alignment/linearity
/// class it serves. A zero alignment-and-linear field denotes the dedicated
/// allocator for that type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AllocatorKey {
    memory_type: u32,
    align_linear: u64,
}

impl AllocatorKey {
    fn pooled(memory_type: u32, alignment: u64, linear: bool) -> Self {
        debug_assert!(alignment.is_power_of_two() && alignment >= MIN_ALLOCATION_ALIGNMENT);
        Self {
            memory_type,
            align_linear: alignment | u64::from(linear),
        }
    }

    fn dedicated(memory_type: u32) -> Self {
        Self {
            memory_type,
            align_linear: 0,
        }
    }

    fn is_dedicated(self) -> bool {
        self.align_linear == 0
    }

    fn alignment(self) -> u64 {
        self.align_linear & !1
    }

    fn is_linear(self) -> bool {
        self.align_linear & 1 == 1
    }
}

/// A range of device memory backing one resource.
///
/// Pooled ranges carry the TLSF token used to return them; dedicated ranges
/// have no token because the chunk is the allocation.
pub struct MemoryRange {
    pub(crate) chunk: Arc<MemoryChunk>,
    /// Offset of the range within its chunk.
    pub offset: u64,
    /// Size of the range in bytes.
    pub size: u64,
    /// Alignment the range was allocated with.
    pub alignment: u64,
    pub(crate) token: Option<TlsfToken>,
    pub(crate) key: AllocatorKey,
    pub(crate) persistent_ptr: Option<NonNull<u8>>,
}

// The persistent pointer stays valid for the lifetime of the range and is
// only written through exclusive access or external synchronization.
unsafe impl Send for MemoryRange {}
unsafe impl Sync for MemoryRange {}

impl MemoryRange {
    /// Whether this range is a dedicated allocation.
    pub fn is_dedicated(&self) -> bool {
        self.token.is_none()
    }

    /// The backing chunk.
    pub fn chunk(&self) -> &Arc<MemoryChunk> {
        &self.chunk
    }

    /// Host pointer to the start of the range while persistently mapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.persistent_ptr
    }

    /// Write bytes into the persistently mapped range.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("memory range is not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "write range exceeds allocation".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }
}

/// Memory requirements of a created resource, plus the driver's dedicated
/// allocation hints.
struct ResourceRequirements {
    size: u64,
    alignment: u64,
    memory_type_bits: u32,
    prefers_dedicated: bool,
    requires_dedicated: bool,
    linear: bool,
    target: DedicatedTarget,
}

#[derive(Clone, Copy)]
enum DedicatedTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// Device limits the manager needs.
#[derive(Debug, Clone, Copy)]
pub struct MemoryManagerConfig {
    /// Per-allocation size limit from the device.
    pub max_allocation_size: u64,
    /// Flush/invalidate granularity of non-coherent host-visible memory.
    pub non_coherent_atom_size: u64,
    /// Whether the GPU shares memory with the host.
    pub is_integrated: bool,
    /// Size at which allocations are forced onto the dedicated path.
    pub dedicated_threshold: u64,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            max_allocation_size: u64::from(u32::MAX),
            non_coherent_atom_size: 256,
            is_integrated: false,
            dedicated_threshold: DEFAULT_DEDICATED_THRESHOLD,
        }
    }
}

/// Chunk backend that grows by allocating device memory, doubling the chunk
/// size from 64 KiB up to the 256 MiB cap.
pub(crate) struct DeviceChunkPool {
    device: Arc<ash::Device>,
    memory_type: u32,
    linear: bool,
    next_chunk_size: u64,
    chunks: Vec<Option<Arc<MemoryChunk>>>,
}

impl DeviceChunkPool {
    fn new(device: Arc<ash::Device>, memory_type: u32, linear: bool) -> Self {
        Self {
            device,
            memory_type,
            linear,
            next_chunk_size: INITIAL_CHUNK_SIZE,
            chunks: Vec::new(),
        }
    }

    pub(crate) fn chunk(&self, id: ChunkId) -> &Arc<MemoryChunk> {
        self.chunks[id.0 as usize]
            .as_ref()
            .expect("chunk id refers to a released chunk")
    }

    fn store(&mut self, chunk: Arc<MemoryChunk>) -> ChunkId {
        if let Some(slot) = self.chunks.iter().position(Option::is_none) {
            self.chunks[slot] = Some(chunk);
            ChunkId(slot as u32)
        } else {
            self.chunks.push(Some(chunk));
            ChunkId((self.chunks.len() - 1) as u32)
        }
    }

    /// Destroy every remaining chunk. Called on manager shutdown only.
    fn destroy_all(&mut self) {
        for chunk in self.chunks.drain(..).flatten() {
            unsafe { chunk.destroy(&self.device) };
        }
    }
}

impl ChunkBackend for DeviceChunkPool {
    fn try_allocate_chunk(&mut self, min_size: u64) -> Option<(ChunkId, u64)> {
        let min_size = align_up(min_size, MIN_ALLOCATION_ALIGNMENT);
        let size = self.next_chunk_size.max(min_size);

        let chunk = unsafe {
            MemoryChunk::allocate(&self.device, size, self.memory_type, self.linear, None, None)
        }
        .or_else(|_| {
            // The doubled size may not fit; fall back to the exact request
            unsafe {
                MemoryChunk::allocate(
                    &self.device,
                    min_size,
                    self.memory_type,
                    self.linear,
                    None,
                    None,
                )
            }
        });

        match chunk {
            Ok(chunk) => {
                let actual = chunk.size();
                tracing::debug!(
                    memory_type = self.memory_type,
                    size = actual,
                    "grew pooled memory chunk"
                );
                self.next_chunk_size = (self.next_chunk_size * 2).min(MAX_CHUNK_SIZE);
                Some((self.store(Arc::new(chunk)), actual))
            }
            Err(_) => None,
        }
    }

    fn free_chunk(&mut self, chunk: ChunkId) {
        if let Some(chunk) = self.chunks[chunk.0 as usize].take() {
            tracing::debug!(
                memory_type = self.memory_type,
                size = chunk.size(),
                "released empty memory chunk"
            );
            unsafe { chunk.destroy(&self.device) };
        }
    }
}

type PooledAllocator = Mutex<Tlsf<DeviceChunkPool>>;

/// Chooses memory types and owns every memory chunk of a device.
///
/// The key map is guarded by a master lock; each pooled allocator carries its
/// own lock so allocations in distinct pools proceed in parallel.
pub struct DeviceMemoryManager {
    device: Arc<ash::Device>,
    memory_props: vk::PhysicalDeviceMemoryProperties,
    config: MemoryManagerConfig,
    pools: Mutex<HashMap<AllocatorKey, Arc<PooledAllocator>>>,
}

impl DeviceMemoryManager {
    /// Create a manager for a device.
    pub fn new(
        device: Arc<ash::Device>,
        memory_props: vk::PhysicalDeviceMemoryProperties,
        config: MemoryManagerConfig,
    ) -> Self {
        Self {
            device,
            memory_props,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Create a buffer and bind it to freshly allocated memory.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_buffer(
        &self,
        info: &vk::BufferCreateInfo,
        intent: &AllocationIntent,
    ) -> Result<(vk::Buffer, MemoryRange)> {
        let buffer = self.device.create_buffer(info, None)?;

        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut reqs = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        let req_info = vk::BufferMemoryRequirementsInfo2::default().buffer(buffer);
        self.device.get_buffer_memory_requirements2(&req_info, &mut reqs);
        let memory_requirements = reqs.memory_requirements;

        let requirements = ResourceRequirements {
            size: memory_requirements.size,
            alignment: memory_requirements.alignment,
            memory_type_bits: memory_requirements.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
            linear: true,
            target: DedicatedTarget::Buffer(buffer),
        };

        match self.allocate(&requirements, intent) {
            Ok(range) => {
                if let Err(e) = self
                    .device
                    .bind_buffer_memory(buffer, range.chunk.memory(), range.offset)
                {
                    self.free(range);
                    self.device.destroy_buffer(buffer, None);
                    return Err(e.into());
                }
                Ok((buffer, range))
            }
            Err(e) => {
                self.device.destroy_buffer(buffer, None);
                Err(e)
            }
        }
    }

    /// Create an image and bind it to freshly allocated memory.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create_image(
        &self,
        info: &vk::ImageCreateInfo,
        intent: &AllocationIntent,
    ) -> Result<(vk::Image, MemoryRange)> {
        let image = self.device.create_image(info, None)?;

        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut reqs = vk::MemoryRequirements2::default().push_next(&mut dedicated);
        let req_info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        self.device.get_image_memory_requirements2(&req_info, &mut reqs);
        let memory_requirements = reqs.memory_requirements;

        let requirements = ResourceRequirements {
            size: memory_requirements.size,
            alignment: memory_requirements.alignment,
            memory_type_bits: memory_requirements.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
            linear: info.tiling == vk::ImageTiling::LINEAR,
            target: DedicatedTarget::Image(image),
        };

        match self.allocate(&requirements, intent) {
            Ok(range) => {
                if let Err(e) =
                    self.device
                        .bind_image_memory(image, range.chunk.memory(), range.offset)
                {
                    self.free(range);
                    self.device.destroy_image(image, None);
                    return Err(e.into());
                }
                Ok((image, range))
            }
            Err(e) => {
                self.device.destroy_image(image, None);
                Err(e)
            }
        }
    }

    /// Return a range to its allocator.
    ///
    /// # Safety
    /// The device must be valid and the resource bound to the range must no
    /// longer be in use.
    pub unsafe fn free(&self, range: MemoryRange) {
        if range.persistent_ptr.is_some() {
            range.chunk.unmap(&self.device);
        }

        match range.token {
            Some(token) => {
                let allocator = {
                    let pools = self.pools.lock();
                    pools
                        .get(&range.key)
                        .expect("range freed against unknown allocator")
                        .clone()
                };
                allocator.lock().free(token);
            }
            None => {
                // Dedicated: the chunk is the allocation
                range.chunk.destroy(&self.device);
            }
        }
    }

    /// Destroy every chunk still owned by the manager.
    ///
    /// This must be called before the device is destroyed; any remaining
    /// allocation is a leak and is logged.
    ///
    /// # Safety
    /// The device must be valid and idle.
    pub unsafe fn shutdown(&self) {
        let mut pools = self.pools.lock();
        for (key, allocator) in pools.drain() {
            let mut allocator = allocator.lock();
            let live = allocator
                .backend()
                .chunks
                .iter()
                .filter(|c| c.is_some())
                .count();
            if live > 0 {
                tracing::warn!(?key, chunks = live, "leaked memory chunks at shutdown");
            }
            allocator.backend_mut().destroy_all();
        }
    }

    fn allocate(&self, reqs: &ResourceRequirements, intent: &AllocationIntent) -> Result<MemoryRange> {
        let size = align_up(reqs.size, MIN_ALLOCATION_ALIGNMENT);
        let limit = self.config.max_allocation_size.min(i32::MAX as u64);
        if size > limit {
            return Err(GpuError::OversizedAllocation { size, limit });
        }

        let base_alignment = reqs.alignment.max(MIN_ALLOCATION_ALIGNMENT);
        let dedicated = intent.flags.contains(MemoryFlags::DEDICATED)
            || size >= self.config.dedicated_threshold
            || reqs.requires_dedicated
            || reqs.prefers_dedicated;

        let (required, preferred, not_preferred) =
            property_preferences(intent, self.config.is_integrated);

        let mut mask = reqs.memory_type_bits;
        loop {
            let Some(type_index) = pick_memory_type(
                &self.memory_props,
                mask,
                required,
                preferred,
                not_preferred,
            ) else {
                return Err(GpuError::OutOfMemory { size });
            };

            let type_flags =
                self.memory_props.memory_types[type_index as usize].property_flags;
            let mut alignment = base_alignment;
            if type_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
                && !type_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
            {
                alignment =
                    alignment.max(self.config.non_coherent_atom_size.next_power_of_two());
            }

            let attempt = if dedicated {
                if intent.flags.contains(MemoryFlags::NEVER_ALLOCATE) {
                    None
                } else {
                    self.allocate_dedicated(type_index, size, alignment, reqs)
                }
            } else {
                self.allocate_pooled(
                    type_index,
                    size,
                    alignment,
                    reqs.linear,
                    intent.flags.contains(MemoryFlags::NEVER_ALLOCATE),
                )
            };

            if let Some(mut range) = attempt {
                if intent.flags.contains(MemoryFlags::MAPPED) {
                    let base = unsafe { range.chunk.map(&self.device) };
                    match base {
                        Ok(base) => {
                            range.persistent_ptr =
                                NonNull::new(unsafe { base.as_ptr().add(range.offset as usize) });
                        }
                        Err(e) => {
                            unsafe { self.free(range) };
                            return Err(e);
                        }
                    }
                }
                tracing::trace!(
                    size,
                    offset = range.offset,
                    memory_type = type_index,
                    dedicated = range.is_dedicated(),
                    "allocated device memory"
                );
                return Ok(range);
            }

            // This type could not provide the range; retry without it
            mask &= !(1 << type_index);
        }
    }

    fn allocate_dedicated(
        &self,
        type_index: u32,
        size: u64,
        alignment: u64,
        reqs: &ResourceRequirements,
    ) -> Option<MemoryRange> {
        let (buffer, image) = match reqs.target {
            DedicatedTarget::Buffer(b) => (Some(b), None),
            DedicatedTarget::Image(i) => (None, Some(i)),
        };
        let chunk = unsafe {
            MemoryChunk::allocate(&self.device, size, type_index, reqs.linear, buffer, image)
        }
        .ok()?;
        Some(MemoryRange {
            chunk: Arc::new(chunk),
            offset: 0,
            size,
            alignment,
            token: None,
            key: AllocatorKey::dedicated(type_index),
            persistent_ptr: None,
        })
    }

    fn allocate_pooled(
        &self,
        type_index: u32,
        size: u64,
        alignment: u64,
        linear: bool,
        existing_only: bool,
    ) -> Option<MemoryRange> {
        let key = AllocatorKey::pooled(type_index, alignment, linear);
        let allocator = {
            let mut pools = self.pools.lock();
            pools
                .entry(key)
                .or_insert_with(|| {
                    tracing::debug!(
                        memory_type = type_index,
                        alignment,
                        linear,
                        "created pooled allocator"
                    );
                    Arc::new(Mutex::new(Tlsf::new(
                        DeviceChunkPool::new(self.device.clone(), type_index, linear),
                        alignment,
                    )))
                })
                .clone()
        };

        let mut allocator = allocator.lock();
        let allocation = if existing_only {
            allocator.try_allocate_existing(size)
        } else {
            allocator.try_allocate(size)
        }?;

        let chunk = allocator.backend().chunk(allocation.chunk).clone();
        Some(MemoryRange {
            chunk,
            offset: allocation.offset,
            size: allocation.size,
            alignment,
            token: Some(allocation.token),
            key,
            persistent_ptr: None,
        })
    }
}

/// Translate an allocation intent into required / preferred / not-preferred
/// property flags.
fn property_preferences(
    intent: &AllocationIntent,
    is_integrated: bool,
) -> (
    vk::MemoryPropertyFlags,
    vk::MemoryPropertyFlags,
    vk::MemoryPropertyFlags,
) {
    let mut required = intent.required_flags;
    let mut preferred = intent.preferred_flags;
    let mut not_preferred = vk::MemoryPropertyFlags::empty();

    if intent.flags.contains(MemoryFlags::MAPPED) {
        required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
    }

    let transfer_fallback = intent.flags.contains(MemoryFlags::ALLOW_TRANSFER)
        && intent.usage == MemoryUsage::PreferDevice
        && !is_integrated;

    if intent.flags.contains(MemoryFlags::MAPPABLE_FOR_RANDOM_ACCESS) {
        preferred |= vk::MemoryPropertyFlags::HOST_CACHED;
        if transfer_fallback {
            preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
        } else {
            required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
        }
    } else if intent
        .flags
        .contains(MemoryFlags::MAPPABLE_FOR_SEQUENTIAL_WRITE)
    {
        // Write-combined memory serves sequential writes best
        not_preferred |= vk::MemoryPropertyFlags::HOST_CACHED;
        if transfer_fallback {
            preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
        } else {
            required |= vk::MemoryPropertyFlags::HOST_VISIBLE;
            match intent.usage {
                MemoryUsage::PreferDevice => {
                    preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
                }
                MemoryUsage::PreferHost => {
                    not_preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
                }
                MemoryUsage::Default => {}
            }
        }
    } else if intent.usage != MemoryUsage::PreferHost {
        // No host access at all
        preferred |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
    }

    (required, preferred, not_preferred)
}

/// Pick the memory type with the lowest preference cost.
///
/// Cost counts preferred bits the type lacks plus not-preferred bits it has;
/// a zero-cost type wins immediately.
fn pick_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    mask: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
    not_preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;

    for index in 0..props.memory_type_count {
        if mask & (1 << index) == 0 {
            continue;
        }
        let flags = props.memory_types[index as usize].property_flags;
        if !flags.contains(required) {
            continue;
        }

        let missing_preferred = (preferred & !flags).as_raw().count_ones();
        let unwanted = (flags & not_preferred).as_raw().count_ones();
        let cost = missing_preferred + unwanted;
        if cost == 0 {
            return Some(index);
        }
        if best.map_or(true, |(best_cost, _)| cost < best_cost) {
            best = Some((cost, index));
        }
    }

    best.map(|(_, index)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
            props.memory_types[i].heap_index = 0;
        }
        props
    }

    const DEVICE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;

    #[test]
    fn allocator_key_encoding() {
        let pooled = AllocatorKey::pooled(3, 256, true);
        assert!(!pooled.is_dedicated());
        assert_eq!(pooled.alignment(), 256);
        assert!(pooled.is_linear());

        let optimal = AllocatorKey::pooled(3, 256, false);
        assert_ne!(pooled, optimal);
        assert!(!optimal.is_linear());

        let dedicated = AllocatorKey::dedicated(3);
        assert!(dedicated.is_dedicated());
    }

    #[test]
    fn zero_cost_type_wins_early() {
        let props = props(&[
            HOST,
            DEVICE,
            DEVICE | HOST,
        ]);
        let picked = pick_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::empty(),
            DEVICE,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn lowest_cost_type_is_picked() {
        let props = props(&[
            HOST | vk::MemoryPropertyFlags::HOST_CACHED,
            HOST,
        ]);
        // HOST_CACHED is unwanted, so type 1 costs less
        let picked = pick_memory_type(
            &props,
            0b11,
            HOST,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::HOST_CACHED,
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn required_flags_filter_types() {
        let props = props(&[DEVICE, HOST]);
        let picked = pick_memory_type(
            &props,
            0b11,
            HOST,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));

        // Masked-out types are skipped even when they match
        let picked = pick_memory_type(
            &props,
            0b01,
            HOST,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, None);
    }

    #[test]
    fn random_access_requires_host_visible() {
        let intent = AllocationIntent {
            flags: MemoryFlags::MAPPABLE_FOR_RANDOM_ACCESS,
            ..Default::default()
        };
        let (required, preferred, _) = property_preferences(&intent, false);
        assert!(required.contains(HOST));
        assert!(preferred.contains(vk::MemoryPropertyFlags::HOST_CACHED));
    }

    #[test]
    fn random_access_with_transfer_fallback_prefers_device() {
        let intent = AllocationIntent {
            usage: MemoryUsage::PreferDevice,
            flags: MemoryFlags::MAPPABLE_FOR_RANDOM_ACCESS | MemoryFlags::ALLOW_TRANSFER,
            ..Default::default()
        };
        let (required, preferred, _) = property_preferences(&intent, false);
        assert!(!required.contains(HOST));
        assert!(preferred.contains(DEVICE));

        // Integrated GPUs keep the host-visible requirement
        let (required, _, _) = property_preferences(&intent, true);
        assert!(required.contains(HOST));
    }

    #[test]
    fn sequential_write_avoids_cached_memory() {
        let intent = AllocationIntent {
            usage: MemoryUsage::PreferHost,
            flags: MemoryFlags::MAPPABLE_FOR_SEQUENTIAL_WRITE,
            ..Default::default()
        };
        let (required, _, not_preferred) = property_preferences(&intent, false);
        assert!(required.contains(HOST));
        assert!(not_preferred.contains(vk::MemoryPropertyFlags::HOST_CACHED));
        assert!(not_preferred.contains(DEVICE));
    }

    #[test]
    fn no_host_access_prefers_device_local() {
        let intent = AllocationIntent::device_only();
        let (required, preferred, _) = property_preferences(&intent, false);
        assert!(required.is_empty());
        assert!(preferred.contains(DEVICE));

        let host_intent = AllocationIntent {
            usage: MemoryUsage::PreferHost,
            ..Default::default()
        };
        let (_, preferred, _) = property_preferences(&host_intent, false);
        assert!(!preferred.contains(DEVICE));
    }

    #[test]
    fn mapped_flag_requires_host_visible() {
        let intent = AllocationIntent {
            flags: MemoryFlags::MAPPED,
            ..Default::default()
        };
        let (required, _, _) = property_preferences(&intent, false);
        assert!(required.contains(HOST));
    }
}
