//! GPU context management.
//!
//! [`GpuContext`] is the device-scoped owner of everything: the single
//! graphics queue and its submit lock, the memory manager, and the capability
//! probe. All resource construction and destruction funnels through it, so
//! there is no process-global state.

use crate::buffer::{default_intent, BufferDesc, DeviceBuffer};
use crate::capabilities::GpuCapabilities;
use crate::descriptors::{DescriptorPool, PipelineKind, ResourceBinding, ResourceSet};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{
    AllocationIntent, DeviceMemoryManager, MemoryManagerConfig, DEFAULT_DEDICATED_THRESHOLD,
};
use crate::pipeline::{ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig};
use crate::recorder::{CommandPool, CommandRecorder, RecorderState};
use crate::renderpass::{Framebuffer, FramebufferDesc};
use crate::sampler::{Sampler, SamplerDesc};
use crate::sync;
use crate::texture::{Texture, TextureDesc};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: Arc<GpuCapabilities>,
    pub(crate) memory: Arc<DeviceMemoryManager>,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,

    // The single graphics-capable queue
    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,
    submit_lock: Mutex<()>,
    next_serial: AtomicU64,
    completed_serial: AtomicU64,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the device memory manager.
    pub fn memory(&self) -> &DeviceMemoryManager {
        &self.memory
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the swapchain extension loader.
    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    /// Wait for the device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    /// Attach a debug name to a Vulkan object. No-op without debug utils.
    pub fn set_object_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        unsafe {
            let _ = debug_utils.set_debug_utils_object_name(&info);
        }
    }

    /// Open a debug label region on a recording. No-op without debug utils.
    pub fn begin_debug_label(&self, recorder: &CommandRecorder, label: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(label) = CString::new(label) else {
            return;
        };
        let info = vk::DebugUtilsLabelEXT::default().label_name(&label);
        unsafe {
            debug_utils.cmd_begin_debug_utils_label(recorder.command_buffer(), &info);
        }
    }

    /// Close the innermost debug label region. No-op without debug utils.
    pub fn end_debug_label(&self, recorder: &CommandRecorder) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        unsafe {
            debug_utils.cmd_end_debug_utils_label(recorder.command_buffer());
        }
    }

    // ------------------------------------------------------------------
    // Submission

    /// Submit a recorded command buffer to the graphics queue.
    ///
    /// Exactly one submission enters the queue at a time; each gets a
    /// monotonically increasing serial that defines completion order.
    pub fn submit(
        &self,
        recorder: &mut CommandRecorder,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<u64> {
        if recorder.state() != RecorderState::Recorded {
            return Err(GpuError::InvalidState(format!(
                "cannot submit a recorder in {:?}",
                recorder.state()
            )));
        }

        let command_buffers = [recorder.command_buffer()];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .signal_semaphores(signal_semaphores);

        let guard = self.submit_lock.lock();
        let serial = self.next_serial.fetch_add(1, Ordering::AcqRel) + 1;
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)?;
        }
        drop(guard);

        recorder.mark_submitted(serial)?;
        tracing::trace!(serial, "submitted recording");
        Ok(serial)
    }

    /// Wait for a fence with a nanosecond timeout.
    pub fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { sync::wait_for_fence(&self.device, fence, timeout_ns) }
    }

    /// Finalize a submission whose fence has signaled.
    ///
    /// Releases the recording's resource references and staging buffers.
    /// Submissions must be finalized in submission order.
    pub fn finish_submission(&self, recorder: &mut CommandRecorder) -> Result<()> {
        let serial = recorder.submission_serial().ok_or_else(|| {
            GpuError::InvalidState("recorder has no pending submission".to_string())
        })?;
        recorder.submission_complete()?;

        let previous = self.completed_serial.fetch_max(serial, Ordering::AcqRel);
        debug_assert_eq!(
            previous,
            serial - 1,
            "submissions must be finalized in submission order"
        );
        Ok(())
    }

    /// Submit, block on a transient fence, and finalize.
    pub fn submit_and_wait(&self, recorder: &mut CommandRecorder) -> Result<()> {
        let fence = unsafe { sync::create_fence(&self.device, false)? };
        let result = self
            .submit(recorder, &[], &[], &[], fence)
            .and_then(|_| self.wait_for_fence(fence, u64::MAX))
            .and_then(|()| self.finish_submission(recorder));
        unsafe {
            self.device.destroy_fence(fence, None);
        }
        result
    }

    // ------------------------------------------------------------------
    // Resource factories

    /// Create a buffer with a placement derived from its usage.
    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<DeviceBuffer>> {
        self.create_buffer_with(desc, &default_intent(desc.usage))
    }

    /// Create a buffer with an explicit allocation intent.
    pub fn create_buffer_with(
        &self,
        desc: &BufferDesc,
        intent: &AllocationIntent,
    ) -> Result<Arc<DeviceBuffer>> {
        let buffer = unsafe { DeviceBuffer::new(&self.memory, desc, intent)? };
        Ok(Arc::new(buffer))
    }

    /// Destroy a buffer. Fails while any in-flight recording references it.
    pub fn destroy_buffer(&self, buffer: Arc<DeviceBuffer>) -> Result<()> {
        if buffer.refs.is_in_use() {
            return Err(GpuError::InvalidState(
                "buffer is referenced by an in-flight recording".to_string(),
            ));
        }
        match Arc::try_unwrap(buffer) {
            Ok(buffer) => {
                unsafe { buffer.destroy(&self.device, &self.memory) };
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "buffer is still shared".to_string(),
            )),
        }
    }

    /// Create a GPU-owned texture.
    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Arc<Texture>> {
        self.create_texture_with(desc, &AllocationIntent::device_only())
    }

    /// Create a GPU-owned texture with an explicit allocation intent.
    pub fn create_texture_with(
        &self,
        desc: &TextureDesc,
        intent: &AllocationIntent,
    ) -> Result<Arc<Texture>> {
        let format_props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, desc.format)
        };
        let linear_filterable = format_props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR);

        let texture =
            unsafe { Texture::new(&self.device, &self.memory, desc, intent, linear_filterable)? };
        Ok(Arc::new(texture))
    }

    /// Create a host-visible staging texture.
    pub fn create_staging_texture(&self, desc: &TextureDesc) -> Result<Arc<Texture>> {
        let texture = unsafe { Texture::new_staging(&self.memory, desc)? };
        Ok(Arc::new(texture))
    }

    /// Destroy a texture. Fails while any in-flight recording references it.
    pub fn destroy_texture(&self, texture: Arc<Texture>) -> Result<()> {
        if texture.refs.is_in_use() {
            return Err(GpuError::InvalidState(
                "texture is referenced by an in-flight recording".to_string(),
            ));
        }
        match Arc::try_unwrap(texture) {
            Ok(texture) => {
                unsafe { texture.destroy(&self.device, &self.memory) };
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "texture is still shared".to_string(),
            )),
        }
    }

    /// Create a sampler.
    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Arc<Sampler>> {
        let sampler = unsafe { Sampler::new(&self.device, &self.capabilities, desc)? };
        Ok(Arc::new(sampler))
    }

    /// Destroy a sampler.
    pub fn destroy_sampler(&self, sampler: Arc<Sampler>) -> Result<()> {
        if sampler.refs.is_in_use() {
            return Err(GpuError::InvalidState(
                "sampler is referenced by an in-flight recording".to_string(),
            ));
        }
        match Arc::try_unwrap(sampler) {
            Ok(sampler) => {
                unsafe { sampler.destroy(&self.device) };
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "sampler is still shared".to_string(),
            )),
        }
    }

    /// Create a framebuffer and its cached render-pass variants.
    pub fn create_framebuffer(&self, desc: &FramebufferDesc) -> Result<Arc<Framebuffer>> {
        let framebuffer = unsafe { Framebuffer::new(&self.device, desc)? };
        Ok(Arc::new(framebuffer))
    }

    /// Destroy a framebuffer.
    pub fn destroy_framebuffer(&self, framebuffer: Arc<Framebuffer>) -> Result<()> {
        if framebuffer.refs.is_in_use() {
            return Err(GpuError::InvalidState(
                "framebuffer is referenced by an in-flight recording".to_string(),
            ));
        }
        match Arc::try_unwrap(framebuffer) {
            Ok(framebuffer) => {
                unsafe { framebuffer.destroy(&self.device) };
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "framebuffer is still shared".to_string(),
            )),
        }
    }

    /// Create a graphics pipeline.
    pub fn create_graphics_pipeline(
        &self,
        config: &GraphicsPipelineConfig,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Arc<GraphicsPipeline>> {
        let pipeline = unsafe {
            GraphicsPipeline::new(
                &self.device,
                &self.capabilities,
                config,
                set_layouts,
                push_constant_ranges,
            )?
        };
        Ok(Arc::new(pipeline))
    }

    /// Create a compute pipeline.
    pub fn create_compute_pipeline(
        &self,
        shader_code: &[u32],
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Arc<ComputePipeline>> {
        let pipeline = unsafe {
            ComputePipeline::new(
                &self.device,
                &self.capabilities,
                shader_code,
                set_layouts,
                push_constant_ranges,
            )?
        };
        Ok(Arc::new(pipeline))
    }

    /// Destroy a graphics pipeline.
    pub fn destroy_graphics_pipeline(&self, pipeline: Arc<GraphicsPipeline>) -> Result<()> {
        if pipeline.refs.is_in_use() {
            return Err(GpuError::InvalidState(
                "pipeline is referenced by an in-flight recording".to_string(),
            ));
        }
        match Arc::try_unwrap(pipeline) {
            Ok(pipeline) => {
                unsafe { pipeline.destroy(&self.device) };
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "pipeline is still shared".to_string(),
            )),
        }
    }

    /// Destroy a compute pipeline.
    pub fn destroy_compute_pipeline(&self, pipeline: Arc<ComputePipeline>) -> Result<()> {
        if pipeline.refs.is_in_use() {
            return Err(GpuError::InvalidState(
                "pipeline is referenced by an in-flight recording".to_string(),
            ));
        }
        match Arc::try_unwrap(pipeline) {
            Ok(pipeline) => {
                unsafe { pipeline.destroy(&self.device) };
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "pipeline is still shared".to_string(),
            )),
        }
    }

    /// Create a resource set from a layout and its bindings.
    pub fn create_resource_set(
        &self,
        pool: &DescriptorPool,
        layout: vk::DescriptorSetLayout,
        kind: PipelineKind,
        bindings: Vec<ResourceBinding>,
    ) -> Result<Arc<ResourceSet>> {
        let set = unsafe { ResourceSet::new(&self.device, pool, layout, kind, bindings)? };
        Ok(Arc::new(set))
    }

    /// Destroy a resource set, returning it to its descriptor pool.
    pub fn destroy_resource_set(&self, set: Arc<ResourceSet>, pool: &DescriptorPool) -> Result<()> {
        if set.refs.is_in_use() {
            return Err(GpuError::InvalidState(
                "resource set is referenced by an in-flight recording".to_string(),
            ));
        }
        match Arc::try_unwrap(set) {
            Ok(set) => {
                unsafe { set.destroy(&self.device, pool) };
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "resource set is still shared".to_string(),
            )),
        }
    }

    /// Create a descriptor pool.
    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorPool> {
        unsafe { DescriptorPool::new(&self.device, max_sets, pool_sizes) }
    }

    /// Create a command pool on the graphics queue family.
    pub fn create_command_pool(&self, allow_reset: bool) -> Result<CommandPool> {
        unsafe {
            CommandPool::new(
                self.device.clone(),
                self.graphics_queue_family,
                allow_reset,
                self.memory.clone(),
                self.capabilities.clone(),
            )
        }
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Free all device memory BEFORE destroying the device
            self.memory.shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    dedicated_threshold: u64,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            enable_validation: cfg!(debug_assertions),
            dedicated_threshold: DEFAULT_DEDICATED_THRESHOLD,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Size at which allocations bypass the pools for a dedicated chunk.
    pub fn dedicated_threshold(mut self, threshold: u64) -> Self {
        self.dedicated_threshold = threshold;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        // Create Vulkan instance
        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        // Select best physical device
        let physical_device = unsafe { select_physical_device(&instance) }?;

        // Query capabilities
        let capabilities =
            Arc::new(unsafe { GpuCapabilities::query(&instance, physical_device) });

        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        // Find the single graphics-capable queue family
        let graphics_queue_family =
            unsafe { find_graphics_queue_family(&instance, physical_device) }?;

        // Create logical device
        let (device, graphics_queue) = unsafe {
            create_device(
                &instance,
                physical_device,
                graphics_queue_family,
                &capabilities,
            )?
        };
        let device = Arc::new(device);

        let debug_utils = self
            .enable_validation
            .then(|| ash::ext::debug_utils::Device::new(&instance, &device));

        // Create the device memory manager
        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let memory = Arc::new(DeviceMemoryManager::new(
            device.clone(),
            memory_props,
            MemoryManagerConfig {
                max_allocation_size: capabilities.max_allocation_size,
                non_coherent_atom_size: capabilities.non_coherent_atom_size,
                is_integrated: capabilities.is_integrated,
                dedicated_threshold: self.dedicated_threshold,
            },
        ));

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        Ok(GpuContext {
            entry,
            instance,
            debug_utils,
            physical_device,
            device,
            capabilities,
            memory,
            swapchain_loader,
            graphics_queue_family,
            graphics_queue,
            submit_lock: Mutex::new(()),
            next_serial: AtomicU64::new(0),
            completed_serial: AtomicU64::new(0),
        })
    }
}

/// Find a queue family with graphics and compute support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);
    families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device and retrieve the graphics queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
    capabilities: &GpuCapabilities,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = [ash::khr::swapchain::NAME];
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    // Enable the optional features the probe found
    let features = vk::PhysicalDeviceFeatures::default()
        .geometry_shader(capabilities.geometry_shader)
        .tessellation_shader(capabilities.tessellation_shaders)
        .multi_viewport(capabilities.multiple_viewports)
        .sampler_anisotropy(capabilities.sampler_anisotropy)
        .fill_mode_non_solid(capabilities.fill_mode_wireframe)
        .independent_blend(capabilities.independent_blend)
        .shader_float64(capabilities.shader_float64)
        .draw_indirect_first_instance(capabilities.draw_indirect_base_instance);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

    Ok((device, graphics_queue))
}
