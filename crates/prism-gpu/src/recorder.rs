//! Command recording.
//!
//! [`CommandRecorder`] is a stateful builder over one command buffer: it
//! tracks the bound pipelines, resource sets, framebuffer/render-pass cycle,
//! queued clear values, and every resource the recording touches. Layout
//! transitions and staging copies are recorded on demand so callers never
//! emit barriers themselves.

use crate::buffer::{BufferUsage, DeviceBuffer};
use crate::capabilities::GpuCapabilities;
use crate::descriptors::{PipelineKind, ResourceBinding, ResourceSet};
use crate::error::{GpuError, Result};
use crate::format::{block_dimension, block_size_bytes, blocks_covering, has_stencil, mip_dimension};
use crate::layout;
use crate::memory::DeviceMemoryManager;
use crate::pipeline::{ComputePipeline, GraphicsPipeline};
use crate::renderpass::Framebuffer;
use crate::resource::{TrackedResource, UsageSet};
use crate::staging::StagingPool;
use crate::texture::Texture;
use ash::vk;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;

bitflags! {
    /// How a recording will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecordingFlags: u32 {
        /// The recording is submitted once and then reset or disposed.
        const ONE_TIME = 1 << 0;
        /// The recording may be submitted while already pending.
        const SIMULTANEOUS = 1 << 1;
    }
}

/// Lifecycle state of a recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    /// No command buffer allocated yet.
    Unallocated,
    /// Allocated and ready to begin.
    Ready,
    /// Between begin and end.
    Recording,
    /// Ended, ready to submit.
    Recorded,
    /// Submitted; waiting for the fence.
    Submitted,
    /// Submission finished; resources released.
    Completed,
    /// Command buffer freed.
    Disposed,
}

/// Whether `begin` is legal in `state`.
fn can_begin(state: RecorderState, allow_reset: bool) -> bool {
    match state {
        RecorderState::Ready => true,
        RecorderState::Recorded | RecorderState::Completed => allow_reset,
        _ => false,
    }
}

/// Whether `reset` is legal in `state`.
fn can_reset(state: RecorderState) -> bool {
    matches!(
        state,
        RecorderState::Recording | RecorderState::Recorded | RecorderState::Completed
    )
}

/// Contiguous runs of `true` in a changed-slot bitmap: `(first, count)`.
fn contiguous_runs(changed: &[bool]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start = None;
    for (index, &flag) in changed.iter().enumerate() {
        match (flag, start) {
            (true, None) => start = Some(index),
            (false, Some(first)) => {
                runs.push((first, index - first));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(first) = start {
        runs.push((first, changed.len() - first));
    }
    runs
}

/// Copy extent clamped so it stays inside a mip level.
fn clamp_extent(
    width: u32,
    height: u32,
    depth: u32,
    origin: TextureOrigin,
    mip_extent: vk::Extent3D,
) -> vk::Extent3D {
    vk::Extent3D {
        width: width.min(mip_extent.width.saturating_sub(origin.x)),
        height: height.min(mip_extent.height.saturating_sub(origin.y)),
        depth: depth.min(mip_extent.depth.saturating_sub(origin.z)),
    }
}

/// One corner of a texture copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextureOrigin {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub mip_level: u32,
    pub array_layer: u32,
}

/// One bound resource-set slot.
#[derive(Default, Clone)]
struct BoundSet {
    set: Option<Arc<ResourceSet>>,
    offsets: Vec<u32>,
    changed: bool,
}

/// Shared state of a command pool: the recorders it allocates hold it to
/// return staging buffers and consult the reset capability.
pub(crate) struct PoolShared {
    pub(crate) device: Arc<ash::Device>,
    pub(crate) pool: Mutex<vk::CommandPool>,
    pub(crate) allow_reset: bool,
    pub(crate) staging: Mutex<StagingPool>,
    pub(crate) memory: Arc<DeviceMemoryManager>,
    pub(crate) capabilities: Arc<GpuCapabilities>,
}

/// Command pool that allocates recorders and pools their staging buffers.
pub struct CommandPool {
    shared: Arc<PoolShared>,
}

impl CommandPool {
    /// Create a command pool for the graphics queue family.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub(crate) unsafe fn new(
        device: Arc<ash::Device>,
        queue_family: u32,
        allow_reset: bool,
        memory: Arc<DeviceMemoryManager>,
        capabilities: Arc<GpuCapabilities>,
    ) -> Result<Self> {
        let mut flags = vk::CommandPoolCreateFlags::empty();
        if allow_reset {
            flags |= vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        }
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self {
            shared: Arc::new(PoolShared {
                device,
                pool: Mutex::new(pool),
                allow_reset,
                staging: Mutex::new(StagingPool::new()),
                memory,
                capabilities,
            }),
        })
    }

    /// Whether recorders from this pool can be reset individually.
    pub fn allow_reset(&self) -> bool {
        self.shared.allow_reset
    }

    /// Number of idle pooled staging buffers.
    pub fn pooled_staging_count(&self) -> usize {
        self.shared.staging.lock().pooled_count()
    }

    /// Allocate a recorder in the `Ready` state.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_recorder(&self) -> Result<CommandRecorder> {
        let pool = self.shared.pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = self.shared.device.allocate_command_buffers(&alloc_info)?;
        drop(pool);

        Ok(CommandRecorder {
            pool: self.shared.clone(),
            cb: buffers[0],
            state: RecorderState::Ready,
            framebuffer: None,
            pass_active: false,
            new_framebuffer: false,
            graphics_pipeline: None,
            compute_pipeline: None,
            graphics_sets: Vec::new(),
            compute_sets: Vec::new(),
            color_clears: Vec::new(),
            depth_clear: None,
            scissors: Vec::new(),
            usage: UsageSet::default(),
            staging_buffers: Vec::new(),
            pre_draw_sampled: Vec::new(),
            submission_serial: None,
        })
    }

    /// Destroy the pool and its pooled staging buffers.
    ///
    /// # Safety
    /// The device must be valid and every recorder allocated from this pool
    /// must have been disposed.
    pub unsafe fn destroy(self) -> Result<()> {
        match Arc::try_unwrap(self.shared) {
            Ok(shared) => {
                shared
                    .staging
                    .into_inner()
                    .drain(&shared.device, &shared.memory);
                let pool = shared.pool.into_inner();
                shared.device.destroy_command_pool(pool, None);
                Ok(())
            }
            Err(_) => Err(GpuError::InvalidState(
                "command pool destroyed while recorders are alive".to_string(),
            )),
        }
    }
}

/// A stateful command-buffer builder.
///
/// Single-owner: a recorder must not be shared between threads while
/// recording.
pub struct CommandRecorder {
    pool: Arc<PoolShared>,
    cb: vk::CommandBuffer,
    state: RecorderState,
    framebuffer: Option<Arc<Framebuffer>>,
    pass_active: bool,
    new_framebuffer: bool,
    graphics_pipeline: Option<Arc<GraphicsPipeline>>,
    compute_pipeline: Option<Arc<ComputePipeline>>,
    graphics_sets: Vec<BoundSet>,
    compute_sets: Vec<BoundSet>,
    color_clears: Vec<Option<vk::ClearColorValue>>,
    depth_clear: Option<vk::ClearDepthStencilValue>,
    scissors: Vec<vk::Rect2D>,
    usage: UsageSet,
    staging_buffers: Vec<Arc<DeviceBuffer>>,
    pre_draw_sampled: Vec<Arc<Texture>>,
    submission_serial: Option<u64>,
}

impl CommandRecorder {
    /// Current lifecycle state.
    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub(crate) fn command_buffer(&self) -> vk::CommandBuffer {
        self.cb
    }

    fn require_recording(&self) -> Result<()> {
        if self.state != RecorderState::Recording {
            return Err(GpuError::InvalidState(format!(
                "operation requires the Recording state, recorder is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Begin recording.
    ///
    /// Legal from `Ready`, or from `Recorded`/`Completed` when the pool
    /// permits per-recorder reset. Clears all cached binding state.
    pub fn begin(&mut self, flags: RecordingFlags) -> Result<()> {
        if !can_begin(self.state, self.pool.allow_reset) {
            return Err(GpuError::InvalidState(format!(
                "cannot begin recording from {:?}",
                self.state
            )));
        }

        if self.state != RecorderState::Ready {
            unsafe {
                self.pool
                    .device
                    .reset_command_buffer(self.cb, vk::CommandBufferResetFlags::empty())?;
            }
            self.release_recording_resources();
        }

        self.framebuffer = None;
        self.pass_active = false;
        self.new_framebuffer = false;
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.graphics_sets.clear();
        self.compute_sets.clear();
        self.color_clears.clear();
        self.depth_clear = None;
        self.scissors.clear();
        self.pre_draw_sampled.clear();

        let mut begin_flags = vk::CommandBufferUsageFlags::empty();
        if flags.contains(RecordingFlags::ONE_TIME) {
            begin_flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if flags.contains(RecordingFlags::SIMULTANEOUS) {
            begin_flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        let begin_info = vk::CommandBufferBeginInfo::default().flags(begin_flags);
        unsafe {
            self.pool.device.begin_command_buffer(self.cb, &begin_info)?;
        }
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Finish recording.
    ///
    /// A framebuffer that was set but never drawn into is activated once so
    /// its queued clears flush, then the pass ends and sampled attachments
    /// return to their shader-readable layouts.
    pub fn end(&mut self) -> Result<()> {
        self.require_recording()?;

        if !self.pass_active && self.framebuffer.is_some() && self.new_framebuffer {
            self.ensure_render_pass_active()?;
        }
        if self.pass_active {
            self.end_current_render_pass();
        }
        if let Some(framebuffer) = self.framebuffer.clone() {
            unsafe {
                framebuffer.transition_to_final_layout(&self.pool.device, self.cb)?;
            }
        }

        unsafe {
            self.pool.device.end_command_buffer(self.cb)?;
        }
        self.state = RecorderState::Recorded;
        Ok(())
    }

    /// Reset to `Ready`, dropping all recorded work and resource references.
    ///
    /// Requires the pool's reset capability.
    pub fn reset(&mut self) -> Result<()> {
        if !self.pool.allow_reset {
            return Err(GpuError::InvalidState(
                "pool does not permit per-recorder reset".to_string(),
            ));
        }
        if !can_reset(self.state) {
            return Err(GpuError::InvalidState(format!(
                "cannot reset from {:?}",
                self.state
            )));
        }

        unsafe {
            self.pool
                .device
                .reset_command_buffer(self.cb, vk::CommandBufferResetFlags::empty())?;
        }
        self.release_recording_resources();
        self.pass_active = false;
        self.framebuffer = None;
        self.state = RecorderState::Ready;
        Ok(())
    }

    /// Free the command buffer and release all references.
    ///
    /// Illegal while `Submitted`; wait for the fence first.
    pub fn dispose(&mut self) -> Result<()> {
        if self.state == RecorderState::Submitted {
            return Err(GpuError::InvalidState(
                "cannot dispose a submitted recording; wait for its fence".to_string(),
            ));
        }
        if self.state == RecorderState::Disposed {
            return Ok(());
        }

        self.release_recording_resources();
        unsafe {
            let pool = self.pool.pool.lock();
            self.pool.device.free_command_buffers(*pool, &[self.cb]);
        }
        self.state = RecorderState::Disposed;
        Ok(())
    }

    /// Mark the recording as submitted under a queue serial.
    pub(crate) fn mark_submitted(&mut self, serial: u64) -> Result<()> {
        if self.state != RecorderState::Recorded {
            return Err(GpuError::InvalidState(format!(
                "cannot submit a recorder in {:?}",
                self.state
            )));
        }
        self.state = RecorderState::Submitted;
        self.submission_serial = Some(serial);
        Ok(())
    }

    /// Serial assigned at submission.
    pub fn submission_serial(&self) -> Option<u64> {
        self.submission_serial
    }

    /// Notify the recorder that its submission's fence has signaled.
    ///
    /// Releases every resource reference taken during recording and returns
    /// borrowed staging buffers to the pool.
    pub fn submission_complete(&mut self) -> Result<()> {
        if self.state != RecorderState::Submitted {
            return Err(GpuError::InvalidState(format!(
                "completion notified in {:?}",
                self.state
            )));
        }
        self.release_recording_resources();
        self.state = RecorderState::Completed;
        Ok(())
    }

    fn release_recording_resources(&mut self) {
        self.usage.release_all();
        let mut staging = self.pool.staging.lock();
        for buffer in self.staging_buffers.drain(..) {
            unsafe {
                staging.release(&self.pool.device, &self.pool.memory, buffer);
            }
        }
        self.pre_draw_sampled.clear();
    }

    // ------------------------------------------------------------------
    // Framebuffer and clears

    /// Set the active framebuffer.
    ///
    /// Ends any active pass. A previous framebuffer that was set but never
    /// activated flushes its queued clears through a brief pass first.
    pub fn set_framebuffer(&mut self, framebuffer: &Arc<Framebuffer>) -> Result<()> {
        self.require_recording()?;

        if self.pass_active {
            self.end_current_render_pass();
        } else if self.framebuffer.is_some() && self.new_framebuffer && self.has_queued_clears() {
            self.ensure_render_pass_active()?;
            self.end_current_render_pass();
        }

        if let Some(previous) = self.framebuffer.take() {
            unsafe {
                previous.transition_to_final_layout(&self.pool.device, self.cb)?;
            }
        }

        self.usage
            .record(TrackedResource::Framebuffer(framebuffer.clone()));
        for attachment in framebuffer.color.iter().chain(framebuffer.depth.as_ref()) {
            self.usage
                .record(TrackedResource::Texture(attachment.texture.clone()));
        }

        framebuffer.transition_to_intermediate_layout();

        self.color_clears = vec![None; framebuffer.color_count()];
        self.depth_clear = None;
        self.framebuffer = Some(framebuffer.clone());
        self.new_framebuffer = true;
        Ok(())
    }

    fn has_queued_clears(&self) -> bool {
        self.color_clears.iter().any(Option::is_some) || self.depth_clear.is_some()
    }

    /// Clear a color attachment.
    ///
    /// Outside a pass the clear is queued and folded into the next pass
    /// begin; inside a pass it is recorded immediately.
    pub fn clear_color_target(&mut self, index: u32, color: [f32; 4]) -> Result<()> {
        self.require_recording()?;
        let framebuffer = self
            .framebuffer
            .clone()
            .ok_or_else(|| GpuError::InvalidState("clear without a framebuffer".to_string()))?;
        if index as usize >= framebuffer.color_count() {
            return Err(GpuError::InvalidState(format!(
                "color attachment {index} out of range"
            )));
        }

        let value = vk::ClearColorValue { float32: color };
        if self.pass_active {
            self.emit_color_clear(&framebuffer, index, value);
        } else {
            self.color_clears[index as usize] = Some(value);
        }
        Ok(())
    }

    /// Clear the depth/stencil attachment.
    pub fn clear_depth_stencil_target(&mut self, depth: f32, stencil: u32) -> Result<()> {
        self.require_recording()?;
        let framebuffer = self
            .framebuffer
            .clone()
            .ok_or_else(|| GpuError::InvalidState("clear without a framebuffer".to_string()))?;
        if !framebuffer.has_depth() {
            return Err(GpuError::InvalidState(
                "framebuffer has no depth attachment".to_string(),
            ));
        }

        let value = vk::ClearDepthStencilValue { depth, stencil };
        if self.pass_active {
            self.emit_depth_clear(&framebuffer, value);
        } else {
            self.depth_clear = Some(value);
        }
        Ok(())
    }

    fn emit_color_clear(
        &mut self,
        framebuffer: &Framebuffer,
        index: u32,
        value: vk::ClearColorValue,
    ) {
        let attachment = vk::ClearAttachment::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .color_attachment(index)
            .clear_value(vk::ClearValue { color: value });
        let rect = full_extent_rect(framebuffer.extent);
        unsafe {
            self.pool
                .device
                .cmd_clear_attachments(self.cb, &[attachment], &[rect]);
        }
    }

    fn emit_depth_clear(&mut self, framebuffer: &Framebuffer, value: vk::ClearDepthStencilValue) {
        let format = framebuffer
            .depth
            .as_ref()
            .expect("depth clear without depth attachment")
            .texture
            .format;
        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if has_stencil(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        let attachment = vk::ClearAttachment::default()
            .aspect_mask(aspect)
            .clear_value(vk::ClearValue {
                depth_stencil: value,
            });
        let rect = full_extent_rect(framebuffer.extent);
        unsafe {
            self.pool
                .device
                .cmd_clear_attachments(self.cb, &[attachment], &[rect]);
        }
    }

    // ------------------------------------------------------------------
    // Render-pass cycle

    fn ensure_render_pass_active(&mut self) -> Result<()> {
        if self.pass_active {
            return Ok(());
        }
        let framebuffer = self
            .framebuffer
            .clone()
            .ok_or_else(|| GpuError::InvalidState("draw without a framebuffer".to_string()))?;

        let all_colors_queued = self.color_clears.iter().all(Option::is_some);
        let depth_satisfied = !framebuffer.has_depth() || self.depth_clear.is_some();
        let attachment_count = framebuffer.attachment_count();

        if attachment_count > 0 && all_colors_queued && depth_satisfied {
            // Every attachment clears at load time
            let mut clear_values: Vec<vk::ClearValue> =
                Vec::with_capacity(attachment_count);
            for queued in &mut self.color_clears {
                let color = queued.take().expect("queued color clear disappeared");
                clear_values.push(vk::ClearValue { color });
            }
            if let Some(depth_stencil) = self.depth_clear.take() {
                clear_values.push(vk::ClearValue { depth_stencil });
            }
            self.begin_pass(&framebuffer, framebuffer.clear_pass, &clear_values);
        } else {
            let pass = if self.new_framebuffer {
                framebuffer.no_clear_init_pass
            } else {
                framebuffer.no_clear_load_pass
            };
            self.begin_pass(&framebuffer, pass, &[]);
            self.pass_active = true;

            // Flush the attachments that do have a queued clear
            for index in 0..self.color_clears.len() {
                if let Some(value) = self.color_clears[index].take() {
                    self.emit_color_clear(&framebuffer, index as u32, value);
                }
            }
            if let Some(value) = self.depth_clear.take() {
                self.emit_depth_clear(&framebuffer, value);
            }
        }

        self.pass_active = true;
        self.new_framebuffer = false;
        Ok(())
    }

    fn begin_pass(
        &mut self,
        framebuffer: &Framebuffer,
        pass: vk::RenderPass,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(pass)
            .framebuffer(framebuffer.framebuffer)
            .render_area(full_extent_rect(framebuffer.extent).rect)
            .clear_values(clear_values);
        unsafe {
            self.pool
                .device
                .cmd_begin_render_pass(self.cb, &begin_info, vk::SubpassContents::INLINE);
        }
    }

    fn end_current_render_pass(&mut self) {
        debug_assert!(self.pass_active);
        unsafe {
            self.pool.device.cmd_end_render_pass(self.cb);
            // Conservative barrier so attachment writes are visible to
            // subsequent passes' reads
            self.pool.device.cmd_pipeline_barrier(
                self.cb,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[],
            );
        }
        self.pass_active = false;
    }

    // ------------------------------------------------------------------
    // Pipelines and resource sets

    /// Bind a graphics pipeline. Compute state is untouched.
    pub fn set_graphics_pipeline(&mut self, pipeline: &Arc<GraphicsPipeline>) -> Result<()> {
        self.require_recording()?;
        let unchanged = self
            .graphics_pipeline
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, pipeline));
        if unchanged {
            return Ok(());
        }

        self.graphics_sets = vec![BoundSet::default(); pipeline.set_count() as usize];
        unsafe {
            self.pool.device.cmd_bind_pipeline(
                self.cb,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );
        }
        self.usage
            .record(TrackedResource::GraphicsPipeline(pipeline.clone()));
        self.graphics_pipeline = Some(pipeline.clone());
        Ok(())
    }

    /// Bind a compute pipeline. Graphics state is untouched.
    pub fn set_compute_pipeline(&mut self, pipeline: &Arc<ComputePipeline>) -> Result<()> {
        self.require_recording()?;
        let unchanged = self
            .compute_pipeline
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, pipeline));
        if unchanged {
            return Ok(());
        }

        self.compute_sets = vec![BoundSet::default(); pipeline.set_count() as usize];
        unsafe {
            self.pool.device.cmd_bind_pipeline(
                self.cb,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.pipeline,
            );
        }
        self.usage
            .record(TrackedResource::ComputePipeline(pipeline.clone()));
        self.compute_pipeline = Some(pipeline.clone());
        Ok(())
    }

    /// Bind a graphics resource set to a slot.
    ///
    /// The actual descriptor bind is deferred and batched into the next draw.
    pub fn set_graphics_resource_set(
        &mut self,
        slot: u32,
        set: &Arc<ResourceSet>,
        dynamic_offsets: &[u32],
    ) -> Result<()> {
        self.require_recording()?;
        if set.kind != PipelineKind::Graphics {
            return Err(GpuError::InvalidState(
                "compute resource set bound to a graphics slot".to_string(),
            ));
        }
        if self.graphics_pipeline.is_none() {
            return Err(GpuError::InvalidState(
                "resource set bound before a graphics pipeline".to_string(),
            ));
        }
        Self::bind_set_slot(&mut self.graphics_sets, slot, set, dynamic_offsets)
    }

    /// Bind a compute resource set to a slot.
    pub fn set_compute_resource_set(
        &mut self,
        slot: u32,
        set: &Arc<ResourceSet>,
        dynamic_offsets: &[u32],
    ) -> Result<()> {
        self.require_recording()?;
        if set.kind != PipelineKind::Compute {
            return Err(GpuError::InvalidState(
                "graphics resource set bound to a compute slot".to_string(),
            ));
        }
        if self.compute_pipeline.is_none() {
            return Err(GpuError::InvalidState(
                "resource set bound before a compute pipeline".to_string(),
            ));
        }
        Self::bind_set_slot(&mut self.compute_sets, slot, set, dynamic_offsets)
    }

    fn bind_set_slot(
        slots: &mut [BoundSet],
        slot: u32,
        set: &Arc<ResourceSet>,
        dynamic_offsets: &[u32],
    ) -> Result<()> {
        let bound = slots.get_mut(slot as usize).ok_or_else(|| {
            GpuError::InvalidState(format!("resource set slot {slot} exceeds pipeline layout"))
        })?;

        let unchanged = bound
            .set
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, set))
            && bound.offsets == dynamic_offsets;
        if unchanged {
            return Ok(());
        }

        bound.offsets.clear();
        bound.offsets.extend_from_slice(dynamic_offsets);
        bound.set = Some(set.clone());
        bound.changed = true;
        Ok(())
    }

    /// Flush changed resource-set slots as batched descriptor binds.
    fn flush_resource_sets(&mut self, kind: PipelineKind) {
        let (layout, bind_point) = match kind {
            PipelineKind::Graphics => (
                self.graphics_pipeline
                    .as_ref()
                    .expect("flush without graphics pipeline")
                    .layout,
                vk::PipelineBindPoint::GRAPHICS,
            ),
            PipelineKind::Compute => (
                self.compute_pipeline
                    .as_ref()
                    .expect("flush without compute pipeline")
                    .layout,
                vk::PipelineBindPoint::COMPUTE,
            ),
        };
        let slots = match kind {
            PipelineKind::Graphics => &mut self.graphics_sets,
            PipelineKind::Compute => &mut self.compute_sets,
        };

        let mut changed = vec![false; slots.len()];
        for (index, bound) in slots.iter_mut().enumerate() {
            if bound.changed {
                changed[index] = true;
                bound.changed = false;
            }
        }

        // Reference every resource the flushed sets pull into the recording
        for (index, flag) in changed.iter().enumerate() {
            if !flag {
                continue;
            }
            let set = slots[index].set.as_ref().expect("changed slot without set");
            self.usage.record(TrackedResource::ResourceSet(set.clone()));
            for binding in &set.bindings {
                match binding {
                    ResourceBinding::UniformBuffer(buffer)
                    | ResourceBinding::DynamicUniformBuffer(buffer)
                    | ResourceBinding::StorageBuffer(buffer) => {
                        self.usage.record(TrackedResource::Buffer(buffer.clone()));
                    }
                    ResourceBinding::SampledTexture(texture)
                    | ResourceBinding::StorageTexture(texture) => {
                        self.usage.record(TrackedResource::Texture(texture.clone()));
                    }
                    ResourceBinding::Sampler(sampler) => {
                        self.usage
                            .record(TrackedResource::Sampler(sampler.clone()));
                    }
                }
            }
        }

        for (first, count) in contiguous_runs(&changed) {
            let mut batch_sets = Vec::with_capacity(count);
            let mut batch_offsets = Vec::new();
            for slot in &slots[first..first + count] {
                let set = slot.set.as_ref().expect("changed slot without set");
                batch_sets.push(set.set);
                batch_offsets.extend_from_slice(&slot.offsets);
            }
            unsafe {
                self.pool.device.cmd_bind_descriptor_sets(
                    self.cb,
                    bind_point,
                    layout,
                    first as u32,
                    &batch_sets,
                    &batch_offsets,
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Fixed state

    /// Set a viewport. Indices above zero silently no-op when the device
    /// lacks `multiple_viewports`.
    pub fn set_viewport(&mut self, index: u32, viewport: vk::Viewport) -> Result<()> {
        self.require_recording()?;
        if index > 0 && !self.pool.capabilities.multiple_viewports {
            return Ok(());
        }
        unsafe {
            self.pool
                .device
                .cmd_set_viewport(self.cb, index, &[viewport]);
        }
        Ok(())
    }

    /// Set a scissor rectangle for a viewport index.
    pub fn set_scissor(&mut self, index: u32, rect: vk::Rect2D) -> Result<()> {
        self.require_recording()?;
        if index > 0 && !self.pool.capabilities.multiple_viewports {
            return Ok(());
        }
        if self.scissors.len() <= index as usize {
            self.scissors
                .resize(index as usize + 1, vk::Rect2D::default());
        }
        self.scissors[index as usize] = rect;
        unsafe {
            self.pool.device.cmd_set_scissor(self.cb, index, &[rect]);
        }
        Ok(())
    }

    /// Bind a vertex buffer.
    pub fn set_vertex_buffer(
        &mut self,
        binding: u32,
        buffer: &Arc<DeviceBuffer>,
        offset: u64,
    ) -> Result<()> {
        self.require_recording()?;
        self.usage.record(TrackedResource::Buffer(buffer.clone()));
        unsafe {
            self.pool
                .device
                .cmd_bind_vertex_buffers(self.cb, binding, &[buffer.buffer], &[offset]);
        }
        Ok(())
    }

    /// Bind an index buffer.
    pub fn set_index_buffer(
        &mut self,
        buffer: &Arc<DeviceBuffer>,
        index_type: vk::IndexType,
        offset: u64,
    ) -> Result<()> {
        self.require_recording()?;
        self.usage.record(TrackedResource::Buffer(buffer.clone()));
        unsafe {
            self.pool
                .device
                .cmd_bind_index_buffer(self.cb, buffer.buffer, offset, index_type);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Draw and dispatch

    /// Record a non-indexed draw.
    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.pre_draw()?;
        unsafe {
            self.pool.device.cmd_draw(
                self.cb,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
        Ok(())
    }

    /// Record an indexed draw.
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.pre_draw()?;
        unsafe {
            self.pool.device.cmd_draw_indexed(
                self.cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    /// Record an indirect draw.
    pub fn draw_indirect(
        &mut self,
        buffer: &Arc<DeviceBuffer>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) -> Result<()> {
        if !buffer.usage.contains(BufferUsage::INDIRECT) {
            return Err(GpuError::InvalidState(
                "indirect draw from a non-indirect buffer".to_string(),
            ));
        }
        self.pre_draw()?;
        self.usage.record(TrackedResource::Buffer(buffer.clone()));
        unsafe {
            self.pool
                .device
                .cmd_draw_indirect(self.cb, buffer.buffer, offset, draw_count, stride);
        }
        Ok(())
    }

    /// Record a compute dispatch.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.pre_dispatch()?;
        unsafe {
            self.pool.device.cmd_dispatch(self.cb, x, y, z);
        }
        Ok(())
    }

    fn pre_draw(&mut self) -> Result<()> {
        self.require_recording()?;
        if self.graphics_pipeline.is_none() {
            return Err(GpuError::InvalidState(
                "draw without a graphics pipeline".to_string(),
            ));
        }

        self.transition_pre_draw_sampled()?;
        self.ensure_render_pass_active()?;
        self.flush_resource_sets(PipelineKind::Graphics);
        Ok(())
    }

    fn pre_dispatch(&mut self) -> Result<()> {
        self.require_recording()?;
        if self.compute_pipeline.is_none() {
            return Err(GpuError::InvalidState(
                "dispatch without a compute pipeline".to_string(),
            ));
        }

        self.transition_pre_draw_sampled()?;
        if self.pass_active {
            self.end_current_render_pass();
        }

        // Bring every texture the bound compute sets reference into the
        // layout the shader expects
        let mut sampled = Vec::new();
        let mut storage = Vec::new();
        for bound in &self.compute_sets {
            if let Some(set) = &bound.set {
                sampled.extend(set.sampled_textures().cloned());
                storage.extend(set.storage_textures().cloned());
            }
        }
        for texture in sampled {
            self.transition_whole(&texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        }
        for texture in storage {
            self.transition_whole(&texture, vk::ImageLayout::GENERAL)?;
            if texture.is_sampled() {
                // Sampled again before the next draw
                self.pre_draw_sampled.push(texture);
            }
        }

        self.flush_resource_sets(PipelineKind::Compute);
        Ok(())
    }

    fn transition_pre_draw_sampled(&mut self) -> Result<()> {
        let images = std::mem::take(&mut self.pre_draw_sampled);
        for texture in images {
            self.transition_whole(&texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        }
        Ok(())
    }

    fn transition_whole(&mut self, texture: &Arc<Texture>, layout: vk::ImageLayout) -> Result<()> {
        unsafe {
            layout::transition_each(
                &self.pool.device,
                self.cb,
                texture,
                0,
                texture.mip_levels,
                0,
                texture.array_layers,
                layout,
            )
        }
    }

    // ------------------------------------------------------------------
    // Copies

    /// Copy between buffers, then make the destination visible to shader and
    /// vertex-input stages.
    pub fn copy_buffer(
        &mut self,
        src: &Arc<DeviceBuffer>,
        src_offset: u64,
        dst: &Arc<DeviceBuffer>,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.require_recording()?;
        if self.pass_active {
            self.end_current_render_pass();
        }
        self.usage.record(TrackedResource::Buffer(src.clone()));
        self.usage.record(TrackedResource::Buffer(dst.clone()));

        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.pool
                .device
                .cmd_copy_buffer(self.cb, src.buffer, dst.buffer, &[region]);
        }

        let dst_access = if dst.is_uniform() {
            vk::AccessFlags::UNIFORM_READ
        } else {
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ
        };
        let mut dst_stages = vk::PipelineStageFlags::VERTEX_INPUT
            | vk::PipelineStageFlags::VERTEX_SHADER
            | vk::PipelineStageFlags::FRAGMENT_SHADER
            | vk::PipelineStageFlags::COMPUTE_SHADER;
        if self.pool.capabilities.geometry_shader {
            dst_stages |= vk::PipelineStageFlags::GEOMETRY_SHADER;
        }
        if self.pool.capabilities.tessellation_shaders {
            dst_stages |= vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER
                | vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
        }

        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(dst_access);
        unsafe {
            self.pool.device.cmd_pipeline_barrier(
                self.cb,
                vk::PipelineStageFlags::TRANSFER,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }

    /// Write data into a buffer through a pooled staging buffer.
    ///
    /// The staging buffer stays with the recording and returns to the pool
    /// when the submission completes.
    pub fn update_buffer(
        &mut self,
        dst: &Arc<DeviceBuffer>,
        dst_offset: u64,
        data: &[u8],
    ) -> Result<()> {
        self.require_recording()?;
        let staging = unsafe {
            self.pool
                .staging
                .lock()
                .acquire(&self.pool.memory, data.len() as u64)?
        };
        staging.write_bytes(0, data)?;
        self.staging_buffers.push(staging.clone());
        self.copy_buffer(&staging, 0, dst, dst_offset, data.len() as u64)
    }

    /// Typed variant of [`update_buffer`](Self::update_buffer).
    pub fn update_buffer_with<T: bytemuck::NoUninit>(
        &mut self,
        dst: &Arc<DeviceBuffer>,
        dst_offset: u64,
        data: &[T],
    ) -> Result<()> {
        self.update_buffer(dst, dst_offset, bytemuck::cast_slice(data))
    }

    /// Copy texture subresources, dispatching on the staging-ness of each
    /// side.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_texture(
        &mut self,
        src: &Arc<Texture>,
        src_origin: TextureOrigin,
        dst: &Arc<Texture>,
        dst_origin: TextureOrigin,
        width: u32,
        height: u32,
        depth: u32,
        layer_count: u32,
    ) -> Result<()> {
        self.require_recording()?;
        if self.pass_active {
            self.end_current_render_pass();
        }
        self.usage.record(TrackedResource::Texture(src.clone()));
        self.usage.record(TrackedResource::Texture(dst.clone()));

        match (src.is_staging(), dst.is_staging()) {
            (false, false) => self.copy_image_to_image(
                src, src_origin, dst, dst_origin, width, height, depth, layer_count,
            ),
            (true, false) => self.copy_staging_to_image(
                src, src_origin, dst, dst_origin, width, height, depth, layer_count,
            ),
            (false, true) => self.copy_image_to_staging(
                src, src_origin, dst, dst_origin, width, height, depth, layer_count,
            ),
            (true, true) => self.copy_staging_to_staging(
                src, src_origin, dst, dst_origin, width, height, depth, layer_count,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_image_to_image(
        &mut self,
        src: &Arc<Texture>,
        src_origin: TextureOrigin,
        dst: &Arc<Texture>,
        dst_origin: TextureOrigin,
        width: u32,
        height: u32,
        depth: u32,
        layer_count: u32,
    ) -> Result<()> {
        if src.aspect() != dst.aspect() {
            return Err(GpuError::AspectMismatch);
        }

        let device = self.pool.device.clone();
        unsafe {
            layout::transition(
                &device,
                self.cb,
                src,
                src_origin.mip_level,
                1,
                src_origin.array_layer,
                layer_count,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )?;
            layout::transition(
                &device,
                self.cb,
                dst,
                dst_origin.mip_level,
                1,
                dst_origin.array_layer,
                layer_count,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
        }

        let extent = clamp_extent(
            width,
            height,
            depth,
            dst_origin,
            crate::format::mip_extent(dst.extent, dst_origin.mip_level),
        );
        let region = vk::ImageCopy {
            src_subresource: subresource_layers(src.aspect(), src_origin, layer_count),
            src_offset: origin_offset(src_origin),
            dst_subresource: subresource_layers(dst.aspect(), dst_origin, layer_count),
            dst_offset: origin_offset(dst_origin),
            extent,
        };
        unsafe {
            device.cmd_copy_image(
                self.cb,
                src.expect_image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.expect_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        self.restore_sampled(src, src_origin, layer_count)?;
        self.restore_sampled(dst, dst_origin, layer_count)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_staging_to_image(
        &mut self,
        src: &Arc<Texture>,
        src_origin: TextureOrigin,
        dst: &Arc<Texture>,
        dst_origin: TextureOrigin,
        width: u32,
        height: u32,
        depth: u32,
        layer_count: u32,
    ) -> Result<()> {
        let device = self.pool.device.clone();
        unsafe {
            layout::transition(
                &device,
                self.cb,
                dst,
                dst_origin.mip_level,
                1,
                dst_origin.array_layer,
                layer_count,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;
        }

        let block = block_dimension(src.format);
        let block_bytes = u64::from(block_size_bytes(src.format));
        let mip_width = mip_dimension(src.extent.width, src_origin.mip_level);
        let mip_height = mip_dimension(src.extent.height, src_origin.mip_level);
        // Row length and image height in texels, raised to the block size
        let buffer_row_length = blocks_covering(mip_width, src.format) * block;
        let buffer_image_height = blocks_covering(mip_height, src.format) * block;

        let extent = clamp_extent(
            width,
            height,
            depth,
            dst_origin,
            crate::format::mip_extent(dst.extent, dst_origin.mip_level),
        );

        let mut regions = Vec::with_capacity(layer_count as usize);
        for layer in 0..layer_count {
            let sub = src.staging_subresource(src_origin.mip_level, src_origin.array_layer + layer);
            let buffer_offset = sub.offset
                + u64::from(src_origin.z) * sub.depth_pitch
                + u64::from(src_origin.y / block) * sub.row_pitch
                + u64::from(src_origin.x / block) * block_bytes;

            regions.push(
                vk::BufferImageCopy::default()
                    .buffer_offset(buffer_offset)
                    .buffer_row_length(buffer_row_length)
                    .buffer_image_height(buffer_image_height)
                    .image_subresource(subresource_layers(
                        dst.aspect(),
                        TextureOrigin {
                            array_layer: dst_origin.array_layer + layer,
                            ..dst_origin
                        },
                        1,
                    ))
                    .image_offset(origin_offset(dst_origin))
                    .image_extent(extent),
            );
        }

        unsafe {
            device.cmd_copy_buffer_to_image(
                self.cb,
                src.staging_buffer()?,
                dst.expect_image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &regions,
            );
        }

        self.restore_sampled(dst, dst_origin, layer_count)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_image_to_staging(
        &mut self,
        src: &Arc<Texture>,
        src_origin: TextureOrigin,
        dst: &Arc<Texture>,
        dst_origin: TextureOrigin,
        width: u32,
        height: u32,
        depth: u32,
        layer_count: u32,
    ) -> Result<()> {
        let device = self.pool.device.clone();
        unsafe {
            layout::transition(
                &device,
                self.cb,
                src,
                src_origin.mip_level,
                1,
                src_origin.array_layer,
                layer_count,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            )?;
        }

        let block = block_dimension(dst.format);
        let block_bytes = u64::from(block_size_bytes(dst.format));
        let mip_width = mip_dimension(dst.extent.width, dst_origin.mip_level);
        let mip_height = mip_dimension(dst.extent.height, dst_origin.mip_level);
        let buffer_row_length = blocks_covering(mip_width, dst.format) * block;
        let buffer_image_height = blocks_covering(mip_height, dst.format) * block;

        let extent = clamp_extent(
            width,
            height,
            depth,
            src_origin,
            crate::format::mip_extent(src.extent, src_origin.mip_level),
        );

        // One region per layer: layers are not adjacent in the staging layout
        let mut regions = Vec::with_capacity(layer_count as usize);
        for layer in 0..layer_count {
            let sub = dst.staging_subresource(dst_origin.mip_level, dst_origin.array_layer + layer);
            let buffer_offset = sub.offset
                + u64::from(dst_origin.z) * sub.depth_pitch
                + u64::from(dst_origin.y / block) * sub.row_pitch
                + u64::from(dst_origin.x / block) * block_bytes;

            regions.push(
                vk::BufferImageCopy::default()
                    .buffer_offset(buffer_offset)
                    .buffer_row_length(buffer_row_length)
                    .buffer_image_height(buffer_image_height)
                    .image_subresource(subresource_layers(
                        src.aspect(),
                        TextureOrigin {
                            array_layer: src_origin.array_layer + layer,
                            ..src_origin
                        },
                        1,
                    ))
                    .image_offset(origin_offset(src_origin))
                    .image_extent(extent),
            );
        }

        unsafe {
            device.cmd_copy_image_to_buffer(
                self.cb,
                src.expect_image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.staging_buffer()?,
                &regions,
            );
        }

        self.restore_sampled(src, src_origin, layer_count)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_staging_to_staging(
        &mut self,
        src: &Arc<Texture>,
        src_origin: TextureOrigin,
        dst: &Arc<Texture>,
        dst_origin: TextureOrigin,
        width: u32,
        height: u32,
        depth: u32,
        layer_count: u32,
    ) -> Result<()> {
        let block = block_dimension(src.format);
        let block_bytes = u64::from(block_size_bytes(src.format));
        // Row-by-row copies over block rows; block size 1 covers the
        // uncompressed path
        let row_bytes = u64::from(blocks_covering(width, src.format)) * block_bytes;
        let rows = blocks_covering(height, src.format);

        let mut regions = Vec::new();
        for layer in 0..layer_count {
            let src_sub =
                src.staging_subresource(src_origin.mip_level, src_origin.array_layer + layer);
            let dst_sub =
                dst.staging_subresource(dst_origin.mip_level, dst_origin.array_layer + layer);
            for z in 0..depth {
                for row in 0..rows {
                    let src_offset = src_sub.offset
                        + u64::from(src_origin.z + z) * src_sub.depth_pitch
                        + u64::from(src_origin.y / block + row) * src_sub.row_pitch
                        + u64::from(src_origin.x / block) * block_bytes;
                    let dst_offset = dst_sub.offset
                        + u64::from(dst_origin.z + z) * dst_sub.depth_pitch
                        + u64::from(dst_origin.y / block + row) * dst_sub.row_pitch
                        + u64::from(dst_origin.x / block) * block_bytes;
                    regions.push(vk::BufferCopy {
                        src_offset,
                        dst_offset,
                        size: row_bytes,
                    });
                }
            }
        }

        unsafe {
            self.pool.device.cmd_copy_buffer(
                self.cb,
                src.staging_buffer()?,
                dst.staging_buffer()?,
                &regions,
            );
        }
        Ok(())
    }

    /// Return a texture range to its sampled layout after a transfer.
    fn restore_sampled(
        &mut self,
        texture: &Arc<Texture>,
        origin: TextureOrigin,
        layer_count: u32,
    ) -> Result<()> {
        if !texture.is_sampled() {
            return Ok(());
        }
        unsafe {
            layout::transition(
                &self.pool.device,
                self.cb,
                texture,
                origin.mip_level,
                1,
                origin.array_layer,
                layer_count,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
        }
    }

    /// Transition a swapchain texture to the present layout.
    ///
    /// Must be the last thing recorded against the texture before the
    /// submission that precedes the present.
    pub fn prepare_present(&mut self, texture: &Arc<Texture>) -> Result<()> {
        self.require_recording()?;
        if !texture.is_swapchain() {
            return Err(GpuError::InvalidState(
                "prepare_present on a non-swapchain texture".to_string(),
            ));
        }
        if self.pass_active {
            self.end_current_render_pass();
        }
        self.usage.record(TrackedResource::Texture(texture.clone()));
        unsafe {
            layout::transition(
                &self.pool.device,
                self.cb,
                texture,
                0,
                1,
                0,
                1,
                vk::ImageLayout::PRESENT_SRC_KHR,
            )
        }
    }

    // ------------------------------------------------------------------
    // Mipmaps

    /// Fill the mip chain of a texture by blitting each level from the one
    /// above it.
    pub fn generate_mipmaps(&mut self, texture: &Arc<Texture>) -> Result<()> {
        self.require_recording()?;
        if texture.is_staging() {
            return Err(GpuError::InvalidState(
                "cannot generate mipmaps on a staging texture".to_string(),
            ));
        }
        if self.pass_active {
            self.end_current_render_pass();
        }
        self.usage.record(TrackedResource::Texture(texture.clone()));
        if texture.mip_levels <= 1 {
            return Ok(());
        }

        let device = self.pool.device.clone();
        let layers = texture.array_layers;
        let aspect = texture.aspect();
        let filter = if texture.linear_filterable {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };

        let mut width = texture.extent.width;
        let mut height = texture.extent.height;
        let mut depth = texture.extent.depth;

        for level in 1..texture.mip_levels {
            unsafe {
                // Levels may be in differing layouts mid-chain
                layout::transition_each(
                    &device,
                    self.cb,
                    texture,
                    level - 1,
                    1,
                    0,
                    layers,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                )?;
                layout::transition_each(
                    &device,
                    self.cb,
                    texture,
                    level,
                    1,
                    0,
                    layers,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )?;
            }

            let dst_width = (width / 2).max(1);
            let dst_height = (height / 2).max(1);
            let dst_depth = (depth / 2).max(1);

            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: layers,
                },
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: width as i32,
                        y: height as i32,
                        z: depth as i32,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: layers,
                },
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_width as i32,
                        y: dst_height as i32,
                        z: dst_depth as i32,
                    },
                ],
            };
            unsafe {
                device.cmd_blit_image(
                    self.cb,
                    texture.expect_image(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    texture.expect_image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    filter,
                );
            }

            width = dst_width;
            height = dst_height;
            depth = dst_depth;
        }

        if texture.is_sampled() {
            self.transition_whole(texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        }
        Ok(())
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        match self.state {
            RecorderState::Disposed => {}
            RecorderState::Submitted => {
                // The GPU may still read this buffer; leak it rather than
                // free. Counters are released so resources do not stay
                // pinned forever.
                tracing::warn!("command recorder dropped while submitted; leaking command buffer");
                self.usage.release_all();
                self.staging_buffers.clear();
            }
            _ => {
                let _ = self.dispose();
            }
        }
    }
}

fn subresource_layers(
    aspect: vk::ImageAspectFlags,
    origin: TextureOrigin,
    layer_count: u32,
) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level: origin.mip_level,
        base_array_layer: origin.array_layer,
        layer_count,
    }
}

fn origin_offset(origin: TextureOrigin) -> vk::Offset3D {
    vk::Offset3D {
        x: origin.x as i32,
        y: origin.y as i32,
        z: origin.z as i32,
    }
}

fn full_extent_rect(extent: vk::Extent2D) -> vk::ClearRect {
    vk::ClearRect {
        rect: vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        },
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_requires_ready_or_resettable() {
        assert!(can_begin(RecorderState::Ready, false));
        assert!(!can_begin(RecorderState::Recorded, false));
        assert!(can_begin(RecorderState::Recorded, true));
        assert!(can_begin(RecorderState::Completed, true));
        assert!(!can_begin(RecorderState::Recording, true));
        assert!(!can_begin(RecorderState::Submitted, true));
        assert!(!can_begin(RecorderState::Disposed, true));
    }

    #[test]
    fn reset_only_from_recording_states() {
        assert!(can_reset(RecorderState::Recording));
        assert!(can_reset(RecorderState::Recorded));
        assert!(can_reset(RecorderState::Completed));
        assert!(!can_reset(RecorderState::Ready));
        assert!(!can_reset(RecorderState::Submitted));
        assert!(!can_reset(RecorderState::Disposed));
    }

    #[test]
    fn sparse_changes_coalesce_into_runs() {
        assert_eq!(
            contiguous_runs(&[true, true, false, true]),
            vec![(0, 2), (3, 1)]
        );
        assert_eq!(contiguous_runs(&[false, false]), vec![]);
        assert_eq!(contiguous_runs(&[true]), vec![(0, 1)]);
        assert_eq!(
            contiguous_runs(&[false, true, true, true, false, true]),
            vec![(1, 3), (5, 1)]
        );
        assert_eq!(contiguous_runs(&[]), vec![]);
    }

    #[test]
    fn copy_extents_clamp_to_the_mip() {
        let origin = TextureOrigin {
            x: 6,
            y: 0,
            z: 0,
            mip_level: 0,
            array_layer: 0,
        };
        let clamped = clamp_extent(
            8,
            8,
            1,
            origin,
            vk::Extent3D {
                width: 8,
                height: 8,
                depth: 1,
            },
        );
        assert_eq!(clamped.width, 2);
        assert_eq!(clamped.height, 8);
        assert_eq!(clamped.depth, 1);
    }
}
