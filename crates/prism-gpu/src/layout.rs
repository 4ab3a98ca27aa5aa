//! Per-subresource image layout tracking and transition barriers.
//!
//! Each non-staging texture carries a dense array of current layouts, one per
//! (mip level, array layer). Transitions consult that state, emit a single
//! image memory barrier per contiguous range, and update the cells, so user
//! code never writes barriers by hand.

use crate::error::{GpuError, Result};
use crate::texture::Texture;
use ash::vk;

/// Dense per-subresource layout state.
pub(crate) struct LayoutTracker {
    mip_levels: u32,
    array_layers: u32,
    layouts: Vec<vk::ImageLayout>,
}

impl LayoutTracker {
    pub fn new(mip_levels: u32, array_layers: u32, initial: vk::ImageLayout) -> Self {
        Self {
            mip_levels,
            array_layers,
            layouts: vec![initial; (mip_levels * array_layers) as usize],
        }
    }

    fn index(&self, mip: u32, layer: u32) -> usize {
        debug_assert!(mip < self.mip_levels && layer < self.array_layers);
        (layer * self.mip_levels + mip) as usize
    }

    pub fn get(&self, mip: u32, layer: u32) -> vk::ImageLayout {
        self.layouts[self.index(mip, layer)]
    }

    pub fn set_range(
        &mut self,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
        layout: vk::ImageLayout,
    ) {
        for layer in base_layer..base_layer + layer_count {
            for mip in base_mip..base_mip + mip_count {
                let index = self.index(mip, layer);
                self.layouts[index] = layout;
            }
        }
    }

    /// Transition a range whose subresources share one current layout.
    ///
    /// Returns the old layout when a barrier is needed, `None` when the range
    /// is already in `new_layout`.
    pub fn transition_matching(
        &mut self,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
        new_layout: vk::ImageLayout,
    ) -> Option<vk::ImageLayout> {
        let old = self.get(base_mip, base_layer);
        #[cfg(debug_assertions)]
        for layer in base_layer..base_layer + layer_count {
            for mip in base_mip..base_mip + mip_count {
                debug_assert_eq!(
                    self.get(mip, layer),
                    old,
                    "matching transition over subresources in differing layouts"
                );
            }
        }

        if old == new_layout {
            return None;
        }
        self.set_range(base_mip, mip_count, base_layer, layer_count, new_layout);
        Some(old)
    }

    /// Transition a single subresource, tolerating differing neighbors.
    pub fn transition_single(
        &mut self,
        mip: u32,
        layer: u32,
        new_layout: vk::ImageLayout,
    ) -> Option<vk::ImageLayout> {
        let index = self.index(mip, layer);
        let old = self.layouts[index];
        if old == new_layout {
            return None;
        }
        self.layouts[index] = new_layout;
        Some(old)
    }
}

/// Access and stage masks for one barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BarrierMasks {
    pub src_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Access/stage pair for a layout when it is the barrier source.
fn source_masks(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => {
            (vk::AccessFlags::NONE, vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        // A general image was last written by a compute-style transfer
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        _ => {
            debug_assert!(false, "unhandled source layout {layout:?}");
            (vk::AccessFlags::NONE, vk::PipelineStageFlags::TOP_OF_PIPE)
        }
    }
}

/// Access/stage pair for a layout when it is the barrier destination.
fn destination_masks(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        // General as a destination means compute shader access
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        _ => {
            debug_assert!(false, "unhandled destination layout {layout:?}");
            (vk::AccessFlags::NONE, vk::PipelineStageFlags::TOP_OF_PIPE)
        }
    }
}

/// Compute barrier masks for a layout transition.
pub(crate) fn barrier_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> BarrierMasks {
    let (mut src_access, mut src_stage) = source_masks(old);
    let (dst_access, dst_stage) = destination_masks(new);

    // A sampled image becoming an attachment was last consumed by a transfer
    if old == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        && (new == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            || new == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
    {
        src_access = vk::AccessFlags::TRANSFER_READ;
        src_stage = vk::PipelineStageFlags::TRANSFER;
    }

    // A general image entering a transfer was last written by compute
    if old == vk::ImageLayout::GENERAL
        && (new == vk::ImageLayout::TRANSFER_SRC_OPTIMAL
            || new == vk::ImageLayout::TRANSFER_DST_OPTIMAL)
    {
        src_access = vk::AccessFlags::SHADER_WRITE;
        src_stage = vk::PipelineStageFlags::COMPUTE_SHADER;
    }

    BarrierMasks {
        src_access,
        src_stage,
        dst_access,
        dst_stage,
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn emit_barrier(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    texture: &Texture,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    base_mip: u32,
    mip_count: u32,
    base_layer: u32,
    layer_count: u32,
) {
    let masks = barrier_masks(old_layout, new_layout);
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(texture.expect_image())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(texture.aspect())
                .base_mip_level(base_mip)
                .level_count(mip_count)
                .base_array_layer(base_layer)
                .layer_count(layer_count),
        );

    device.cmd_pipeline_barrier(
        cb,
        masks.src_stage,
        masks.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// Transition a subresource range whose cells share one current layout,
/// emitting at most one barrier.
///
/// # Safety
/// The device and command buffer must be valid and the command buffer must be
/// recording.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn transition(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    texture: &Texture,
    base_mip: u32,
    mip_count: u32,
    base_layer: u32,
    layer_count: u32,
    new_layout: vk::ImageLayout,
) -> Result<()> {
    if texture.is_staging() {
        return Err(GpuError::InvalidState(
            "staging textures have no tracked layout".to_string(),
        ));
    }

    let old = texture.layouts.lock().transition_matching(
        base_mip,
        mip_count,
        base_layer,
        layer_count,
        new_layout,
    );
    if let Some(old) = old {
        tracing::trace!(?old, new = ?new_layout, base_mip, mip_count, "image layout transition");
        emit_barrier(
            device, cb, texture, old, new_layout, base_mip, mip_count, base_layer, layer_count,
        );
    }
    Ok(())
}

/// Transition a subresource range cell by cell, tolerating differing current
/// layouts across the range.
///
/// # Safety
/// The device and command buffer must be valid and the command buffer must be
/// recording.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn transition_each(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    texture: &Texture,
    base_mip: u32,
    mip_count: u32,
    base_layer: u32,
    layer_count: u32,
    new_layout: vk::ImageLayout,
) -> Result<()> {
    if texture.is_staging() {
        return Err(GpuError::InvalidState(
            "staging textures have no tracked layout".to_string(),
        ));
    }

    for layer in base_layer..base_layer + layer_count {
        for mip in base_mip..base_mip + mip_count {
            let old = texture.layouts.lock().transition_single(mip, layer, new_layout);
            if let Some(old) = old {
                emit_barrier(device, cb, texture, old, new_layout, mip, 1, layer, 1);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_image_transition_sources_from_top_of_pipe() {
        let masks = barrier_masks(
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(masks.src_access, vk::AccessFlags::NONE);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::TRANSFER);
    }

    #[test]
    fn sampled_to_transfer_src() {
        let masks = barrier_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert_eq!(masks.src_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(masks.dst_access, vk::AccessFlags::TRANSFER_READ);
    }

    #[test]
    fn present_source_uses_bottom_of_pipe() {
        let masks = barrier_masks(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(masks.src_access, vk::AccessFlags::MEMORY_READ);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn general_is_context_sensitive() {
        // As a source outside the overrides: transfer read
        let masks = barrier_masks(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(masks.src_stage, vk::PipelineStageFlags::TRANSFER);

        // As a destination: compute shader read
        let masks = barrier_masks(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
        assert_eq!(masks.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
    }

    #[test]
    fn sampled_to_attachment_override() {
        for new in [
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ] {
            let masks = barrier_masks(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, new);
            assert_eq!(masks.src_access, vk::AccessFlags::TRANSFER_READ);
            assert_eq!(masks.src_stage, vk::PipelineStageFlags::TRANSFER);
        }
    }

    #[test]
    fn general_to_transfer_override() {
        for new in [
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ] {
            let masks = barrier_masks(vk::ImageLayout::GENERAL, new);
            assert_eq!(masks.src_access, vk::AccessFlags::SHADER_WRITE);
            assert_eq!(masks.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        }
    }

    #[test]
    fn tracker_transition_is_idempotent() {
        let mut tracker = LayoutTracker::new(4, 2, vk::ImageLayout::PREINITIALIZED);
        let first = tracker.transition_matching(0, 4, 0, 2, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(first, Some(vk::ImageLayout::PREINITIALIZED));
        let second = tracker.transition_matching(0, 4, 0, 2, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(second, None);
    }

    #[test]
    fn tracker_updates_only_the_range() {
        let mut tracker = LayoutTracker::new(3, 2, vk::ImageLayout::UNDEFINED);
        tracker.transition_matching(1, 1, 0, 1, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(tracker.get(0, 0), vk::ImageLayout::UNDEFINED);
        assert_eq!(tracker.get(1, 0), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(tracker.get(1, 1), vk::ImageLayout::UNDEFINED);
        assert_eq!(tracker.get(2, 0), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn single_cell_transitions_tolerate_mixed_layouts() {
        let mut tracker = LayoutTracker::new(2, 1, vk::ImageLayout::UNDEFINED);
        tracker.transition_single(0, 0, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(
            tracker.transition_single(1, 0, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            Some(vk::ImageLayout::UNDEFINED)
        );
        assert_eq!(
            tracker.transition_single(0, 0, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
            None
        );
    }
}
