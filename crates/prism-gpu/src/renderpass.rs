//! Framebuffers and their cached render-pass variants.
//!
//! Each attachment set owns three render passes: a clearing variant for when
//! every attachment has a queued clear, a load variant whose initial layouts
//! describe the attachments' first activation, and a load variant for
//! subsequent activations. The attachment set uniquely determines all three
//! plus the single `VkFramebuffer`.

use crate::error::Result;
use crate::format::{has_stencil, mip_dimension};
use crate::resource::RefCount;
use crate::texture::Texture;
use ash::vk;
use std::sync::Arc;

/// One attachment: a texture subresource.
#[derive(Clone)]
pub struct FramebufferAttachmentDesc {
    pub texture: Arc<Texture>,
    pub mip_level: u32,
    pub array_layer: u32,
}

/// Framebuffer creation parameters.
#[derive(Clone, Default)]
pub struct FramebufferDesc {
    /// Color attachments, in shader output order.
    pub color: Vec<FramebufferAttachmentDesc>,
    /// Optional depth/stencil attachment.
    pub depth_stencil: Option<FramebufferAttachmentDesc>,
}

/// An attachment bound into a framebuffer, with its subresource view.
pub(crate) struct AttachmentView {
    pub texture: Arc<Texture>,
    pub mip_level: u32,
    pub array_layer: u32,
    pub view: vk::ImageView,
}

/// Which render-pass variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassVariant {
    /// Every attachment clears on load; initial layout is undefined.
    Clear,
    /// Load contents; initial layouts describe the first activation.
    NoClearInit,
    /// Load contents; initial layout equals the final layout.
    NoClearLoad,
}

/// A framebuffer and its three cached render passes.
pub struct Framebuffer {
    pub(crate) color: Vec<AttachmentView>,
    pub(crate) depth: Option<AttachmentView>,
    pub(crate) clear_pass: vk::RenderPass,
    pub(crate) no_clear_init_pass: vk::RenderPass,
    pub(crate) no_clear_load_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub(crate) refs: RefCount,
}

impl Framebuffer {
    /// Create a framebuffer and its render-pass variants.
    ///
    /// # Safety
    /// The device must be valid and every attachment texture must outlive the
    /// framebuffer.
    pub(crate) unsafe fn new(device: &ash::Device, desc: &FramebufferDesc) -> Result<Self> {
        if desc.color.is_empty() && desc.depth_stencil.is_none() {
            return Err(crate::error::GpuError::InvalidState(
                "framebuffer needs at least one attachment".to_string(),
            ));
        }

        let mut color = Vec::with_capacity(desc.color.len());
        for attachment in &desc.color {
            match create_attachment_view(device, attachment) {
                Ok(view) => color.push(view),
                Err(e) => {
                    destroy_views(device, &color, None);
                    return Err(e);
                }
            }
        }
        let depth = match &desc.depth_stencil {
            Some(attachment) => match create_attachment_view(device, attachment) {
                Ok(view) => Some(view),
                Err(e) => {
                    destroy_views(device, &color, None);
                    return Err(e);
                }
            },
            None => None,
        };

        let build = |variant| build_render_pass(device, &color, depth.as_ref(), variant);
        let clear_pass = match build(PassVariant::Clear) {
            Ok(p) => p,
            Err(e) => {
                destroy_views(device, &color, depth.as_ref());
                return Err(e);
            }
        };
        let no_clear_init_pass = match build(PassVariant::NoClearInit) {
            Ok(p) => p,
            Err(e) => {
                device.destroy_render_pass(clear_pass, None);
                destroy_views(device, &color, depth.as_ref());
                return Err(e);
            }
        };
        let no_clear_load_pass = match build(PassVariant::NoClearLoad) {
            Ok(p) => p,
            Err(e) => {
                device.destroy_render_pass(clear_pass, None);
                device.destroy_render_pass(no_clear_init_pass, None);
                destroy_views(device, &color, depth.as_ref());
                return Err(e);
            }
        };

        let extent = attachment_extent(&color, depth.as_ref());
        let views: Vec<vk::ImageView> = color
            .iter()
            .map(|a| a.view)
            .chain(depth.as_ref().map(|a| a.view))
            .collect();

        let fb_info = vk::FramebufferCreateInfo::default()
            .render_pass(no_clear_load_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = match device.create_framebuffer(&fb_info, None) {
            Ok(fb) => fb,
            Err(e) => {
                device.destroy_render_pass(clear_pass, None);
                device.destroy_render_pass(no_clear_init_pass, None);
                device.destroy_render_pass(no_clear_load_pass, None);
                destroy_views(device, &color, depth.as_ref());
                return Err(e.into());
            }
        };

        Ok(Self {
            color,
            depth,
            clear_pass,
            no_clear_init_pass,
            no_clear_load_pass,
            framebuffer,
            extent,
            refs: RefCount::new(),
        })
    }

    /// Number of color attachments.
    pub fn color_count(&self) -> usize {
        self.color.len()
    }

    /// Whether a depth/stencil attachment is present.
    pub fn has_depth(&self) -> bool {
        self.depth.is_some()
    }

    /// Total number of attachments.
    pub(crate) fn attachment_count(&self) -> usize {
        self.color.len() + usize::from(self.depth.is_some())
    }

    /// Record every attachment as being in its attachment-optimal layout.
    ///
    /// The render pass performs the actual transition at begin; this keeps
    /// the layout tracker in agreement with it.
    pub(crate) fn transition_to_intermediate_layout(&self) {
        for attachment in &self.color {
            attachment.texture.set_subresource_layout(
                attachment.mip_level,
                attachment.array_layer,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );
        }
        if let Some(attachment) = &self.depth {
            attachment.texture.set_subresource_layout(
                attachment.mip_level,
                attachment.array_layer,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            );
        }
    }

    /// Transition sampled attachments back to shader-readable after a pass.
    ///
    /// # Safety
    /// The device and command buffer must be valid and recording.
    pub(crate) unsafe fn transition_to_final_layout(
        &self,
        device: &ash::Device,
        cb: vk::CommandBuffer,
    ) -> Result<()> {
        for attachment in self.color.iter().chain(self.depth.as_ref()) {
            if attachment.texture.is_sampled() {
                crate::layout::transition(
                    device,
                    cb,
                    &attachment.texture,
                    attachment.mip_level,
                    1,
                    attachment.array_layer,
                    1,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )?;
            }
        }
        Ok(())
    }

    /// Destroy the framebuffer, its render passes, and its attachment views.
    ///
    /// # Safety
    /// The device must be valid and the framebuffer must not be referenced by
    /// any in-flight recording.
    pub(crate) unsafe fn destroy(self, device: &ash::Device) {
        debug_assert!(!self.refs.is_in_use(), "framebuffer destroyed while in use");
        device.destroy_framebuffer(self.framebuffer, None);
        device.destroy_render_pass(self.clear_pass, None);
        device.destroy_render_pass(self.no_clear_init_pass, None);
        device.destroy_render_pass(self.no_clear_load_pass, None);
        destroy_views(device, &self.color, self.depth.as_ref());
    }
}

unsafe fn create_attachment_view(
    device: &ash::Device,
    desc: &FramebufferAttachmentDesc,
) -> Result<AttachmentView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(desc.texture.expect_image())
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(desc.texture.format)
        .components(vk::ComponentMapping::default())
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(desc.texture.aspect())
                .base_mip_level(desc.mip_level)
                .level_count(1)
                .base_array_layer(desc.array_layer)
                .layer_count(1),
        );

    let view = device.create_image_view(&view_info, None)?;
    Ok(AttachmentView {
        texture: desc.texture.clone(),
        mip_level: desc.mip_level,
        array_layer: desc.array_layer,
        view,
    })
}

unsafe fn destroy_views(
    device: &ash::Device,
    color: &[AttachmentView],
    depth: Option<&AttachmentView>,
) {
    for attachment in color.iter().chain(depth) {
        device.destroy_image_view(attachment.view, None);
    }
}

/// Layout a color attachment is in when its framebuffer first activates.
fn initial_color_layout(texture: &Texture) -> vk::ImageLayout {
    if texture.is_swapchain() {
        vk::ImageLayout::PRESENT_SRC_KHR
    } else if texture.is_sampled() {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

/// Layout a depth attachment is in when its framebuffer first activates.
fn initial_depth_layout(texture: &Texture) -> vk::ImageLayout {
    if texture.is_sampled() {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    }
}

unsafe fn build_render_pass(
    device: &ash::Device,
    color: &[AttachmentView],
    depth: Option<&AttachmentView>,
    variant: PassVariant,
) -> Result<vk::RenderPass> {
    let mut attachments = Vec::with_capacity(color.len() + usize::from(depth.is_some()));
    let mut color_refs = Vec::with_capacity(color.len());

    for (index, attachment) in color.iter().enumerate() {
        let (load_op, initial_layout) = match variant {
            PassVariant::Clear => (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED),
            PassVariant::NoClearInit => (
                vk::AttachmentLoadOp::LOAD,
                initial_color_layout(&attachment.texture),
            ),
            PassVariant::NoClearLoad => (
                vk::AttachmentLoadOp::LOAD,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
        };
        attachments.push(
            vk::AttachmentDescription::default()
                .format(attachment.texture.format)
                .samples(attachment.texture.sample_count)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(initial_layout)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        color_refs.push(
            vk::AttachmentReference::default()
                .attachment(index as u32)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
    }

    let mut depth_ref = vk::AttachmentReference::default();
    if let Some(attachment) = depth {
        let stencil = has_stencil(attachment.texture.format);
        let (load_op, initial_layout) = match variant {
            PassVariant::Clear => (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED),
            PassVariant::NoClearInit => (
                vk::AttachmentLoadOp::LOAD,
                initial_depth_layout(&attachment.texture),
            ),
            PassVariant::NoClearLoad => (
                vk::AttachmentLoadOp::LOAD,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ),
        };
        // The stencil sub-aspect only participates when the format has one
        let (stencil_load, stencil_store) = if stencil {
            (load_op, vk::AttachmentStoreOp::STORE)
        } else {
            (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
        };
        depth_ref = vk::AttachmentReference::default()
            .attachment(attachments.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        attachments.push(
            vk::AttachmentDescription::default()
                .format(attachment.texture.format)
                .samples(attachment.texture.sample_count)
                .load_op(load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(stencil_load)
                .stencil_store_op(stencil_store)
                .initial_layout(initial_layout)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if depth.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    let subpasses = [subpass];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses);

    let pass = device.create_render_pass(&create_info, None)?;
    Ok(pass)
}

fn attachment_extent(color: &[AttachmentView], depth: Option<&AttachmentView>) -> vk::Extent2D {
    let first = color.first().or(depth).expect("framebuffer has no attachments");
    vk::Extent2D {
        width: mip_dimension(first.texture.extent.width, first.mip_level),
        height: mip_dimension(first.texture.extent.height, first.mip_level),
    }
}
