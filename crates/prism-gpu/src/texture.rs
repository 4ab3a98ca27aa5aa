//! Textures.
//!
//! Three variants share one type: GPU-owned optimal-tiled images, staging
//! textures backed by host-visible buffers, and swapchain images borrowed
//! from the presentation engine.

use crate::error::{GpuError, Result};
use crate::format::{aspect_mask, block_size_bytes, blocks_covering, is_depth_stencil_format, mip_dimension};
use crate::layout::LayoutTracker;
use crate::memory::{AllocationIntent, DeviceMemoryManager, MemoryRange};
use crate::resource::RefCount;
use ash::vk;
use bitflags::bitflags;
use parking_lot::Mutex;

bitflags! {
    /// How a texture may be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TextureUsage: u32 {
        /// Shader-sampled image.
        const SAMPLED = 1 << 0;
        /// Shader storage image.
        const STORAGE = 1 << 1;
        /// Color attachment.
        const RENDER_TARGET = 1 << 2;
        /// Depth/stencil attachment.
        const DEPTH_STENCIL = 1 << 3;
        /// Mip chain is filled by blitting from level 0.
        const GENERATE_MIPMAPS = 1 << 4;
    }
}

/// Which variant a texture is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    /// GPU-owned optimal-tiled image.
    Owned,
    /// Host-visible, buffer-backed upload/readback texture.
    Staging,
    /// Image borrowed from a swapchain.
    Swapchain,
}

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub usage: TextureUsage,
    pub sample_count: vk::SampleCountFlags,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: TextureUsage::SAMPLED,
            sample_count: vk::SampleCountFlags::TYPE_1,
        }
    }
}

pub(crate) enum TextureResource {
    Image {
        image: vk::Image,
        view: vk::ImageView,
        memory: Option<MemoryRange>,
        swapchain: bool,
    },
    Staging {
        buffer: vk::Buffer,
        memory: MemoryRange,
    },
}

/// Subresource placement within a staging texture's backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StagingSubresource {
    pub offset: u64,
    pub row_pitch: u64,
    pub depth_pitch: u64,
}

/// A texture and its per-subresource layout state.
pub struct Texture {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: TextureUsage,
    pub sample_count: vk::SampleCountFlags,
    pub(crate) resource: TextureResource,
    pub(crate) layouts: Mutex<LayoutTracker>,
    pub(crate) refs: RefCount,
    pub(crate) linear_filterable: bool,
}

impl Texture {
    /// Create a GPU-owned optimal-tiled texture.
    ///
    /// `linear_filterable` reports whether the device supports linear
    /// filtering when sampling this format; mipmap generation consults it.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        memory: &DeviceMemoryManager,
        desc: &TextureDesc,
        intent: &AllocationIntent,
        linear_filterable: bool,
    ) -> Result<Self> {
        let image_type = if desc.depth > 1 {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };
        let extent = vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
        };

        let info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .format(desc.format)
            .extent(extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.sample_count)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk_image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);

        let (image, range) = memory.create_image(&info, intent)?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type(desc))
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(view_aspect(desc.format))
                    .base_mip_level(0)
                    .level_count(desc.mip_levels)
                    .base_array_layer(0)
                    .layer_count(desc.array_layers),
            );

        let view = match device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                device.destroy_image(image, None);
                memory.free(range);
                return Err(e.into());
            }
        };

        Ok(Self {
            format: desc.format,
            extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            usage: desc.usage,
            sample_count: desc.sample_count,
            resource: TextureResource::Image {
                image,
                view,
                memory: Some(range),
                swapchain: false,
            },
            layouts: Mutex::new(LayoutTracker::new(
                desc.mip_levels,
                desc.array_layers,
                vk::ImageLayout::PREINITIALIZED,
            )),
            refs: RefCount::new(),
            linear_filterable,
        })
    }

    /// Create a staging texture backed by a persistently mapped buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new_staging(
        memory: &DeviceMemoryManager,
        desc: &TextureDesc,
    ) -> Result<Self> {
        let size = staging_total_size(desc);
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (buffer, range) = memory.create_buffer(&info, &AllocationIntent::staging())?;

        Ok(Self {
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            },
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            usage: desc.usage,
            sample_count: vk::SampleCountFlags::TYPE_1,
            resource: TextureResource::Staging {
                buffer,
                memory: range,
            },
            layouts: Mutex::new(LayoutTracker::new(
                desc.mip_levels,
                desc.array_layers,
                vk::ImageLayout::PREINITIALIZED,
            )),
            refs: RefCount::new(),
            linear_filterable: false,
        })
    }

    /// Wrap an image acquired from a swapchain.
    pub(crate) fn wrap_swapchain_image(
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            usage: TextureUsage::RENDER_TARGET,
            sample_count: vk::SampleCountFlags::TYPE_1,
            resource: TextureResource::Image {
                image,
                view,
                memory: None,
                swapchain: true,
            },
            layouts: Mutex::new(LayoutTracker::new(1, 1, vk::ImageLayout::UNDEFINED)),
            refs: RefCount::new(),
            linear_filterable: false,
        }
    }

    /// Which variant this texture is.
    pub fn kind(&self) -> TextureKind {
        match &self.resource {
            TextureResource::Image { swapchain: true, .. } => TextureKind::Swapchain,
            TextureResource::Image { .. } => TextureKind::Owned,
            TextureResource::Staging { .. } => TextureKind::Staging,
        }
    }

    pub fn is_staging(&self) -> bool {
        self.kind() == TextureKind::Staging
    }

    pub fn is_swapchain(&self) -> bool {
        self.kind() == TextureKind::Swapchain
    }

    pub fn is_sampled(&self) -> bool {
        self.usage.contains(TextureUsage::SAMPLED)
    }

    pub fn is_storage(&self) -> bool {
        self.usage.contains(TextureUsage::STORAGE)
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.usage.contains(TextureUsage::DEPTH_STENCIL)
    }

    /// Aspect mask derived from the format.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_mask(self.format)
    }

    /// Current tracked layout of one subresource.
    pub fn current_layout(&self, mip: u32, layer: u32) -> vk::ImageLayout {
        self.layouts.lock().get(mip, layer)
    }

    /// Overwrite the tracked layout of every subresource without a barrier.
    ///
    /// Used when the presentation engine hands the image back in a known
    /// layout.
    pub(crate) fn force_layout(&self, layout: vk::ImageLayout) {
        self.layouts
            .lock()
            .set_range(0, self.mip_levels, 0, self.array_layers, layout);
    }

    /// Overwrite the tracked layout of one subresource without a barrier.
    ///
    /// Used when a render pass performs the transition itself.
    pub(crate) fn set_subresource_layout(&self, mip: u32, layer: u32, layout: vk::ImageLayout) {
        self.layouts.lock().set_range(mip, 1, layer, 1, layout);
    }

    /// The underlying image handle. Panics on staging textures.
    pub(crate) fn expect_image(&self) -> vk::Image {
        match &self.resource {
            TextureResource::Image { image, .. } => *image,
            TextureResource::Staging { .. } => {
                panic!("staging texture used where an image is required")
            }
        }
    }

    /// The full-range image view. Panics on staging textures.
    pub(crate) fn expect_view(&self) -> vk::ImageView {
        match &self.resource {
            TextureResource::Image { view, .. } => *view,
            TextureResource::Staging { .. } => {
                panic!("staging texture used where an image view is required")
            }
        }
    }

    /// The backing buffer of a staging texture.
    pub(crate) fn staging_buffer(&self) -> Result<vk::Buffer> {
        match &self.resource {
            TextureResource::Staging { buffer, .. } => Ok(*buffer),
            TextureResource::Image { .. } => Err(GpuError::InvalidState(
                "texture is not a staging texture".to_string(),
            )),
        }
    }

    /// Host pointer into a staging texture's mapped memory.
    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        match &self.resource {
            TextureResource::Staging { memory, .. } => memory.mapped_ptr(),
            TextureResource::Image { .. } => None,
        }
    }

    /// Placement of one subresource within the staging buffer.
    pub(crate) fn staging_subresource(&self, mip: u32, layer: u32) -> StagingSubresource {
        debug_assert!(self.is_staging());
        staging_subresource(
            self.extent,
            self.mip_levels,
            self.format,
            mip,
            layer,
        )
    }

    /// Destroy the texture and release its memory.
    ///
    /// Swapchain textures are owned by their swapchain; destroying the
    /// wrapper is a no-op.
    ///
    /// # Safety
    /// The device must be valid and the texture must not be referenced by any
    /// in-flight recording.
    pub(crate) unsafe fn destroy(self, device: &ash::Device, memory: &DeviceMemoryManager) {
        debug_assert!(!self.refs.is_in_use(), "texture destroyed while in use");
        match self.resource {
            TextureResource::Image {
                image,
                view,
                memory: range,
                swapchain,
            } => {
                if swapchain {
                    return;
                }
                device.destroy_image_view(view, None);
                device.destroy_image(image, None);
                if let Some(range) = range {
                    memory.free(range);
                }
            }
            TextureResource::Staging {
                buffer,
                memory: range,
            } => {
                device.destroy_buffer(buffer, None);
                memory.free(range);
            }
        }
    }
}

fn vk_image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    // Every owned texture can participate in copies and mip generation
    let mut flags = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    if usage.contains(TextureUsage::SAMPLED) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    flags
}

fn view_type(desc: &TextureDesc) -> vk::ImageViewType {
    if desc.depth > 1 {
        vk::ImageViewType::TYPE_3D
    } else if desc.array_layers > 1 {
        vk::ImageViewType::TYPE_2D_ARRAY
    } else {
        vk::ImageViewType::TYPE_2D
    }
}

/// Aspect used for image views: sampling a combined depth-stencil format
/// reads the depth aspect only.
fn view_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_stencil_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Byte size of one mip level of one layer in a tightly packed staging
/// buffer.
fn staging_mip_size(extent: vk::Extent3D, format: vk::Format, mip: u32) -> u64 {
    let row_units = u64::from(blocks_covering(mip_dimension(extent.width, mip), format));
    let rows = u64::from(blocks_covering(mip_dimension(extent.height, mip), format));
    let depth = u64::from(mip_dimension(extent.depth, mip));
    row_units * u64::from(block_size_bytes(format)) * rows * depth
}

/// Placement of (mip, layer) in a tightly packed staging buffer: all mips of
/// layer 0, then all mips of layer 1, and so on.
pub(crate) fn staging_subresource(
    extent: vk::Extent3D,
    mip_levels: u32,
    format: vk::Format,
    mip: u32,
    layer: u32,
) -> StagingSubresource {
    let layer_size: u64 = (0..mip_levels)
        .map(|m| staging_mip_size(extent, format, m))
        .sum();
    let preceding: u64 = (0..mip)
        .map(|m| staging_mip_size(extent, format, m))
        .sum();

    let row_units = u64::from(blocks_covering(mip_dimension(extent.width, mip), format));
    let rows = u64::from(blocks_covering(mip_dimension(extent.height, mip), format));
    let row_pitch = row_units * u64::from(block_size_bytes(format));

    StagingSubresource {
        offset: u64::from(layer) * layer_size + preceding,
        row_pitch,
        depth_pitch: row_pitch * rows,
    }
}

/// Total buffer size backing a staging texture.
pub(crate) fn staging_total_size(desc: &TextureDesc) -> u64 {
    let extent = vk::Extent3D {
        width: desc.width,
        height: desc.height,
        depth: desc.depth,
    };
    let layer_size: u64 = (0..desc.mip_levels)
        .map(|m| staging_mip_size(extent, desc.format, m))
        .sum();
    (layer_size * u64::from(desc.array_layers)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(w: u32, h: u32, d: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: w,
            height: h,
            depth: d,
        }
    }

    #[test]
    fn staging_layout_is_tightly_packed() {
        // 8x8 RGBA8, 2 mips: mip 0 = 256 bytes, mip 1 = 64 bytes
        let sub = staging_subresource(extent(8, 8, 1), 2, vk::Format::R8G8B8A8_UNORM, 0, 0);
        assert_eq!(sub.offset, 0);
        assert_eq!(sub.row_pitch, 32);
        assert_eq!(sub.depth_pitch, 256);

        let sub = staging_subresource(extent(8, 8, 1), 2, vk::Format::R8G8B8A8_UNORM, 1, 0);
        assert_eq!(sub.offset, 256);
        assert_eq!(sub.row_pitch, 16);

        // Second layer starts after all mips of the first
        let sub = staging_subresource(extent(8, 8, 1), 2, vk::Format::R8G8B8A8_UNORM, 0, 1);
        assert_eq!(sub.offset, 256 + 64);
    }

    #[test]
    fn compressed_staging_layout_uses_block_rows() {
        // 16x16 BC1: 4x4 blocks, 8 bytes each -> 4 blocks per row, 32 bytes
        let sub = staging_subresource(extent(16, 16, 1), 1, vk::Format::BC1_RGBA_UNORM_BLOCK, 0, 0);
        assert_eq!(sub.row_pitch, 32);
        assert_eq!(sub.depth_pitch, 128);

        // A 2x2 mip still occupies one full block
        let sub = staging_subresource(extent(16, 16, 1), 3, vk::Format::BC1_RGBA_UNORM_BLOCK, 2, 0);
        assert_eq!(sub.row_pitch, 8);
        assert_eq!(sub.depth_pitch, 8);
    }

    #[test]
    fn staging_total_size_covers_all_layers() {
        let desc = TextureDesc {
            width: 8,
            height: 8,
            mip_levels: 2,
            array_layers: 3,
            ..Default::default()
        };
        assert_eq!(staging_total_size(&desc), (256 + 64) * 3);
    }

    #[test]
    fn swapchain_wrapper_reports_kind_and_layout() {
        let texture = Texture::wrap_swapchain_image(
            vk::Image::null(),
            vk::ImageView::null(),
            vk::Format::B8G8R8A8_SRGB,
            vk::Extent2D {
                width: 640,
                height: 480,
            },
        );
        assert_eq!(texture.kind(), TextureKind::Swapchain);
        assert!(!texture.is_staging());
        assert_eq!(texture.current_layout(0, 0), vk::ImageLayout::UNDEFINED);

        texture.force_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(texture.current_layout(0, 0), vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
