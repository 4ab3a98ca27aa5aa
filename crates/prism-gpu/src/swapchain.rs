//! Swapchain management.
//!
//! The window-system surface and its queried properties come from the host;
//! this module picks a format, present mode, and extent from them and wraps
//! the swapchain images as [`Texture`]s of the swapchain variant so they can
//! be used as framebuffer attachments like any other render target. Each
//! acquire resets the image's tracked layout to undefined, which is what the
//! presentation engine guarantees.

use crate::error::{GpuError, Result};
use crate::texture::Texture;
use ash::vk;
use std::sync::Arc;

/// Swapchain wrapper.
pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub(crate) image_views: Vec<vk::ImageView>,
    textures: Vec<Arc<Texture>>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a new swapchain from a host-provided surface and its queried
    /// capabilities, formats, and present modes.
    ///
    /// # Safety
    /// All handles must be valid and the queried data must belong to the
    /// surface.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        surface_capabilities: &vk::SurfaceCapabilitiesKHR,
        available_formats: &[vk::SurfaceFormatKHR],
        available_present_modes: &[vk::PresentModeKHR],
        desired_width: u32,
        desired_height: u32,
        vsync: bool,
        old_swapchain: Option<vk::SwapchainKHR>,
        graphics_queue_family: u32,
    ) -> Result<Self> {
        let surface_format = select_surface_format(available_formats);
        let present_mode = select_present_mode(available_present_modes, vsync);
        let extent = calculate_extent(surface_capabilities, desired_width, desired_height);

        // Determine image count
        let mut image_count = surface_capabilities.min_image_count + 1;
        if surface_capabilities.max_image_count > 0
            && image_count > surface_capabilities.max_image_count
        {
            image_count = surface_capabilities.max_image_count;
        }

        let queue_families = [graphics_queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(surface_capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let swapchain = swapchain_loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        // Get swapchain images
        let images = swapchain_loader.get_swapchain_images(swapchain)?;

        // Create image views
        let image_views: Vec<_> = images
            .iter()
            .map(|&image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .base_mip_level(0)
                            .level_count(1)
                            .base_array_layer(0)
                            .layer_count(1),
                    );

                device.create_image_view(&view_info, None)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let textures = images
            .iter()
            .zip(&image_views)
            .map(|(&image, &view)| {
                Arc::new(Texture::wrap_swapchain_image(
                    image,
                    view,
                    surface_format.format,
                    extent,
                ))
            })
            .collect();

        Ok(Self {
            swapchain,
            image_views,
            textures,
            format: surface_format.format,
            extent,
        })
    }

    /// Number of swapchain images.
    pub fn image_count(&self) -> usize {
        self.textures.len()
    }

    /// Texture wrapping one swapchain image.
    pub fn texture(&self, index: u32) -> &Arc<Texture> {
        &self.textures[index as usize]
    }

    /// Acquire the next image.
    ///
    /// The acquired texture's tracked layout resets to undefined.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool)> {
        let result = swapchain_loader.acquire_next_image(
            self.swapchain,
            timeout_ns,
            semaphore,
            vk::Fence::null(),
        );

        match result {
            Ok((index, suboptimal)) => {
                self.textures[index as usize].force_layout(vk::ImageLayout::UNDEFINED);
                Ok((index, suboptimal))
            }
            // OUT_OF_DATE means no image was acquired; caller must recreate the swapchain.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR))
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image.
    ///
    /// The image must have been transitioned to the present layout via
    /// [`CommandRecorder::prepare_present`](crate::recorder::CommandRecorder::prepare_present)
    /// in a recording submitted before this call.
    ///
    /// # Safety
    /// All handles must be valid.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        swapchain_loader: &ash::khr::swapchain::Device,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = swapchain_loader.queue_present(queue, &present_info);

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Destroy the swapchain.
    ///
    /// # Safety
    /// All handles must be valid and swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.image_views {
            device.destroy_image_view(view, None);
        }
        swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Select the best surface format.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    // Prefer SRGB
    for format in available {
        if format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return *format;
        }
    }

    // Fall back to first available
    available[0]
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // Prefer FIFO (vsync)
        vk::PresentModeKHR::FIFO
    } else {
        // Prefer mailbox (triple buffering without vsync)
        for &mode in available {
            if mode == vk::PresentModeKHR::MAILBOX {
                return mode;
            }
        }
        // Fall back to immediate
        for &mode in available {
            if mode == vk::PresentModeKHR::IMMEDIATE {
                return mode;
            }
        }
        // Fall back to FIFO (always supported)
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn srgb_surface_format_is_preferred() {
        let available = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            select_surface_format(&available).format,
            vk::Format::B8G8R8A8_SRGB
        );

        // Without the preferred pair, the first entry wins
        let available = [format(
            vk::Format::R8G8B8A8_UNORM,
            vk::ColorSpaceKHR::SRGB_NONLINEAR,
        )];
        assert_eq!(
            select_surface_format(&available).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn present_mode_follows_vsync_request() {
        let available = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            select_present_mode(&available, true),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            select_present_mode(&available, false),
            vk::PresentModeKHR::MAILBOX
        );

        // Mailbox unavailable: immediate beats FIFO when vsync is off
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&available, false),
            vk::PresentModeKHR::IMMEDIATE
        );

        let available = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&available, false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_honors_surface_constraints() {
        // A fixed current extent wins over the requested size
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&capabilities, 1024, 768);
        assert_eq!((extent.width, extent.height), (800, 600));

        // An unconstrained surface clamps the request to its bounds
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&capabilities, 4096, 100);
        assert_eq!((extent.width, extent.height), (1920, 480));
    }
}
