//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
///
/// Read-only snapshot taken at device selection; pipeline creation, the
/// recorder, and the memory manager consult it instead of re-querying the
/// driver.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,
    /// Whether the GPU shares memory with the host
    pub is_integrated: bool,

    // Optional pipeline features
    /// Geometry shader stage support
    pub geometry_shader: bool,
    /// Tessellation shader stages support
    pub tessellation_shaders: bool,
    /// More than one simultaneous viewport
    pub multiple_viewports: bool,
    /// Anisotropic filtering
    pub sampler_anisotropy: bool,
    /// Depth clip disable (`VK_EXT_depth_clip_enable`)
    pub depth_clip_disable: bool,
    /// Non-zero `firstInstance` in indirect draws
    pub draw_indirect_base_instance: bool,
    /// Wireframe fill mode
    pub fill_mode_wireframe: bool,
    /// Per-attachment blend state divergence
    pub independent_blend: bool,
    /// 64-bit floats in shaders
    pub shader_float64: bool,
    /// Compute shader support
    pub compute_shader: bool,

    // Limits
    /// Smallest supported subgroup size
    pub subgroup_size_min: u32,
    /// Largest supported subgroup size
    pub subgroup_size_max: u32,
    /// Required separation between linear and optimal resources in a chunk
    pub buffer_image_granularity: u64,
    /// Per-allocation size limit
    pub max_allocation_size: u64,
    /// Flush granularity of non-coherent host-visible memory
    pub non_coherent_atom_size: u64,
    /// Minimum uniform buffer offset alignment
    pub min_uniform_buffer_offset_alignment: u64,
    /// Minimum storage buffer offset alignment
    pub min_storage_buffer_offset_alignment: u64,
    /// Largest supported anisotropy level
    pub max_sampler_anisotropy: f32,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let features = instance.get_physical_device_features(physical_device);

        // Chain the property structs the core needs
        let mut maintenance3 = vk::PhysicalDeviceMaintenance3Properties::default();
        let mut vulkan11 = vk::PhysicalDeviceVulkan11Properties::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut maintenance3)
            .push_next(&mut vulkan11);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        // Get available extensions
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        // Parse device info
        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let subgroup_size = vulkan11.subgroup_size.max(1);

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            is_integrated: properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU,

            geometry_shader: features.geometry_shader == vk::TRUE,
            tessellation_shaders: features.tessellation_shader == vk::TRUE,
            multiple_viewports: features.multi_viewport == vk::TRUE,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            depth_clip_disable: available_extensions.contains("VK_EXT_depth_clip_enable"),
            draw_indirect_base_instance: features.draw_indirect_first_instance == vk::TRUE,
            fill_mode_wireframe: features.fill_mode_non_solid == vk::TRUE,
            independent_blend: features.independent_blend == vk::TRUE,
            shader_float64: features.shader_float64 == vk::TRUE,
            // Every Vulkan graphics queue is also compute capable
            compute_shader: true,

            subgroup_size_min: subgroup_size,
            subgroup_size_max: subgroup_size,
            buffer_image_granularity: properties.limits.buffer_image_granularity,
            max_allocation_size: maintenance3.max_memory_allocation_size,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: properties
                .limits
                .min_storage_buffer_offset_alignment,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,

            available_extensions,
        }
    }

    /// Check if the GPU meets the library's minimum requirements.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        // Vulkan 1.2 core is the baseline
        api_major > 1 || (api_major == 1 && api_minor >= 2)
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }
}
