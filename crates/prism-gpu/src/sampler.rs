//! Samplers.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::resource::RefCount;
use ash::vk;

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Anisotropy level; requires the `sampler_anisotropy` feature.
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

/// A sampler and its ref-count.
pub struct Sampler {
    pub sampler: vk::Sampler,
    pub(crate) refs: RefCount,
}

impl Sampler {
    /// Create a sampler.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        capabilities: &GpuCapabilities,
        desc: &SamplerDesc,
    ) -> Result<Self> {
        if desc.max_anisotropy.is_some() && !capabilities.sampler_anisotropy {
            return Err(GpuError::FeatureUnavailable("sampler_anisotropy"));
        }

        let mut info = vk::SamplerCreateInfo::default()
            .min_filter(desc.min_filter)
            .mag_filter(desc.mag_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        if let Some(anisotropy) = desc.max_anisotropy {
            info = info
                .anisotropy_enable(true)
                .max_anisotropy(anisotropy.min(capabilities.max_sampler_anisotropy));
        }
        if let Some(compare_op) = desc.compare_op {
            info = info.compare_enable(true).compare_op(compare_op);
        }

        let sampler = device.create_sampler(&info, None)?;
        Ok(Self {
            sampler,
            refs: RefCount::new(),
        })
    }

    /// Destroy the sampler.
    ///
    /// # Safety
    /// The device must be valid and the sampler must not be referenced by any
    /// in-flight recording.
    pub(crate) unsafe fn destroy(self, device: &ash::Device) {
        debug_assert!(!self.refs.is_in_use(), "sampler destroyed while in use");
        device.destroy_sampler(self.sampler, None);
    }
}
