//! Resource sets and descriptor management.
//!
//! A [`ResourceSet`] is a written descriptor set plus the resources it
//! references. The recorder needs that list to ref-count resources per
//! recording and to transition sampled/storage textures before dispatches.

use crate::buffer::DeviceBuffer;
use crate::error::Result;
use crate::resource::RefCount;
use crate::sampler::Sampler;
use crate::texture::Texture;
use ash::vk;
use std::sync::Arc;

/// Which pipeline kind a set or pipeline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// One bound resource within a set, in binding order.
#[derive(Clone)]
pub enum ResourceBinding {
    /// Uniform buffer.
    UniformBuffer(Arc<DeviceBuffer>),
    /// Uniform buffer addressed with a dynamic offset at bind time.
    DynamicUniformBuffer(Arc<DeviceBuffer>),
    /// Storage buffer.
    StorageBuffer(Arc<DeviceBuffer>),
    /// Sampled image.
    SampledTexture(Arc<Texture>),
    /// Storage image.
    StorageTexture(Arc<Texture>),
    /// Standalone sampler.
    Sampler(Arc<Sampler>),
}

impl ResourceBinding {
    fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            Self::DynamicUniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            Self::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            Self::SampledTexture(_) => vk::DescriptorType::SAMPLED_IMAGE,
            Self::StorageTexture(_) => vk::DescriptorType::STORAGE_IMAGE,
            Self::Sampler(_) => vk::DescriptorType::SAMPLER,
        }
    }
}

/// A written descriptor set plus the resources it references.
pub struct ResourceSet {
    pub set: vk::DescriptorSet,
    pub kind: PipelineKind,
    pub(crate) bindings: Vec<ResourceBinding>,
    pub(crate) refs: RefCount,
}

impl ResourceSet {
    /// Allocate a set from the pool and write every binding.
    ///
    /// # Safety
    /// The device must be valid and the layout must match the bindings.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        pool: &DescriptorPool,
        layout: vk::DescriptorSetLayout,
        kind: PipelineKind,
        bindings: Vec<ResourceBinding>,
    ) -> Result<Self> {
        let set = pool.allocate(device, &[layout])?[0];

        for (index, binding) in bindings.iter().enumerate() {
            write_binding(device, set, index as u32, binding);
        }

        Ok(Self {
            set,
            kind,
            bindings,
            refs: RefCount::new(),
        })
    }

    /// Sampled textures referenced by this set.
    pub(crate) fn sampled_textures(&self) -> impl Iterator<Item = &Arc<Texture>> {
        self.bindings.iter().filter_map(|binding| match binding {
            ResourceBinding::SampledTexture(texture) => Some(texture),
            _ => None,
        })
    }

    /// Storage textures referenced by this set.
    pub(crate) fn storage_textures(&self) -> impl Iterator<Item = &Arc<Texture>> {
        self.bindings.iter().filter_map(|binding| match binding {
            ResourceBinding::StorageTexture(texture) => Some(texture),
            _ => None,
        })
    }

    /// Release the descriptor set back to its pool.
    ///
    /// # Safety
    /// The device must be valid and the set must not be referenced by any
    /// in-flight recording.
    pub(crate) unsafe fn destroy(self, device: &ash::Device, pool: &DescriptorPool) {
        debug_assert!(!self.refs.is_in_use(), "resource set destroyed while in use");
        let _ = device.free_descriptor_sets(pool.handle(), &[self.set]);
    }
}

unsafe fn write_binding(
    device: &ash::Device,
    set: vk::DescriptorSet,
    binding: u32,
    resource: &ResourceBinding,
) {
    let descriptor_type = resource.descriptor_type();
    match resource {
        ResourceBinding::UniformBuffer(buffer)
        | ResourceBinding::DynamicUniformBuffer(buffer)
        | ResourceBinding::StorageBuffer(buffer) => {
            let buffer_info = vk::DescriptorBufferInfo::default()
                .buffer(buffer.buffer)
                .offset(0)
                .range(vk::WHOLE_SIZE);
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(descriptor_type)
                .buffer_info(std::slice::from_ref(&buffer_info));
            device.update_descriptor_sets(&[write], &[]);
        }
        ResourceBinding::SampledTexture(texture) => {
            let image_info = vk::DescriptorImageInfo::default()
                .image_view(texture.expect_view())
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(descriptor_type)
                .image_info(std::slice::from_ref(&image_info));
            device.update_descriptor_sets(&[write], &[]);
        }
        ResourceBinding::StorageTexture(texture) => {
            let image_info = vk::DescriptorImageInfo::default()
                .image_view(texture.expect_view())
                .image_layout(vk::ImageLayout::GENERAL);
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(descriptor_type)
                .image_info(std::slice::from_ref(&image_info));
            device.update_descriptor_sets(&[write], &[]);
        }
        ResourceBinding::Sampler(sampler) => {
            let image_info = vk::DescriptorImageInfo::default().sampler(sampler.sampler);
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(descriptor_type)
                .image_info(std::slice::from_ref(&image_info));
            device.update_descriptor_sets(&[write], &[]);
        }
    }
}

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a dynamically offset uniform buffer binding.
    pub fn dynamic_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            1,
            stage_flags,
        )
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::SAMPLED_IMAGE, 1, stage_flags)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Add a sampler binding.
    pub fn sampler(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::SAMPLER, 1, stage_flags)
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor pool for allocating resource sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate descriptor sets.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets)
    }

    /// Reset the pool, freeing all descriptor sets.
    ///
    /// # Safety
    /// The device must be valid and no descriptor sets must be in use.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device.reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())?;
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}
