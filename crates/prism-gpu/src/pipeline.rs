//! Pipeline creation and management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::format::has_stencil;
use crate::resource::RefCount;
use ash::vk;

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub(crate) set_layout_count: u32,
    pub(crate) refs: RefCount,
}

impl ComputePipeline {
    /// Create a compute pipeline from shader code.
    ///
    /// # Safety
    /// The device must be valid and the shader code must be valid SPIR-V.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        capabilities: &GpuCapabilities,
        shader_code: &[u32],
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        if !capabilities.compute_shader {
            return Err(GpuError::FeatureUnavailable("compute_shader"));
        }

        // Create shader module
        let shader_info = vk::ShaderModuleCreateInfo::default().code(shader_code);
        let shader_module = device
            .create_shader_module(&shader_info, None)
            .map_err(|e| GpuError::ShaderCompilation(e.to_string()))?;

        // Create pipeline layout
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()));

        // Shader module is no longer needed either way
        device.destroy_shader_module(shader_module, None);

        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(e);
            }
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout,
            set_layout_count: descriptor_set_layouts.len() as u32,
            refs: RefCount::new(),
        })
    }

    /// Number of descriptor set slots the pipeline layout declares.
    pub fn set_count(&self) -> u32 {
        self.set_layout_count
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub(crate) unsafe fn destroy(self, device: &ash::Device) {
        debug_assert!(!self.refs.is_in_use(), "pipeline destroyed while in use");
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Per-attachment blend state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendAttachment {
    pub enable: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
}

impl Default for BlendAttachment {
    fn default() -> Self {
        Self {
            enable: false,
            src_color: vk::BlendFactor::ONE,
            dst_color: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha: vk::BlendFactor::ONE,
            dst_alpha: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
        }
    }
}

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    /// Optional geometry stage; requires the `geometry_shader` feature.
    pub geometry_shader: Option<Vec<u32>>,
    /// Optional tessellation stages; require the `tessellation_shaders`
    /// feature.
    pub tessellation_control_shader: Option<Vec<u32>>,
    pub tessellation_evaluation_shader: Option<Vec<u32>>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub patch_control_points: u32,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    /// One entry per color attachment; an empty list disables blending.
    pub blend: Vec<BlendAttachment>,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub sample_count: vk::SampleCountFlags,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            geometry_shader: None,
            tessellation_control_shader: None,
            tessellation_evaluation_shader: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            patch_control_points: 0,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            blend: Vec::new(),
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: Some(vk::Format::D32_SFLOAT),
            sample_count: vk::SampleCountFlags::TYPE_1,
        }
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub(crate) set_layout_count: u32,
    pub(crate) refs: RefCount,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline.
    ///
    /// The pipeline is built against a transient render pass compatible with
    /// the configured attachment formats; any framebuffer with those formats
    /// can use it.
    ///
    /// # Safety
    /// The device must be valid and shader code must be valid SPIR-V.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        capabilities: &GpuCapabilities,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        check_features(capabilities, config)?;

        // Create shader modules
        let mut modules: Vec<vk::ShaderModule> = Vec::new();
        let create_module = |code: &[u32], stage: &str| -> Result<vk::ShaderModule> {
            let info = vk::ShaderModuleCreateInfo::default().code(code);
            unsafe { device.create_shader_module(&info, None) }
                .map_err(|e| GpuError::ShaderCompilation(format!("{stage}: {e}")))
        };

        let mut shader_stages = Vec::new();
        let vert_module = create_module(&config.vertex_shader, "vertex")?;
        modules.push(vert_module);
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
        );

        for (code, stage_name, stage_flag) in [
            (
                config.geometry_shader.as_deref(),
                "geometry",
                vk::ShaderStageFlags::GEOMETRY,
            ),
            (
                config.tessellation_control_shader.as_deref(),
                "tessellation control",
                vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ),
            (
                config.tessellation_evaluation_shader.as_deref(),
                "tessellation evaluation",
                vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ),
        ] {
            if let Some(code) = code {
                let module = match create_module(code, stage_name) {
                    Ok(module) => module,
                    Err(e) => {
                        destroy_shader_modules(device, &modules);
                        return Err(e);
                    }
                };
                modules.push(module);
                shader_stages.push(
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(stage_flag)
                        .module(module)
                        .name(c"main"),
                );
            }
        }

        let frag_module = match create_module(&config.fragment_shader, "fragment") {
            Ok(module) => module,
            Err(e) => {
                destroy_shader_modules(device, &modules);
                return Err(e);
            }
        };
        modules.push(frag_module);
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        );

        // Vertex input
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        let tessellation = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(config.patch_control_points);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        // Rasterization
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        // Multisampling
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(config.sample_count)
            .sample_shading_enable(false);

        // Depth stencil
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // Color blending
        let color_blend_attachments: Vec<_> = config
            .color_formats
            .iter()
            .enumerate()
            .map(|(index, _)| {
                let blend = config
                    .blend
                    .get(index)
                    .or_else(|| config.blend.first())
                    .copied()
                    .unwrap_or_default();
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(blend.enable)
                    .src_color_blend_factor(blend.src_color)
                    .dst_color_blend_factor(blend.dst_color)
                    .color_blend_op(blend.color_op)
                    .src_alpha_blend_factor(blend.src_alpha)
                    .dst_alpha_blend_factor(blend.dst_alpha)
                    .alpha_blend_op(blend.alpha_op)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
            })
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        // Dynamic state
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        // Pipeline layout
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = match device.create_pipeline_layout(&layout_info, None) {
            Ok(layout) => layout,
            Err(e) => {
                destroy_shader_modules(device, &modules);
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };

        // A transient pass defines attachment compatibility; it can be
        // destroyed as soon as the pipeline exists
        let render_pass = match compatibility_render_pass(device, config) {
            Ok(pass) => pass,
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                destroy_shader_modules(device, &modules);
                return Err(e);
            }
        };

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);
        if config.patch_control_points > 0 {
            pipeline_info = pipeline_info.tessellation_state(&tessellation);
        }

        let pipelines = device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()));

        device.destroy_render_pass(render_pass, None);
        destroy_shader_modules(device, &modules);

        let pipelines = match pipelines {
            Ok(pipelines) => pipelines,
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                return Err(e);
            }
        };

        Ok(Self {
            pipeline: pipelines[0],
            layout,
            set_layout_count: descriptor_set_layouts.len() as u32,
            refs: RefCount::new(),
        })
    }

    /// Number of descriptor set slots the pipeline layout declares.
    pub fn set_count(&self) -> u32 {
        self.set_layout_count
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub(crate) unsafe fn destroy(self, device: &ash::Device) {
        debug_assert!(!self.refs.is_in_use(), "pipeline destroyed while in use");
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

unsafe fn destroy_shader_modules(device: &ash::Device, modules: &[vk::ShaderModule]) {
    for &module in modules {
        device.destroy_shader_module(module, None);
    }
}

fn check_features(capabilities: &GpuCapabilities, config: &GraphicsPipelineConfig) -> Result<()> {
    if config.geometry_shader.is_some() && !capabilities.geometry_shader {
        return Err(GpuError::FeatureUnavailable("geometry_shader"));
    }
    if (config.tessellation_control_shader.is_some()
        || config.tessellation_evaluation_shader.is_some())
        && !capabilities.tessellation_shaders
    {
        return Err(GpuError::FeatureUnavailable("tessellation_shaders"));
    }
    if config.polygon_mode != vk::PolygonMode::FILL && !capabilities.fill_mode_wireframe {
        return Err(GpuError::FeatureUnavailable("fill_mode_wireframe"));
    }
    if config.blend.len() > 1 && !capabilities.independent_blend {
        let first = config.blend[0];
        if config.blend.iter().any(|b| *b != first) {
            return Err(GpuError::FeatureUnavailable("independent_blend"));
        }
    }
    Ok(())
}

/// Build a throwaway render pass describing the pipeline's attachments.
unsafe fn compatibility_render_pass(
    device: &ash::Device,
    config: &GraphicsPipelineConfig,
) -> Result<vk::RenderPass> {
    let mut attachments = Vec::new();
    let mut color_refs = Vec::new();

    for (index, &format) in config.color_formats.iter().enumerate() {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(config.sample_count)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
        color_refs.push(
            vk::AttachmentReference::default()
                .attachment(index as u32)
                .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        );
    }

    let mut depth_ref = vk::AttachmentReference::default();
    if let Some(format) = config.depth_format {
        let stencil = has_stencil(format);
        let (stencil_load, stencil_store) = if stencil {
            (vk::AttachmentLoadOp::LOAD, vk::AttachmentStoreOp::STORE)
        } else {
            (vk::AttachmentLoadOp::DONT_CARE, vk::AttachmentStoreOp::DONT_CARE)
        };
        depth_ref = vk::AttachmentReference::default()
            .attachment(attachments.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(config.sample_count)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(stencil_load)
                .stencil_store_op(stencil_store)
                .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if config.depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    let subpasses = [subpass];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses);

    let pass = device
        .create_render_pass(&create_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))?;
    Ok(pass)
}
