//! Vulkan abstraction layer.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - GPU capability detection
//! - Suballocated device memory (two-level segregated fit over growing chunks)
//! - Stateful command recording with automatic image layout transitions
//! - Framebuffers with cached render-pass variants and deferred clears
//! - Staging upload/readback machinery and swapchain handling

pub mod buffer;
pub mod capabilities;
pub mod chunk;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod format;
pub mod instance;
pub mod layout;
pub mod memory;
pub mod pipeline;
pub mod recorder;
pub mod renderpass;
pub mod resource;
pub mod sampler;
pub mod staging;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod tlsf;

pub use buffer::{BufferDesc, BufferUsage, DeviceBuffer};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use chunk::MemoryChunk;
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    DescriptorPool, DescriptorSetLayoutBuilder, PipelineKind, ResourceBinding, ResourceSet,
};
pub use error::{GpuError, Result};
pub use memory::{
    AllocationIntent, DeviceMemoryManager, MemoryFlags, MemoryRange, MemoryUsage,
};
pub use pipeline::{BlendAttachment, ComputePipeline, GraphicsPipeline, GraphicsPipelineConfig};
pub use recorder::{
    CommandPool, CommandRecorder, RecorderState, RecordingFlags, TextureOrigin,
};
pub use renderpass::{Framebuffer, FramebufferAttachmentDesc, FramebufferDesc};
pub use resource::RefCount;
pub use sampler::{Sampler, SamplerDesc};
pub use staging::StagingPool;
pub use swapchain::Swapchain;
pub use sync::{create_fence, wait_for_fence};
pub use texture::{Texture, TextureDesc, TextureKind, TextureUsage};
