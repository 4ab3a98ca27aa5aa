//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// No memory type could satisfy the allocation.
    #[error("Out of device memory (requested {size} bytes)")]
    OutOfMemory {
        /// Requested allocation size in bytes.
        size: u64,
    },

    /// Allocation exceeds the per-allocation limit.
    #[error("Allocation of {size} bytes exceeds the device limit of {limit} bytes")]
    OversizedAllocation {
        /// Requested allocation size in bytes.
        size: u64,
        /// Device per-allocation limit in bytes.
        limit: u64,
    },

    /// Operation not permitted in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation requires a device feature that is not available.
    #[error("Feature unavailable: {0}")]
    FeatureUnavailable(&'static str),

    /// Image copy between mismatched aspects.
    #[error("Source and destination image aspects do not match")]
    AspectMismatch,

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader compilation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
