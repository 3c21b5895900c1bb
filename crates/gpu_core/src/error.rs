//! Error types for the GPU lifecycle layer
//!
//! Failures are distinct, inspectable variants so callers can log exactly
//! which stage failed. Nothing in this layer is recovered silently.

use ash::vk;
use thiserror::Error;

/// GPU lifecycle error
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Raw Vulkan API error from an object-creation or query call
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// No physical device passed the extension, surface, and queue checks
    #[error("no suitable GPU: {reason}")]
    NoSuitableDevice {
        /// Summary of what the enumerated devices were missing
        reason: String,
    },

    /// No memory type satisfies the requested property mask
    #[error("no suitable memory type (type bits {type_bits:#b}, requested {properties:?})")]
    NoSuitableMemoryType {
        /// Allowed type indices from the resource's memory requirements
        type_bits: u32,
        /// Property bits the allocation asked for
        properties: vk::MemoryPropertyFlags,
    },

    /// Loader or bootstrap failure outside a concrete Vulkan call
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Texture payload does not match its declared dimensions and format
    #[error("invalid texture data: {reason}")]
    InvalidTextureData {
        /// What about the payload was rejected
        reason: String,
    },
}

/// Result type for GPU lifecycle operations
pub type VulkanResult<T> = Result<T, VulkanError>;
