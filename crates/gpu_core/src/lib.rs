//! GPU resource lifecycle layer for a small real-time renderer
//!
//! Negotiates a physical/logical Vulkan device, owns the presentation
//! swapchain and depth buffer across window resizes, and uploads texture
//! data into device-local memory through staging buffers. Frame recording,
//! command submission, and everything above this layer (scene, input,
//! assets) live in the surrounding engine, which consumes the resources
//! this crate hands out.
//!
//! Resource ownership follows RAII: every wrapper destroys what it created,
//! in strict reverse-of-creation order, and dependents are always destroyed
//! before the logical device.

/// Top-level context wiring device, swapchain, and uploads together
pub mod context;
/// Physical device negotiation and logical device ownership
pub mod device;
/// Error taxonomy for the whole layer
pub mod error;
/// Vulkan instance bootstrap and validation plumbing
pub mod instance;
/// Memory-type selection and allocation
pub mod memory;
/// Host-visible staging buffers for one-shot transfers
pub mod staging;
/// Swapchain creation, resize recreation, and teardown
pub mod swapchain;
/// Texture resources and the staging upload pipeline
pub mod texture;

pub use context::GpuContext;
pub use device::{DeviceCandidate, DeviceContext};
pub use error::{VulkanError, VulkanResult};
pub use instance::{InstanceConfig, VulkanInstance};
pub use memory::MemoryAllocator;
pub use staging::StagingBuffer;
pub use swapchain::Swapchain;
pub use texture::{AddressMode, ImageFormat, Texture};

#[cfg(test)]
pub(crate) mod test_support {
    /// Route `log` output from code under test through env_logger.
    ///
    /// Safe to call from every test; only the first call in the binary
    /// installs the logger.
    pub fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
