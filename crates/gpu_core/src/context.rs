//! Top-level GPU context tying instance, device, and swapchain together
//!
//! Field order matters: the swapchain and upload pool are torn down
//! explicitly in `Drop`, then `DeviceContext` drops before
//! `VulkanInstance`, so nothing ever outlives the handle it was created
//! from.

use ash::extensions::khr::Surface;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::device::{DeviceCandidate, DeviceContext};
use crate::error::{VulkanError, VulkanResult};
use crate::instance::{InstanceConfig, VulkanInstance};
use crate::swapchain::Swapchain;
use crate::texture::{AddressMode, ImageFormat, Texture};

/// Everything the renderer needs from the GPU lifecycle layer.
///
/// Created once per window; the application calls [`GpuContext::resize`] on
/// window size changes and [`GpuContext::create_texture`] for asset uploads.
pub struct GpuContext {
    swapchain: Swapchain,
    upload_pool: vk::CommandPool,
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical_device: vk::PhysicalDevice,
    device: DeviceContext,
    instance: VulkanInstance,
}

impl GpuContext {
    /// Bring up the full stack: instance, surface, device, swapchain, and
    /// the transient command pool used for uploads.
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
        config: &InstanceConfig,
    ) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(display_handle, config)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                display_handle,
                window_handle,
                None,
            )
            .map_err(VulkanError::Api)?
        };

        // From here on the surface must be released by hand on failure;
        // the instance cleans itself up through its own Drop.
        match Self::init_device_and_swapchain(
            &instance,
            surface,
            &surface_loader,
            width,
            height,
        ) {
            Ok((device, swapchain, upload_pool, physical_device)) => Ok(Self {
                swapchain,
                upload_pool,
                surface,
                surface_loader,
                physical_device,
                device,
                instance,
            }),
            Err(e) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    fn init_device_and_swapchain(
        instance: &VulkanInstance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        width: u32,
        height: u32,
    ) -> VulkanResult<(DeviceContext, Swapchain, vk::CommandPool, vk::PhysicalDevice)> {
        let candidate = DeviceCandidate::select(&instance.instance, surface, surface_loader)?;
        let device = DeviceContext::new(&instance.instance, &candidate)?;

        let swapchain = Swapchain::new(
            &device,
            surface,
            surface_loader,
            candidate.physical_device,
            width,
            height,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.graphics_family);
        let upload_pool = unsafe {
            device
                .device
                .create_command_pool(&pool_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok((device, swapchain, upload_pool, candidate.physical_device))
    }

    /// React to a window resize by recreating the swapchain.
    pub fn resize(&mut self, width: u32, height: u32) -> VulkanResult<()> {
        self.swapchain
            .recreate(&self.device, &self.device.allocator, width, height)
    }

    /// Upload pixel data into a new sampled texture.
    ///
    /// Synchronous: the texture is fully transitioned and sampleable when
    /// this returns.
    pub fn create_texture(
        &self,
        bytes: &[u8],
        width: u32,
        height: u32,
        format: ImageFormat,
        address_mode: AddressMode,
    ) -> VulkanResult<Texture> {
        Texture::from_bytes(
            &self.device,
            self.upload_pool,
            self.device.graphics_queue,
            bytes,
            width,
            height,
            format,
            address_mode,
        )
    }

    /// Logical device context
    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    /// Current swapchain
    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Selected physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Window surface handle
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            // Quiesce the device before tearing anything down.
            let _ = self.device.device.device_wait_idle();
            self.swapchain.destroy();
            self.device.device.destroy_command_pool(self.upload_pool, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // DeviceContext and VulkanInstance drop in field order after this.
    }
}
