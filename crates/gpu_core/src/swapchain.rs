//! Swapchain lifecycle: creation, resize-driven recreation, teardown
//!
//! Presentation always uses FIFO, which every conformant driver provides.
//! Recreation chains the retired swapchain through `old_swapchain` so the
//! driver can recycle its images.

use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device};

use crate::device::DeviceContext;
use crate::error::{VulkanError, VulkanResult};
use crate::memory::MemoryAllocator;

/// Depth attachment format used alongside the swapchain images.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Swapchain plus the per-image views and shared depth buffer.
///
/// Recreation reuses this struct in place; teardown is idempotent so an
/// explicit `destroy` and the eventual `Drop` can coexist.
pub struct Swapchain {
    device: Device,
    swapchain_loader: SwapchainLoader,
    surface: vk::SurfaceKHR,
    surface_loader: Surface,
    physical_device: vk::PhysicalDevice,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth_image: vk::Image,
    depth_memory: vk::DeviceMemory,
    depth_view: vk::ImageView,
    destroyed: bool,
}

impl Swapchain {
    /// Create the initial swapchain for a surface.
    ///
    /// The surface format is chosen once here and kept for the lifetime of
    /// the context; recreation re-reads capabilities but not formats.
    pub fn new(
        context: &DeviceContext,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
        physical_device: vk::PhysicalDevice,
        width: u32,
        height: u32,
    ) -> VulkanResult<Self> {
        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(physical_device, surface)
                .map_err(VulkanError::Api)?
        };
        let format = choose_surface_format(&formats)?;

        let mut swapchain = Self {
            device: context.device.clone(),
            swapchain_loader: context.swapchain_loader.clone(),
            surface,
            surface_loader: surface_loader.clone(),
            physical_device,
            swapchain: vk::SwapchainKHR::null(),
            format,
            extent: vk::Extent2D { width: 0, height: 0 },
            images: Vec::new(),
            image_views: Vec::new(),
            depth_image: vk::Image::null(),
            depth_memory: vk::DeviceMemory::null(),
            depth_view: vk::ImageView::null(),
            destroyed: false,
        };

        swapchain.build(context, &context.allocator, width, height, vk::SwapchainKHR::null())?;
        Ok(swapchain)
    }

    /// Recreate the swapchain after a window resize.
    ///
    /// Waits for the device to go idle, re-reads surface capabilities (they
    /// change on every resize), tears down the old views and depth buffer,
    /// and builds the replacement with the retired handle chained through
    /// `old_swapchain`.
    pub fn recreate(
        &mut self,
        context: &DeviceContext,
        allocator: &MemoryAllocator,
        width: u32,
        height: u32,
    ) -> VulkanResult<()> {
        unsafe {
            self.device.device_wait_idle().map_err(VulkanError::Api)?;
        }

        let old_swapchain = self.swapchain;
        self.destroy_dependents();
        self.swapchain = vk::SwapchainKHR::null();

        let result = self.build(context, allocator, width, height, old_swapchain);

        // The retired handle is invalid either way once create returns.
        if old_swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader.destroy_swapchain(old_swapchain, None);
            }
        }

        if result.is_ok() {
            log::debug!(
                "Recreated swapchain at {}x{}",
                self.extent.width,
                self.extent.height
            );
        }
        result
    }

    fn build(
        &mut self,
        context: &DeviceContext,
        allocator: &MemoryAllocator,
        width: u32,
        height: u32,
        old_swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<()> {
        let capabilities = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(VulkanError::Api)?
        };

        let extent = clamped_extent(&capabilities, width, height);
        let image_count = select_image_count(&capabilities);

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let family_indices = [context.graphics_family, context.present_family];
        if context.graphics_family != context.present_family {
            create_info = create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices);
        } else {
            create_info = create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE);
        }

        let swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = match unsafe { self.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(VulkanError::Api(e));
            }
        };

        let image_views = match create_image_views(&self.device, &images, self.format.format) {
            Ok(views) => views,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        let (depth_image, depth_memory, depth_view) =
            match create_depth_resources(&self.device, allocator, extent) {
                Ok(depth) => depth,
                Err(e) => {
                    unsafe {
                        for view in &image_views {
                            self.device.destroy_image_view(*view, None);
                        }
                        self.swapchain_loader.destroy_swapchain(swapchain, None);
                    }
                    return Err(e);
                }
            };

        self.swapchain = swapchain;
        self.extent = extent;
        self.images = images;
        self.image_views = image_views;
        self.depth_image = depth_image;
        self.depth_memory = depth_memory;
        self.depth_view = depth_view;
        self.destroyed = false;
        Ok(())
    }

    /// Destroy everything this swapchain owns. Safe to call more than once;
    /// later calls are no-ops.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroy_dependents();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.swapchain = vk::SwapchainKHR::null();
        }
        self.destroyed = true;
    }

    /// Tear down views and the depth buffer, leaving the swapchain handle
    /// alone so recreation can chain it.
    fn destroy_dependents(&mut self) {
        unsafe {
            if self.depth_view != vk::ImageView::null() {
                self.device.destroy_image_view(self.depth_view, None);
                self.depth_view = vk::ImageView::null();
            }
            if self.depth_image != vk::Image::null() {
                self.device.destroy_image(self.depth_image, None);
                self.depth_image = vk::Image::null();
            }
            if self.depth_memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.depth_memory, None);
                self.depth_memory = vk::DeviceMemory::null();
            }
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
        }
        self.images.clear();
    }

    /// Swapchain handle for acquire/present calls
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Surface format chosen at creation
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Current image extent
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Swapchain images, in acquire-index order
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    /// One view per swapchain image
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    /// Shared depth attachment view
    pub fn depth_view(&self) -> vk::ImageView {
        self.depth_view
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Prefer `B8G8R8A8_SRGB` with the sRGB-nonlinear color space; otherwise
/// take whatever the driver lists first.
pub(crate) fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> VulkanResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| VulkanError::InitializationFailed("surface reports no formats".to_string()))
}

/// Resolve the swapchain extent from surface capabilities.
///
/// When the driver fixes `current_extent` that value is authoritative; the
/// sentinel width `u32::MAX` means the window size decides, clamped into the
/// driver's min/max bounds.
pub(crate) fn clamped_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One image above the driver minimum, capped by the maximum unless the
/// maximum is zero (unlimited).
pub(crate) fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        count = capabilities.max_image_count;
    }
    count
}

fn create_image_views(
    device: &Device,
    images: &[vk::Image],
    format: vk::Format,
) -> VulkanResult<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for &image in images {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { device.create_image_view(&create_info, None) } {
            Ok(view) => views.push(view),
            Err(e) => {
                // Release the views created so far before propagating.
                unsafe {
                    for view in views {
                        device.destroy_image_view(view, None);
                    }
                }
                return Err(VulkanError::Api(e));
            }
        }
    }
    Ok(views)
}

fn create_depth_resources(
    device: &Device,
    allocator: &MemoryAllocator,
    extent: vk::Extent2D,
) -> VulkanResult<(vk::Image, vk::DeviceMemory, vk::ImageView)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(DEPTH_FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .samples(vk::SampleCountFlags::TYPE_1);

    let image = unsafe {
        device
            .create_image(&image_info, None)
            .map_err(VulkanError::Api)?
    };

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let memory = match allocator.allocate(device, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(e);
        }
    };

    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.destroy_image(image, None);
            device.free_memory(memory, None);
        }
        return Err(VulkanError::Api(e));
    }

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = match unsafe { device.create_image_view(&view_info, None) } {
        Ok(view) => view,
        Err(e) => {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }
    };

    Ok((image, memory, view))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(
        min_extent: (u32, u32),
        max_extent: (u32, u32),
        current: (u32, u32),
        min_images: u32,
        max_images: u32,
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min_extent.0,
                height: min_extent.1,
            },
            max_image_extent: vk::Extent2D {
                width: max_extent.0,
                height: max_extent.1,
            },
            ..Default::default()
        }
    }

    fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn fixed_current_extent_is_authoritative() {
        let caps = capabilities((1, 1), (4096, 4096), (1280, 720), 2, 8);
        let extent = clamped_extent(&caps, 1920, 1080);
        assert_eq!(extent.width, 1280);
        assert_eq!(extent.height, 720);
    }

    #[test]
    fn window_extent_clamps_down_to_driver_max() {
        let caps = capabilities((1, 1), (2048, 2048), (u32::MAX, u32::MAX), 2, 8);
        let extent = clamped_extent(&caps, 4096, 1024);
        assert_eq!(extent.width, 2048);
        assert_eq!(extent.height, 1024);
    }

    #[test]
    fn window_extent_clamps_up_to_driver_min() {
        let caps = capabilities((64, 64), (4096, 4096), (u32::MAX, u32::MAX), 2, 8);
        let extent = clamped_extent(&caps, 16, 16);
        assert_eq!(extent.width, 64);
        assert_eq!(extent.height, 64);
    }

    #[test]
    fn image_count_is_min_plus_one() {
        let caps = capabilities((1, 1), (4096, 4096), (800, 600), 2, 8);
        assert_eq!(select_image_count(&caps), 3);
    }

    #[test]
    fn image_count_capped_by_maximum() {
        let caps = capabilities((1, 1), (4096, 4096), (800, 600), 3, 3);
        assert_eq!(select_image_count(&caps), 3);
    }

    #[test]
    fn zero_maximum_means_unlimited() {
        let caps = capabilities((1, 1), (4096, 4096), (800, 600), 4, 0);
        assert_eq!(select_image_count(&caps), 5);
    }

    #[test]
    fn prefers_bgra_srgb() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_listed_format() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            surface_format(vk::Format::R8G8B8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn empty_format_list_is_an_error() {
        assert!(choose_surface_format(&[]).is_err());
    }

    #[test]
    fn recreation_recomputes_from_fresh_capabilities() {
        crate::test_support::init_logging();
        // Two capability snapshots, as a resize would produce.
        let before = capabilities((1, 1), (4096, 4096), (u32::MAX, u32::MAX), 2, 8);
        let after = capabilities((1, 1), (1920, 1080), (u32::MAX, u32::MAX), 2, 8);

        assert_eq!(clamped_extent(&before, 2560, 1440).width, 2560);
        assert_eq!(clamped_extent(&after, 2560, 1440).width, 1920);
    }
}
