//! Physical device negotiation and logical device ownership
//!
//! Device selection is first-match in driver enumeration order: no scoring,
//! no ranking. The logical device context owns the device handle, its
//! queues, and the cached memory-type table used by the allocator.

use ash::extensions::khr::{DynamicRendering, Surface, Swapchain as SwapchainLoader, Synchronization2};
use ash::{vk, Device, Instance};
use std::ffi::CStr;

use crate::error::{VulkanError, VulkanResult};
use crate::memory::MemoryAllocator;

/// Selected physical device plus its queue family indices.
///
/// Produced once during startup and consumed immediately by
/// [`DeviceContext::new`]; not retained afterwards.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCandidate {
    /// Physical device handle
    pub physical_device: vk::PhysicalDevice,
    /// First queue family supporting graphics
    pub graphics_family: u32,
    /// First queue family supporting presentation to the surface
    pub present_family: u32,
}

impl DeviceCandidate {
    /// Select the first physical device that can drive the surface.
    ///
    /// Per device, in order: the swapchain extension must be present, the
    /// surface must report at least one format and one present mode, and a
    /// graphics family and a present family must exist (independently; they
    /// may coincide). Driver enumeration order is authoritative.
    pub fn select(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::Api)?
        };

        for device in devices {
            if let Some(candidate) = Self::evaluate(instance, device, surface, surface_loader)? {
                let properties = unsafe { instance.get_physical_device_properties(device) };
                log::info!("Selected GPU: {}", unsafe {
                    CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy()
                });
                return Ok(candidate);
            }
        }

        Err(VulkanError::NoSuitableDevice {
            reason: "no enumerated device passed the extension, surface, and queue checks"
                .to_string(),
        })
    }

    /// Evaluate one device; `Ok(None)` means rejected, errors are API failures.
    fn evaluate(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Option<Self>> {
        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        if !has_extension(&extensions, SwapchainLoader::name()) {
            return Ok(None);
        }

        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(device, surface)
                .map_err(VulkanError::Api)?
        };
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(device, surface)
                .map_err(VulkanError::Api)?
        };
        if formats.is_empty() || present_modes.is_empty() {
            return Ok(None);
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let mut present_support = Vec::with_capacity(families.len());
        for index in 0..families.len() as u32 {
            let supported = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index, surface)
                    .map_err(VulkanError::Api)?
            };
            present_support.push(supported);
        }

        Ok(
            pick_queue_families(&families, |index| present_support[index as usize]).map(
                |(graphics_family, present_family)| Self {
                    physical_device: device,
                    graphics_family,
                    present_family,
                },
            ),
        )
    }
}

/// Whether `name` appears in a device's extension list.
pub(crate) fn has_extension(extensions: &[vk::ExtensionProperties], name: &CStr) -> bool {
    extensions.iter().any(|available| {
        let available = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
        available == name
    })
}

/// Decide how to request a feature that Vulkan 1.3 promoted to core.
///
/// Returns `(enable_feature, enable_extension)`. On a 1.3 device the
/// feature rides on core and no extension is requested; below 1.3 the
/// feature may only be enabled together with its extension, and is skipped
/// entirely when the device does not expose that extension.
pub(crate) fn promoted_feature_request(
    api_version: u32,
    feature_supported: bool,
    extension_available: bool,
) -> (bool, bool) {
    if !feature_supported {
        return (false, false);
    }
    if api_version >= vk::API_VERSION_1_3 {
        (true, false)
    } else if extension_available {
        (true, true)
    } else {
        (false, false)
    }
}

/// First graphics-capable family and first present-capable family, chosen
/// independently; they may be the same family or different ones.
pub(crate) fn pick_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: impl Fn(u32) -> bool,
) -> Option<(u32, u32)> {
    let graphics = families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)?;
    let present = (0..families.len() as u32).find(|&index| present_support(index))?;
    Some((graphics, present))
}

/// Logical device context with RAII cleanup.
///
/// Owns the device handle (ash's device dispatch table), both queues, and
/// the memory allocator built from the physical device's memory-type table.
/// Must outlive every resource created from it; [`crate::GpuContext`]
/// enforces the teardown order.
pub struct DeviceContext {
    /// Vulkan logical device handle
    pub device: Device,
    /// Graphics operations queue
    pub graphics_queue: vk::Queue,
    /// Surface presentation queue (may alias the graphics queue)
    pub present_queue: vk::Queue,
    /// Index of the graphics queue family
    pub graphics_family: u32,
    /// Index of the presentation queue family
    pub present_family: u32,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Memory-type table cached for allocations
    pub allocator: MemoryAllocator,
}

impl DeviceContext {
    /// Create the logical device for a selected candidate.
    ///
    /// One queue per distinct family, each at priority 1.0. Dynamic
    /// rendering and synchronization2 are requested only when the physical
    /// device reports them as supported; unsupported features are never
    /// part of the request.
    pub fn new(instance: &Instance, candidate: &DeviceCandidate) -> VulkanResult<Self> {
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> =
            if candidate.graphics_family == candidate.present_family {
                vec![vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(candidate.graphics_family)
                    .queue_priorities(&priorities)
                    .build()]
            } else {
                vec![
                    vk::DeviceQueueCreateInfo::builder()
                        .queue_family_index(candidate.graphics_family)
                        .queue_priorities(&priorities)
                        .build(),
                    vk::DeviceQueueCreateInfo::builder()
                        .queue_family_index(candidate.present_family)
                        .queue_priorities(&priorities)
                        .build(),
                ]
            };

        // Probe optional features first; only the supported booleans are
        // mirrored into the creation request.
        let mut dynamic_rendering_query = vk::PhysicalDeviceDynamicRenderingFeatures::builder();
        let mut sync2_query = vk::PhysicalDeviceSynchronization2Features::builder();
        let mut features_query = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut dynamic_rendering_query)
            .push_next(&mut sync2_query);
        unsafe {
            instance.get_physical_device_features2(candidate.physical_device, &mut features_query);
        }

        // Below 1.3 these features are only legal alongside their extensions.
        let properties =
            unsafe { instance.get_physical_device_properties(candidate.physical_device) };
        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(candidate.physical_device)
                .map_err(VulkanError::Api)?
        };

        let (dynamic_rendering_supported, dynamic_rendering_ext) = promoted_feature_request(
            properties.api_version,
            dynamic_rendering_query.dynamic_rendering == vk::TRUE,
            has_extension(&extensions, DynamicRendering::name()),
        );
        let (sync2_supported, sync2_ext) = promoted_feature_request(
            properties.api_version,
            sync2_query.synchronization2 == vk::TRUE,
            has_extension(&extensions, Synchronization2::name()),
        );

        let mut required_extensions = vec![SwapchainLoader::name().as_ptr()];
        if dynamic_rendering_ext {
            required_extensions.push(DynamicRendering::name().as_ptr());
        }
        if sync2_ext {
            required_extensions.push(Synchronization2::name().as_ptr());
        }

        let mut dynamic_rendering = vk::PhysicalDeviceDynamicRenderingFeatures::builder()
            .dynamic_rendering(dynamic_rendering_supported);
        let mut sync2 = vk::PhysicalDeviceSynchronization2Features::builder()
            .synchronization2(sync2_supported);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .push_next(&mut dynamic_rendering)
            .push_next(&mut sync2);

        let device = unsafe {
            instance
                .create_device(candidate.physical_device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let graphics_queue = unsafe { device.get_device_queue(candidate.graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(candidate.present_family, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);
        let allocator = MemoryAllocator::new(instance, candidate.physical_device);

        log::debug!(
            "Created logical device (graphics family {}, present family {}, dynamic rendering: {}, sync2: {})",
            candidate.graphics_family,
            candidate.present_family,
            dynamic_rendering_supported,
            sync2_supported,
        );

        Ok(Self {
            device,
            graphics_queue,
            present_queue,
            graphics_family: candidate.graphics_family,
            present_family: candidate.present_family,
            swapchain_loader,
            allocator,
        })
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            // Ensure no work is in flight before destruction
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::init_logging;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn combined_graphics_and_present_family() {
        init_logging();
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let picked = pick_queue_families(&families, |_| true);
        assert_eq!(picked, Some((0, 0)));
    }

    #[test]
    fn split_families_chosen_independently() {
        // Graphics lives on family 1, presentation only on family 0.
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let picked = pick_queue_families(&families, |index| index == 0);
        assert_eq!(picked, Some((1, 0)));
    }

    #[test]
    fn first_match_wins_for_each_capability() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let picked = pick_queue_families(&families, |_| true);
        assert_eq!(picked, Some((0, 0)));
    }

    #[test]
    fn rejects_device_without_graphics_family() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert_eq!(pick_queue_families(&families, |_| true), None);
    }

    #[test]
    fn rejects_device_without_present_family() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert_eq!(pick_queue_families(&families, |_| false), None);
    }

    #[test]
    fn core_1_3_feature_needs_no_extension() {
        let (enable, ext) = promoted_feature_request(vk::API_VERSION_1_3, true, false);
        assert!(enable);
        assert!(!ext);
    }

    #[test]
    fn pre_1_3_feature_rides_on_its_extension() {
        let (enable, ext) = promoted_feature_request(vk::API_VERSION_1_2, true, true);
        assert!(enable);
        assert!(ext);
    }

    #[test]
    fn pre_1_3_feature_without_extension_is_skipped() {
        // Enabling the feature here would be invalid API usage, so the
        // request must drop it entirely.
        let (enable, ext) = promoted_feature_request(vk::API_VERSION_1_2, true, false);
        assert!(!enable);
        assert!(!ext);
    }

    #[test]
    fn unsupported_feature_is_never_requested() {
        let (enable, ext) = promoted_feature_request(vk::API_VERSION_1_3, false, true);
        assert!(!enable);
        assert!(!ext);
    }

    #[test]
    fn extension_lookup_matches_by_name() {
        let mut listed = vk::ExtensionProperties::default();
        let name = SwapchainLoader::name().to_bytes_with_nul();
        for (i, &byte) in name.iter().enumerate() {
            listed.extension_name[i] = byte as std::ffi::c_char;
        }

        assert!(has_extension(&[listed], SwapchainLoader::name()));
        assert!(!has_extension(&[listed], DynamicRendering::name()));
        assert!(!has_extension(&[], SwapchainLoader::name()));
    }
}
