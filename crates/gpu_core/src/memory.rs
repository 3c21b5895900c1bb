//! Device memory selection and allocation
//!
//! First-match scan over the physical device's memory-type table; no
//! best-fit scoring and no fallback to a looser property set.

use ash::{vk, Device, Instance};

use crate::error::{VulkanError, VulkanResult};

/// Selects memory types and allocates backing memory for buffers and images.
///
/// Holds the memory-type table cached once at device creation; the table is
/// immutable for the lifetime of the physical device.
pub struct MemoryAllocator {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl MemoryAllocator {
    /// Cache the memory-type table for a physical device.
    pub fn new(instance: &Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        Self { memory_properties }
    }

    /// First memory type index allowed by `type_bits` whose flags contain
    /// every bit in `properties`.
    pub fn find(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> VulkanResult<u32> {
        find_memory_type(&self.memory_properties, type_bits, properties)
    }

    /// Allocate device memory satisfying `requirements` and `properties`.
    ///
    /// Fatal for this allocation when no type matches; the caller must
    /// release the buffer or image it was allocating for before propagating.
    pub fn allocate(
        &self,
        device: &Device,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<vk::DeviceMemory> {
        let memory_type_index = self.find(requirements.memory_type_bits, properties)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        unsafe {
            device
                .allocate_memory(&alloc_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

/// Find a memory type index satisfying the requested property mask.
///
/// Unset bits in `properties` are don't-care; a type only needs to carry
/// the bits the caller actually asked for.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_bits & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
        {
            return Ok(i);
        }
    }

    Err(VulkanError::NoSuitableMemoryType {
        type_bits,
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = flags.len() as u32;
        for (i, &f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = f;
        }
        props
    }

    #[test]
    fn picks_first_index_with_all_requested_bits() {
        crate::test_support::init_logging();
        let props = table(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        // Requirements allow indices 1 and 3; only index 3 is also coherent.
        let type_bits = (1 << 1) | (1 << 3);
        let index = find_memory_type(
            &props,
            type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(index, 3);
    }

    #[test]
    fn first_match_wins_without_scoring() {
        let props = table(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        let index =
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn fails_when_no_type_matches() {
        let props = table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let err =
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, VulkanError::NoSuitableMemoryType { .. }));
    }

    #[test]
    fn type_bits_exclude_unlisted_indices() {
        let props = table(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        // Index 0 matches the properties but is not allowed by the mask.
        let index =
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn unset_property_bits_are_dont_care() {
        let props = table(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let index = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::empty()).unwrap();
        assert_eq!(index, 0);
    }
}
