//! Host-visible staging buffers for one-shot transfers

use ash::{vk, Device};

use crate::error::{VulkanError, VulkanResult};
use crate::memory::MemoryAllocator;

/// Host-visible scratch buffer that shuttles client bytes toward
/// device-local memory.
///
/// Scoped to a single upload: created, filled, consumed by one
/// buffer-to-image copy, then dropped. Never reused across uploads, so a
/// failed upload step can simply let it fall out of scope.
pub struct StagingBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl StagingBuffer {
    /// Create a transfer-source buffer sized exactly to `bytes` and copy
    /// them in through a map/copy/unmap cycle.
    ///
    /// Memory is host-visible + host-coherent, so no explicit flush is
    /// needed. Partially created handles are released before any error
    /// surfaces.
    pub fn new(device: &Device, allocator: &MemoryAllocator, bytes: &[u8]) -> VulkanResult<Self> {
        let size = bytes.len() as vk::DeviceSize;

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(VulkanError::Api)?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = match allocator.allocate(
            device,
            requirements,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }

        unsafe {
            let mapped = match device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty()) {
                Ok(ptr) => ptr,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                    return Err(VulkanError::Api(e));
                }
            };
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped as *mut u8, bytes.len());
            device.unmap_memory(memory);
        }

        Ok(Self {
            device: device.clone(),
            buffer,
            memory,
            size,
        })
    }

    /// Get the buffer handle for the transfer command
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the staged byte count
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        // Buffer first, then its backing memory.
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}
