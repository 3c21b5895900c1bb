//! Texture resources and the staging upload pipeline
//!
//! Creation runs in three ordered phases: staging copy, layout
//! transition/upload, sampler creation. Teardown mirrors creation in
//! reverse: sampler, view, image, memory.

use ash::{vk, Device};

use crate::device::DeviceContext;
use crate::error::{VulkanError, VulkanResult};
use crate::staging::StagingBuffer;

/// Pixel formats accepted by the upload path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// 8-bit RGBA, sRGB-encoded; sampled with an identity swizzle
    Rgba8Srgb,
    /// Single 8-bit channel; sampled as `(1, 1, 1, R)` for mask/SDF textures
    R8Unorm,
}

impl ImageFormat {
    pub(crate) fn vk_format(self) -> vk::Format {
        match self {
            ImageFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
            ImageFormat::R8Unorm => vk::Format::R8_UNORM,
        }
    }

    pub(crate) fn bytes_per_pixel(self) -> usize {
        match self {
            ImageFormat::Rgba8Srgb => 4,
            ImageFormat::R8Unorm => 1,
        }
    }

    /// Component swizzle applied by the image view.
    pub(crate) fn component_mapping(self) -> vk::ComponentMapping {
        match self {
            ImageFormat::Rgba8Srgb => vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            },
            // RGB read back as one, alpha sources the red channel
            ImageFormat::R8Unorm => vk::ComponentMapping {
                r: vk::ComponentSwizzle::ONE,
                g: vk::ComponentSwizzle::ONE,
                b: vk::ComponentSwizzle::ONE,
                a: vk::ComponentSwizzle::R,
            },
        }
    }
}

/// Sampler wrap behaviour applied on both the U and V axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// Tile the texture
    Repeat,
    /// Stretch the border texel
    ClampToEdge,
}

impl AddressMode {
    fn vk_address_mode(self) -> vk::SamplerAddressMode {
        match self {
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }
}

/// Sampled 2D texture in device-local memory, with RAII cleanup.
pub struct Texture {
    device: Device,
    image: vk::Image,
    image_view: vk::ImageView,
    sampler: vk::Sampler,
    memory: vk::DeviceMemory,
    width: u32,
    height: u32,
}

impl Texture {
    /// Upload raw pixel bytes into a freshly created device-local texture.
    ///
    /// The payload must be exactly `width * height * bytes_per_pixel` long.
    /// The upload is synchronous: the image is in
    /// `SHADER_READ_ONLY_OPTIMAL` layout when this returns, so it is never
    /// observable in a sampleable-but-untransitioned state.
    pub fn from_bytes(
        context: &DeviceContext,
        command_pool: vk::CommandPool,
        queue: vk::Queue,
        bytes: &[u8],
        width: u32,
        height: u32,
        format: ImageFormat,
        address_mode: AddressMode,
    ) -> VulkanResult<Self> {
        let expected = expected_byte_len(width, height, format);
        if expected == 0 || bytes.len() != expected {
            return Err(VulkanError::InvalidTextureData {
                reason: format!(
                    "{}x{} {:?} requires {} bytes, got {}",
                    width,
                    height,
                    format,
                    expected,
                    bytes.len()
                ),
            });
        }

        let device = &context.device;

        // Phase 1: staging copy. The buffer is dropped on every exit path
        // below, including the error ones.
        let staging = StagingBuffer::new(device, &context.allocator, bytes)?;

        // Phase 2: device-local image, then the transfer protocol.
        let (image, memory) = create_image(context, width, height, format.vk_format())?;

        if let Err(e) =
            upload_from_staging(device, command_pool, queue, &staging, image, width, height)
        {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(e);
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format.vk_format())
            .components(format.component_mapping())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let image_view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(VulkanError::Api(e));
            }
        };

        // Phase 3: sampler.
        let sampler = match create_sampler(device, address_mode) {
            Ok(sampler) => sampler,
            Err(e) => {
                unsafe {
                    device.destroy_image_view(image_view, None);
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            device: device.clone(),
            image,
            image_view,
            sampler,
            memory,
            width,
            height,
        })
    }

    /// Get the image view for descriptor set binding
    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    /// Get the sampler for descriptor set binding
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Texture width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Texture height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_image_view(self.image_view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn expected_byte_len(width: u32, height: u32, format: ImageFormat) -> usize {
    width as usize * height as usize * format.bytes_per_pixel()
}

/// Create a transfer-destination, sampleable 2D image backed by
/// device-local memory.
fn create_image(
    context: &DeviceContext,
    width: u32,
    height: u32,
    format: vk::Format,
) -> VulkanResult<(vk::Image, vk::DeviceMemory)> {
    let device = &context.device;

    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .samples(vk::SampleCountFlags::TYPE_1);

    let image = unsafe {
        device
            .create_image(&image_info, None)
            .map_err(VulkanError::Api)?
    };

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let memory = match context
        .allocator
        .allocate(device, requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL)
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

    Ok((image, memory))
}

/// Run the canonical transfer protocol on a one-shot command buffer:
/// `UNDEFINED -> TRANSFER_DST_OPTIMAL`, buffer-to-image copy,
/// `TRANSFER_DST_OPTIMAL -> SHADER_READ_ONLY_OPTIMAL`. The ordering is
/// mandatory; sampling before the final transition must never be reachable.
fn upload_from_staging(
    device: &Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    staging: &StagingBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
) -> VulkanResult<()> {
    let allocate_info = vk::CommandBufferAllocateInfo::builder()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(command_pool)
        .command_buffer_count(1);

    let command_buffer = unsafe {
        device
            .allocate_command_buffers(&allocate_info)
            .map_err(VulkanError::Api)?[0]
    };

    let result = record_and_submit(device, command_buffer, queue, staging, image, width, height);

    // Freed on success and failure alike.
    unsafe { device.free_command_buffers(command_pool, &[command_buffer]) };
    result
}

fn record_and_submit(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    queue: vk::Queue,
    staging: &StagingBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
) -> VulkanResult<()> {
    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    unsafe {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device
            .begin_command_buffer(command_buffer, &begin_info)
            .map_err(VulkanError::Api)?;

        let to_transfer = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);

        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer.build()],
        );

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });

        device.cmd_copy_buffer_to_image(
            command_buffer,
            staging.handle(),
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region.build()],
        );

        let to_shader = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ);

        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_shader.build()],
        );

        device
            .end_command_buffer(command_buffer)
            .map_err(VulkanError::Api)?;

        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
        device
            .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
            .map_err(VulkanError::Api)?;
        device.queue_wait_idle(queue).map_err(VulkanError::Api)?;
    }

    Ok(())
}

/// Linear-filtered sampler with no anisotropy; wrap mode from the semantic
/// address mode on both U and V.
fn create_sampler(device: &Device, address_mode: AddressMode) -> VulkanResult<vk::Sampler> {
    let wrap = address_mode.vk_address_mode();

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(wrap)
        .address_mode_v(wrap)
        .address_mode_w(wrap)
        .anisotropy_enable(false)
        .max_anisotropy(1.0)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

    unsafe {
        device
            .create_sampler(&sampler_info, None)
            .map_err(VulkanError::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mapping() {
        assert_eq!(ImageFormat::Rgba8Srgb.vk_format(), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(ImageFormat::R8Unorm.vk_format(), vk::Format::R8_UNORM);
    }

    #[test]
    fn rgba_uses_identity_swizzle() {
        let mapping = ImageFormat::Rgba8Srgb.component_mapping();
        assert_eq!(mapping.r, vk::ComponentSwizzle::IDENTITY);
        assert_eq!(mapping.g, vk::ComponentSwizzle::IDENTITY);
        assert_eq!(mapping.b, vk::ComponentSwizzle::IDENTITY);
        assert_eq!(mapping.a, vk::ComponentSwizzle::IDENTITY);
    }

    #[test]
    fn single_channel_swizzles_to_white_with_red_alpha() {
        // A 2x2 all-255 r8 payload must sample as (1, 1, 1, 1): RGB forced
        // to one, alpha sourced from the red channel.
        let mapping = ImageFormat::R8Unorm.component_mapping();
        assert_eq!(mapping.r, vk::ComponentSwizzle::ONE);
        assert_eq!(mapping.g, vk::ComponentSwizzle::ONE);
        assert_eq!(mapping.b, vk::ComponentSwizzle::ONE);
        assert_eq!(mapping.a, vk::ComponentSwizzle::R);
    }

    #[test]
    fn address_mode_mapping() {
        assert_eq!(
            AddressMode::Repeat.vk_address_mode(),
            vk::SamplerAddressMode::REPEAT
        );
        assert_eq!(
            AddressMode::ClampToEdge.vk_address_mode(),
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        );
    }

    #[test]
    fn payload_length_accounts_for_format() {
        assert_eq!(expected_byte_len(2, 2, ImageFormat::R8Unorm), 4);
        assert_eq!(expected_byte_len(2, 2, ImageFormat::Rgba8Srgb), 16);
        assert_eq!(expected_byte_len(0, 4, ImageFormat::Rgba8Srgb), 0);
    }
}
