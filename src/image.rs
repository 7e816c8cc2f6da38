// GPU images
//
// Images track their current layout so barriers can be derived from the
// recorded state instead of caller bookkeeping. Samplers are owned by the
// image and survive resizes.

use anyhow::{Context, Result};
use ash::vk;
use glam::UVec2;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::device::RenderDevice;

/// Full mip chain length for a base extent
pub fn mip_level_count(size: UVec2) -> u32 {
    (size.x.max(size.y).max(1) as f32).log2().floor() as u32 + 1
}

pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub size: UVec2,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

pub struct Image {
    pub image: vk::Image,
    allocation: Option<Allocation>,
    pub view: vk::ImageView,
    pub sampler: Option<vk::Sampler>,
    pub format: vk::Format,
    pub size: UVec2,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub current_layout: vk::ImageLayout,
}

impl Image {
    pub fn new(device: &RenderDevice, desc: &ImageDesc) -> Result<Self> {
        // Mip chains are produced by linear blits; fall back to a single
        // level when the format cannot be blitted that way.
        let mip_levels = if desc.mip_levels > 1
            && !device
                .format_properties(desc.format)
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            log::error!(
                "Format {:?} does not support linear blitting, mip levels set to 1",
                desc.format
            );
            1
        } else {
            desc.mip_levels
        };

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.size.x,
                height: desc.size.y,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(desc.tiling)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(desc.samples);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: desc.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .context("Failed to bind image memory")?;
        }

        let view = create_view(device, image, desc.format, desc.aspect, mip_levels)?;

        Ok(Self {
            image,
            allocation: Some(allocation),
            view,
            sampler: None,
            format: desc.format,
            size: desc.size,
            mip_levels,
            samples: desc.samples,
            tiling: desc.tiling,
            usage: desc.usage,
            aspect: desc.aspect,
            current_layout: vk::ImageLayout::UNDEFINED,
        })
    }

    /// Linear sampler matched to the image: repeat addressing for the RGBA8
    /// texture formats, clamp-to-edge otherwise, anisotropy from the device
    /// limits, lod range covering the whole mip chain.
    pub fn create_sampler(&mut self, device: &RenderDevice) -> Result<()> {
        let address_mode = if self.format == vk::Format::R8G8B8A8_UNORM
            || self.format == vk::Format::R8G8B8A8_SRGB
        {
            vk::SamplerAddressMode::REPEAT
        } else {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        };

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(true)
            .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(self.mip_levels as f32);

        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;
        self.sampler = Some(sampler);
        Ok(())
    }

    /// Recreate the image at a new extent. The sampler is detached for the
    /// duration so it survives; layout restarts at UNDEFINED.
    pub fn resize(&mut self, device: &RenderDevice, size: UVec2) -> Result<()> {
        let sampler = self.sampler.take();
        let desc = ImageDesc {
            name: "resized image",
            size,
            mip_levels: self.mip_levels,
            samples: self.samples,
            format: self.format,
            tiling: self.tiling,
            usage: self.usage,
            aspect: self.aspect,
        };
        self.destroy(device);
        match Image::new(device, &desc) {
            Ok(image) => {
                *self = image;
                self.sampler = sampler;
                Ok(())
            }
            Err(e) => {
                if let Some(sampler) = sampler {
                    unsafe { device.device.destroy_sampler(sampler, None) };
                }
                Err(e)
            }
        }
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        unsafe {
            if let Some(sampler) = self.sampler.take() {
                device.device.destroy_sampler(sampler, None);
            }
            if self.view != vk::ImageView::null() {
                device.device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.image != vk::Image::null() {
                device.device.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
        }
        if let Some(allocation) = self.allocation.take() {
            device.free(allocation);
        }
    }
}

pub fn create_view(
    device: &RenderDevice,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe {
        device
            .device
            .create_image_view(&view_info, None)
            .context("Failed to create image view")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_level_count(UVec2::new(1, 1)), 1);
        assert_eq!(mip_level_count(UVec2::new(2, 2)), 2);
        assert_eq!(mip_level_count(UVec2::new(1024, 512)), 11);
        assert_eq!(mip_level_count(UVec2::new(1000, 600)), 10);
    }
}
