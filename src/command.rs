// Command recording
//
// CommandRecorder is a thin borrow over a raw command buffer; it exists so
// recorded state (image layouts) can be updated in lockstep with the
// commands that change it.

use anyhow::{Context, Result};
use ash::vk;

use crate::barrier;
use crate::device::RenderDevice;
use crate::image::Image;
use crate::render_pass::RenderPass;

/// A named primary command buffer held in a registry
pub struct CommandBuffer {
    pub raw: vk::CommandBuffer,
    pub name: String,
}

pub struct CommandRecorder<'a> {
    device: &'a RenderDevice,
    pub cmd: vk::CommandBuffer,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(device: &'a RenderDevice, cmd: vk::CommandBuffer) -> Self {
        Self { device, cmd }
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")
        }
    }

    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(flags);
        unsafe {
            self.device
                .device
                .begin_command_buffer(self.cmd, &begin_info)
                .context("Failed to begin command buffer")
        }
    }

    pub fn end(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .end_command_buffer(self.cmd)
                .context("Failed to end command buffer")
        }
    }

    pub fn begin_render_pass(
        &self,
        pass: &RenderPass,
        image_index: usize,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let framebuffer = *pass
            .framebuffers
            .get(image_index)
            .context("Framebuffer index out of range")?;

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass.raw)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&pass.clear_values);

        unsafe {
            self.device
                .device
                .cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    pub fn end_render_pass(&self) {
        unsafe { self.device.device.cmd_end_render_pass(self.cmd) };
    }

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(self.cmd, bind_point, pipeline);
        }
    }

    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .device
                .cmd_bind_descriptor_sets(self.cmd, bind_point, layout, first_set, sets, &[]);
        }
    }

    pub fn bind_vertex_buffers(&self, buffers: &[vk::Buffer]) {
        let offsets = vec![0; buffers.len()];
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(self.cmd, 0, buffers, &offsets);
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .device
                .cmd_bind_index_buffer(self.cmd, buffer, 0, vk::IndexType::UINT32);
        }
    }

    pub fn set_viewport(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe { self.device.device.cmd_set_viewport(self.cmd, 0, &[viewport]) };
    }

    pub fn set_scissor(&self, extent: vk::Extent2D) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe { self.device.device.cmd_set_scissor(self.cmd, 0, &[scissor]) };
    }

    pub fn push_constants(
        &self,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .device
                .cmd_push_constants(self.cmd, layout, stages, offset, data);
        }
    }

    pub fn draw_indexed(&self, index_count: u32) {
        unsafe {
            self.device
                .device
                .cmd_draw_indexed(self.cmd, index_count, 1, 0, 0, 0);
        }
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) {
        unsafe { self.device.device.cmd_dispatch(self.cmd, x, y, z) };
    }

    /// Record a layout transition for the whole mip chain and update the
    /// image's recorded layout. An unsupported layout pair leaves the
    /// recorded layout untouched and returns the error.
    pub fn transition_image(
        &self,
        image: &mut Image,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let old_layout = image.current_layout;
        let (src_access, dst_access) = match barrier::transition_masks(old_layout, new_layout) {
            Ok(masks) => masks,
            Err(e) => {
                log::error!(
                    "Unsupported layout transition {:?} -> {:?}: {}",
                    old_layout,
                    new_layout,
                    e
                );
                return Err(e);
            }
        };
        let aspect = barrier::aspect_for_transition(new_layout, image.format);

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: image.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[*barrier],
            );
        }

        image.current_layout = new_layout;
        Ok(())
    }

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .device
                .cmd_copy_buffer(self.cmd, src, dst, &[region]);
        }
    }

    pub fn copy_buffer_to_image(&self, src: vk::Buffer, image: &Image) {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: image.size.x,
                height: image.size.y,
                depth: 1,
            },
        };
        unsafe {
            self.device.device.cmd_copy_buffer_to_image(
                self.cmd,
                src,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    pub fn copy_image_mip_to_buffer(&self, image: &Image, mip_level: u32, dst: vk::Buffer) {
        let width = (image.size.x >> mip_level).max(1);
        let height = (image.size.y >> mip_level).max(1);
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        unsafe {
            self.device.device.cmd_copy_image_to_buffer(
                self.cmd,
                image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                &[region],
            );
        }
    }

    /// Blit cascade filling every mip level from level 0, leaving the whole
    /// chain in SHADER_READ_ONLY_OPTIMAL. The image must be in
    /// TRANSFER_DST_OPTIMAL when this is recorded.
    pub fn generate_mipmaps(&self, image: &mut Image) {
        let mut barrier = vk::ImageMemoryBarrier::builder()
            .image(image.image)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        let mut mip_width = image.size.x as i32;
        let mut mip_height = image.size.y as i32;

        for level in 1..image.mip_levels {
            // Source level: finished receiving, becomes a blit source
            barrier.subresource_range.base_mip_level = level - 1;
            barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
            barrier.dst_access_mask = vk::AccessFlags::TRANSFER_READ;

            unsafe {
                self.device.device.cmd_pipeline_barrier(
                    self.cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }

            let next_width = (mip_width / 2).max(1);
            let next_height = (mip_height / 2).max(1);

            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: mip_width,
                        y: mip_height,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ],
            };

            unsafe {
                self.device.device.cmd_blit_image(
                    self.cmd,
                    image.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            // Source level is done for good, hand it to the shaders
            barrier.old_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
            barrier.src_access_mask = vk::AccessFlags::TRANSFER_READ;
            barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;

            unsafe {
                self.device.device.cmd_pipeline_barrier(
                    self.cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }

            mip_width = next_width;
            mip_height = next_height;
        }

        // Last level never becomes a blit source
        barrier.subresource_range.base_mip_level = image.mip_levels - 1;
        barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        barrier.new_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        barrier.src_access_mask = vk::AccessFlags::TRANSFER_WRITE;
        barrier.dst_access_mask = vk::AccessFlags::SHADER_READ;

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                self.cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        image.current_layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    }
}
