// Render context - registries and resource operations
//
// RenderContext owns every GPU object registry plus the one-shot command
// plumbing. It needs no surface, so the whole resource lifecycle runs
// headless in tests.

use anyhow::{Context, Result};
use ash::vk;
use glam::UVec2;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::command::{CommandBuffer, CommandRecorder};
use crate::device::RenderDevice;
use crate::handle::{Handle, HandleRegistry};
use crate::image::{Image, ImageDesc};
use crate::pipeline::Pipeline;
use crate::render_pass::RenderPass;
use crate::shader::{Shader, ShaderSet, ShaderStage};
use crate::types::{MeshBuffers, MeshData, TextureData, TextureKind};

pub struct RenderContext {
    pub device: Arc<RenderDevice>,
    pub buffers: HandleRegistry<Buffer>,
    pub images: HandleRegistry<Image>,
    pub shaders: HandleRegistry<Shader>,
    pub shader_sets: HandleRegistry<ShaderSet>,
    pub pipelines: HandleRegistry<Pipeline>,
    pub render_passes: HandleRegistry<RenderPass>,
    pub command_buffers: HandleRegistry<CommandBuffer>,
    pub semaphores: HandleRegistry<vk::Semaphore>,
    pub fences: HandleRegistry<vk::Fence>,
    graphics_pool: vk::CommandPool,
    shut_down: bool,
}

impl RenderContext {
    pub fn new(device: Arc<RenderDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_queue_family);
        let graphics_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create graphics command pool")?;

        Ok(Self {
            device,
            buffers: HandleRegistry::new(),
            images: HandleRegistry::new(),
            shaders: HandleRegistry::new(),
            shader_sets: HandleRegistry::new(),
            pipelines: HandleRegistry::new(),
            render_passes: HandleRegistry::new(),
            command_buffers: HandleRegistry::new(),
            semaphores: HandleRegistry::new(),
            fences: HandleRegistry::new(),
            graphics_pool,
            shut_down: false,
        })
    }

    // -------------------------------------------------------------------------
    // Synchronization objects
    // -------------------------------------------------------------------------

    /// Create a named semaphore; duplicate names are rejected with NONE.
    pub fn create_semaphore(&mut self, name: &str) -> Result<Handle<vk::Semaphore>> {
        if self.semaphores.contains_name(name) {
            log::error!("Semaphore '{}' already exists", name);
            return Ok(Handle::NONE);
        }
        let create_info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.device.create_semaphore(&create_info, None) }
            .context("Failed to create semaphore")?;
        Ok(self.semaphores.insert_with_name(name, semaphore))
    }

    /// Create a named fence; a signaled fence lets the first frame's wait
    /// pass immediately.
    pub fn create_fence(&mut self, name: &str, signaled: bool) -> Result<Handle<vk::Fence>> {
        if self.fences.contains_name(name) {
            log::error!("Fence '{}' already exists", name);
            return Ok(Handle::NONE);
        }
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.device.device.create_fence(&create_info, None) }
            .context("Failed to create fence")?;
        Ok(self.fences.insert_with_name(name, fence))
    }

    // -------------------------------------------------------------------------
    // Command buffers
    // -------------------------------------------------------------------------

    /// Allocate a named primary command buffer from the graphics pool.
    pub fn create_command_buffer(&mut self, name: &str) -> Result<Handle<CommandBuffer>> {
        if self.command_buffers.contains_name(name) {
            log::error!("Command buffer '{}' already exists", name);
            return Ok(Handle::NONE);
        }
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.graphics_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let raw = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?[0];
        Ok(self.command_buffers.insert_with_name(
            name,
            CommandBuffer {
                raw,
                name: name.to_string(),
            },
        ))
    }

    pub fn recorder(&self, handle: Handle<CommandBuffer>) -> Option<CommandRecorder<'_>> {
        self.command_buffers
            .get(handle)
            .map(|cb| CommandRecorder::new(&self.device, cb.raw))
    }

    /// Begin a one-shot command buffer for an immediate transfer.
    pub fn begin_quick_commands(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.graphics_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate one-shot command buffer")?[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin one-shot command buffer")?;
        Ok(cmd)
    }

    /// Submit the one-shot buffer, wait for the queue to drain, free it.
    pub fn end_quick_commands(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .device
                .end_command_buffer(cmd)
                .context("Failed to end one-shot command buffer")?;

            let cmds = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&cmds);
            self.device
                .device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    vk::Fence::null(),
                )
                .context("Failed to submit one-shot commands")?;
        }
        self.device.wait_graphics_queue_idle()?;
        unsafe {
            self.device
                .device
                .free_command_buffers(self.graphics_pool, &[cmd]);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Buffers
    // -------------------------------------------------------------------------

    /// Upload `data` into a device-local buffer through a staging copy. The
    /// returned handle is usable by any command recorded afterwards.
    pub fn create_static_buffer<T: Copy>(
        &mut self,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Handle<Buffer>> {
        let buffer = self.build_static_buffer(data, usage)?;
        Ok(self.buffers.insert(buffer))
    }

    /// Named variant; an existing name returns the existing handle without
    /// re-uploading.
    pub fn create_named_static_buffer<T: Copy>(
        &mut self,
        name: &str,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Handle<Buffer>> {
        if self.buffers.contains_name(name) {
            log::warn!("Buffer '{}' already exists, returning existing handle", name);
            return Ok(self.buffers.handle_by_name(name));
        }
        let buffer = self.build_static_buffer(data, usage)?;
        Ok(self.buffers.insert_with_name(name, buffer))
    }

    fn build_static_buffer<T: Copy>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Buffer> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        anyhow::ensure!(size > 0, "Cannot create a zero-sized static buffer");

        let mut staging = Buffer::new(
            &self.device,
            "staging buffer",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        staging.write_data(data)?;

        let buffer = Buffer::new(
            &self.device,
            "static buffer",
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        );
        let mut buffer = match buffer {
            Ok(buffer) => buffer,
            Err(e) => {
                staging.destroy(&self.device);
                return Err(e);
            }
        };

        let result = (|| -> Result<()> {
            let cmd = self.begin_quick_commands()?;
            let recorder = CommandRecorder::new(&self.device, cmd);
            recorder.copy_buffer(staging.buffer, buffer.buffer, size);
            self.end_quick_commands(cmd)
        })();
        staging.destroy(&self.device);
        if let Err(e) = result {
            buffer.destroy(&self.device);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Persistently mapped buffer sized for one `T`, written every frame.
    pub fn create_dynamic_buffer<T: Copy>(
        &mut self,
        name: &str,
        usage: vk::BufferUsageFlags,
    ) -> Result<Handle<Buffer>> {
        if self.buffers.contains_name(name) {
            log::warn!("Buffer '{}' already exists, returning existing handle", name);
            return Ok(self.buffers.handle_by_name(name));
        }
        let buffer = Buffer::new(
            &self.device,
            name,
            std::mem::size_of::<T>() as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
        )?;
        Ok(self.buffers.insert_with_name(name, buffer))
    }

    /// Direct memcpy into the mapping. The caller owns the synchronization:
    /// nothing here stops the GPU from reading the same bytes.
    pub fn update_dynamic_buffer<T: Copy>(
        &mut self,
        handle: Handle<Buffer>,
        data: &T,
    ) -> Result<()> {
        let buffer = self
            .buffers
            .get_mut(handle)
            .context("Dynamic buffer not found")?;
        buffer.write_data(std::slice::from_ref(data))
    }

    /// Read a buffer's full contents back to the host. Device-local buffers
    /// must carry TRANSFER_SRC usage; the copy goes through a staging buffer.
    pub fn read_buffer(&mut self, handle: Handle<Buffer>) -> Result<Vec<u8>> {
        let (raw, size, usage, host_visible) = {
            let buffer = self.buffers.get(handle).context("Buffer not found")?;
            (
                buffer.buffer,
                buffer.size,
                buffer.usage,
                buffer.mapped_ptr().is_some(),
            )
        };

        if host_visible {
            return self
                .buffers
                .get(handle)
                .context("Buffer not found")?
                .read_bytes();
        }

        anyhow::ensure!(
            usage.contains(vk::BufferUsageFlags::TRANSFER_SRC),
            "Buffer lacks TRANSFER_SRC usage, cannot read back"
        );

        let mut staging = Buffer::new(
            &self.device,
            "readback staging",
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let result = (|| -> Result<Vec<u8>> {
            let cmd = self.begin_quick_commands()?;
            let recorder = CommandRecorder::new(&self.device, cmd);
            recorder.copy_buffer(raw, staging.buffer, size);
            self.end_quick_commands(cmd)?;
            staging.read_bytes()
        })();
        staging.destroy(&self.device);
        result
    }

    /// Release a buffer's GPU resources. The registry slot stays occupied,
    /// so other handles are unaffected.
    pub fn destroy_buffer(&mut self, handle: Handle<Buffer>) -> Result<()> {
        let device = self.device.clone();
        let buffer = self.buffers.get_mut(handle).context("Buffer not found")?;
        buffer.destroy(&device);
        Ok(())
    }

    /// Upload the three vertex streams and the index buffer as static
    /// buffers.
    pub fn create_mesh_buffers(&mut self, mesh: &MeshData) -> Result<MeshBuffers> {
        let positions =
            self.create_static_buffer(&mesh.positions, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let normals =
            self.create_static_buffer(&mesh.normals, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let uvs = self.create_static_buffer(&mesh.uvs, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let indices =
            self.create_static_buffer(&mesh.indices, vk::BufferUsageFlags::INDEX_BUFFER)?;
        Ok(MeshBuffers {
            positions,
            normals,
            uvs,
            indices,
            index_count: mesh.indices.len() as u32,
        })
    }

    // -------------------------------------------------------------------------
    // Images
    // -------------------------------------------------------------------------

    /// Upload a texture: stage, transition, copy, then generate the mip
    /// chain (color) or transition straight to shader-read (HDR, no mips).
    pub fn create_texture_image(
        &mut self,
        texture: &TextureData,
        mip_levels: u32,
    ) -> Result<Handle<Image>> {
        anyhow::ensure!(
            texture.channels == 4,
            "Unsupported texture format: {} channels (expected 4)",
            texture.channels
        );
        if self.images.contains_name(&texture.name) {
            log::error!("Image '{}' already exists", texture.name);
            return Ok(Handle::NONE);
        }

        let (format, bytes_per_channel, mip_levels) = match texture.kind {
            TextureKind::Color => (vk::Format::R8G8B8A8_SRGB, 1, mip_levels),
            TextureKind::Hdr => (vk::Format::R32G32B32A32_SFLOAT, 4, 1),
        };
        // Widened before multiplying: large HDR extents overflow u32.
        let expected = texture.size.x as u64
            * texture.size.y as u64
            * texture.channels as u64
            * bytes_per_channel as u64;
        anyhow::ensure!(
            texture.pixels.len() as u64 == expected,
            "Texture '{}' supplies {} bytes, expected {}",
            texture.name,
            texture.pixels.len(),
            expected
        );

        let mut staging = Buffer::new(
            &self.device,
            "texture staging",
            expected as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        staging.write_bytes(&texture.pixels)?;

        let image = Image::new(
            &self.device,
            &ImageDesc {
                name: &texture.name,
                size: texture.size,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
                format,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        );
        let mut image = match image {
            Ok(image) => image,
            Err(e) => {
                staging.destroy(&self.device);
                return Err(e);
            }
        };

        let result = (|| -> Result<()> {
            let cmd = self.begin_quick_commands()?;
            let recorder = CommandRecorder::new(&self.device, cmd);
            recorder.transition_image(
                &mut image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            )?;
            recorder.copy_buffer_to_image(staging.buffer, &image);
            if image.mip_levels > 1 {
                recorder.generate_mipmaps(&mut image);
            } else {
                recorder.transition_image(
                    &mut image,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                )?;
            }
            self.end_quick_commands(cmd)
        })();
        staging.destroy(&self.device);
        if let Err(e) = result {
            image.destroy(&self.device);
            return Err(e);
        }

        image.create_sampler(&self.device)?;
        Ok(self.images.insert_with_name(&texture.name, image))
    }

    /// Create a non-texture image (storage or attachment-like) with a
    /// sampler attached.
    pub fn create_image(
        &mut self,
        name: &str,
        size: UVec2,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        tiling: vk::ImageTiling,
        mip_levels: u32,
    ) -> Result<Handle<Image>> {
        if self.images.contains_name(name) {
            log::error!("Image '{}' already exists", name);
            return Ok(Handle::NONE);
        }
        let mut image = Image::new(
            &self.device,
            &ImageDesc {
                name,
                size,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
                format,
                tiling,
                usage,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )?;
        image.create_sampler(&self.device)?;
        Ok(self.images.insert_with_name(name, image))
    }

    pub fn resize_image(&mut self, handle: Handle<Image>, size: UVec2) -> Result<()> {
        let device = self.device.clone();
        let image = self.images.get_mut(handle).context("Image not found")?;
        image.resize(&device, size)
    }

    /// Record a one-shot layout transition. An unsupported layout pair
    /// leaves the image's recorded layout untouched.
    pub fn transition_image_layout(
        &mut self,
        handle: Handle<Image>,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> Result<()> {
        let device = self.device.clone();
        let cmd = self.begin_quick_commands()?;
        let transition = {
            let image = self.images.get_mut(handle).context("Image not found")?;
            let recorder = CommandRecorder::new(&device, cmd);
            recorder.transition_image(image, new_layout, src_stage, dst_stage)
        };
        // Submit either way; a failed transition leaves the buffer empty.
        self.end_quick_commands(cmd)?;
        transition
    }

    /// Read one mip level's pixels back to the host, restoring the image's
    /// previous layout afterwards.
    pub fn read_image_pixels(&mut self, handle: Handle<Image>, mip_level: u32) -> Result<Vec<u8>> {
        let device = self.device.clone();
        let (size, format, mip_levels, prior_layout) = {
            let image = self.images.get(handle).context("Image not found")?;
            (
                image.size,
                image.format,
                image.mip_levels,
                image.current_layout,
            )
        };
        anyhow::ensure!(
            mip_level < mip_levels,
            "Mip level {} out of range ({} levels)",
            mip_level,
            mip_levels
        );
        let bytes_per_pixel: u32 = match format {
            vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => 4,
            vk::Format::R32G32B32A32_SFLOAT => 16,
            other => anyhow::bail!("Cannot read back pixels of format {:?}", other),
        };

        let width = (size.x >> mip_level).max(1);
        let height = (size.y >> mip_level).max(1);
        let mut staging = Buffer::new(
            &device,
            "pixel readback staging",
            width as vk::DeviceSize * height as vk::DeviceSize * bytes_per_pixel as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;

        let result = (|| -> Result<Vec<u8>> {
            let cmd = self.begin_quick_commands()?;
            {
                let image = self.images.get_mut(handle).context("Image not found")?;
                let recorder = CommandRecorder::new(&device, cmd);
                recorder.transition_image(
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::PipelineStageFlags::TRANSFER,
                )?;
                recorder.copy_image_mip_to_buffer(image, mip_level, staging.buffer);
                if prior_layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL
                    && prior_layout != vk::ImageLayout::UNDEFINED
                {
                    recorder.transition_image(
                        image,
                        prior_layout,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                    )?;
                }
            }
            self.end_quick_commands(cmd)?;
            staging.read_bytes()
        })();
        staging.destroy(&device);
        result
    }

    // -------------------------------------------------------------------------
    // Shaders
    // -------------------------------------------------------------------------

    pub fn create_shader(
        &mut self,
        name: &str,
        spirv: &[u8],
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<Handle<Shader>> {
        if self.shaders.contains_name(name) {
            log::error!("Shader '{}' already exists", name);
            return Ok(Handle::NONE);
        }
        let shader = Shader::new(&self.device, name, spirv, stage, entry_point)?;
        Ok(self.shaders.insert_with_name(name, shader))
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Destroy every owned GPU object in dependency order. Safe to call
    /// more than once; `Drop` calls it as a backstop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Err(e) = self.device.wait_idle() {
            log::error!("Device idle wait failed during shutdown: {}", e);
        }
        let device = self.device.clone();

        for mut pipeline in self.pipelines.drain() {
            pipeline.destroy(&device);
        }
        for mut pass in self.render_passes.drain() {
            pass.destroy(&device);
        }
        for mut image in self.images.drain() {
            image.destroy(&device);
        }
        for mut buffer in self.buffers.drain() {
            buffer.destroy(&device);
        }
        for mut shader in self.shaders.drain() {
            shader.destroy(&device);
        }
        self.shader_sets.drain().for_each(drop);
        // Command buffers are freed with their pool
        self.command_buffers.drain().for_each(drop);
        unsafe {
            for semaphore in self.semaphores.drain() {
                device.device.destroy_semaphore(semaphore, None);
            }
            for fence in self.fences.drain() {
                device.device.destroy_fence(fence, None);
            }
            if self.graphics_pool != vk::CommandPool::null() {
                device.device.destroy_command_pool(self.graphics_pool, None);
                self.graphics_pool = vk::CommandPool::null();
            }
        }
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
