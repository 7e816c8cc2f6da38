// Renderer - frame scheduling over the render context
//
// One frame in flight, gated by a single fence. Each texture gets its own
// material descriptor set at startup so draws in one frame can use
// different textures without touching live descriptors.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::config::RenderConfig;
use crate::context::RenderContext;
use crate::descriptor::{DescriptorArena, DescriptorResourceInfo, DescriptorSetData};
use crate::device::RenderDevice;
use crate::handle::Handle;
use crate::image::{self, Image};
use crate::pipeline::Pipeline;
use crate::render_pass::RenderPass;
use crate::shader::{ShaderSet, ShaderStage};
use crate::swapchain::{Surface, Swapchain, SwapchainState};
use crate::types::{
    CameraData, Drawable, MeshBuffers, MeshData, PushConstants, ShaderSource, SurfaceProvider,
    TextureData, TextureKind,
};
use crate::GraphicsBackend;

const GLOBAL_LAYOUT: &str = "globals";
const MATERIAL_LAYOUT: &str = "materials";
const DEFAULT_TEXTURE: &str = "default albedo";

pub struct Renderer {
    pub context: RenderContext,
    arena: DescriptorArena,
    surface: Surface,
    swapchain: Swapchain,
    config: RenderConfig,

    camera_buffer: Handle<Buffer>,
    main_pass: Handle<RenderPass>,
    frame_commands: Handle<CommandBuffer>,
    in_flight_fence: Handle<vk::Fence>,
    image_available: Handle<vk::Semaphore>,
    render_finished: Handle<vk::Semaphore>,

    global_set: Handle<DescriptorSetData>,
    material_sets: HashMap<Handle<Image>, Handle<DescriptorSetData>>,
    default_material: Handle<DescriptorSetData>,

    shut_down: bool,
}

impl Renderer {
    pub fn device(&self) -> &Arc<RenderDevice> {
        &self.context.device
    }

    /// Handle of an uploaded texture by its asset name.
    pub fn texture_handle(&self, name: &str) -> Handle<Image> {
        self.context.images.handle_by_name(name)
    }

    pub fn shader_set_handle(&self, name: &str) -> Handle<ShaderSet> {
        self.context.shader_sets.handle_by_name(name)
    }

    /// Swap the texture behind a material set in place. The caller must
    /// guarantee the GPU is not reading the set, e.g. after an idle wait.
    pub fn set_material_texture(
        &mut self,
        material: Handle<DescriptorSetData>,
        texture: Handle<Image>,
    ) -> Result<()> {
        let resource = {
            let image = self
                .context
                .images
                .get(texture)
                .context("Texture not found")?;
            material_resource(image)?
        };
        self.arena
            .update_set(&self.context.device, resource, material, 0, 0)
    }

    fn upload_textures(&mut self, textures: &[TextureData]) -> Result<()> {
        let fallback = TextureData {
            name: DEFAULT_TEXTURE.to_string(),
            pixels: vec![255; 4],
            size: glam::UVec2::ONE,
            channels: 4,
            kind: TextureKind::Color,
        };
        self.context.create_texture_image(&fallback, 1)?;

        for texture in textures {
            let mip_levels = match texture.kind {
                TextureKind::Color => image::mip_level_count(texture.size),
                TextureKind::Hdr => 1,
            };
            let handle = self.context.create_texture_image(texture, mip_levels)?;
            anyhow::ensure!(
                !handle.is_none(),
                "Failed to upload texture '{}'",
                texture.name
            );
        }
        Ok(())
    }

    fn build_descriptors(&mut self) -> Result<()> {
        self.arena.add_binding(
            GLOBAL_LAYOUT,
            0,
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::VERTEX,
            vk::DescriptorBindingFlags::empty(),
            vk::DescriptorSetLayoutCreateFlags::empty(),
            vk::DescriptorPoolCreateFlags::empty(),
        )?;
        self.arena.add_binding(
            MATERIAL_LAYOUT,
            1,
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            vk::ShaderStageFlags::FRAGMENT,
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL,
            vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
        )?;
        self.arena
            .add_push_constant(vk::ShaderStageFlags::VERTEX, std::mem::size_of::<PushConstants>() as u32);
        self.arena.create_layouts(&self.context.device)?;

        let camera = self
            .context
            .buffers
            .get(self.camera_buffer)
            .context("Camera buffer not found")?;
        let global_layout = self.arena.layout_handle_by_name(GLOBAL_LAYOUT);
        self.global_set = self.arena.add_set(
            global_layout,
            vec![DescriptorResourceInfo {
                buffer_infos: vec![vk::DescriptorBufferInfo {
                    buffer: camera.buffer,
                    offset: 0,
                    range: std::mem::size_of::<CameraData>() as vk::DeviceSize,
                }],
                ..Default::default()
            }],
            "global set",
        );
        anyhow::ensure!(!self.global_set.is_none(), "Failed to stage global set");

        // One material set per texture
        let material_layout = self.arena.layout_handle_by_name(MATERIAL_LAYOUT);
        let mut staged = Vec::new();
        for index in 0..self.context.images.len() {
            let handle = Handle::from_index(index);
            let (name, resource) = {
                let img = self.context.images.get(handle).context("Image missing")?;
                if img.sampler.is_none() {
                    continue;
                }
                (format!("material {}", index), material_resource(img)?)
            };
            staged.push((handle, material_layout, resource, name));
        }
        for (handle, layout, resource, name) in staged {
            let set = self.arena.add_set(layout, vec![resource], &name);
            anyhow::ensure!(!set.is_none(), "Failed to stage material set '{}'", name);
            self.material_sets.insert(handle, set);
        }

        self.arena.create_sets(&self.context.device)?;
        self.default_material = *self
            .material_sets
            .get(&self.texture_handle(DEFAULT_TEXTURE))
            .context("Default material set missing")?;
        Ok(())
    }

    fn build_pipeline(&mut self, shaders: &[ShaderSource]) -> Result<()> {
        let mut shader_handles = Vec::new();
        for source in shaders {
            if source.stage == ShaderStage::Compute {
                continue;
            }
            let handle = self.context.create_shader(
                &source.name,
                &source.spirv,
                source.stage,
                &source.entry_point,
            )?;
            anyhow::ensure!(!handle.is_none(), "Failed to create shader '{}'", source.name);
            shader_handles.push(handle);
        }
        anyhow::ensure!(
            !shader_handles.is_empty(),
            "No graphics shaders supplied for the default pipeline"
        );

        let pipeline = {
            let pass = self
                .context
                .render_passes
                .get(self.main_pass)
                .context("Main render pass missing")?;
            let shader_refs: Vec<&_> = shader_handles
                .iter()
                .filter_map(|&h| self.context.shaders.get(h))
                .collect();
            Pipeline::create_graphics(&self.context.device, &self.arena, pass, &shader_refs)?
        };
        let pipeline_handle = self.context.pipelines.insert(pipeline);

        let mut shader_set = ShaderSet::new(shader_handles);
        shader_set.pipeline = pipeline_handle;
        shader_set.render_pass = self.main_pass;
        self.context
            .shader_sets
            .insert_with_name("default", shader_set);
        Ok(())
    }

    /// Resize recovery: block while the framebuffer is zero-sized, then
    /// rebuild the swapchain and every pass's attachments and framebuffers.
    /// Pipelines survive; the surface format choice is deterministic.
    fn recover_swapchain(&mut self, window: &dyn SurfaceProvider) -> Result<()> {
        let mut size = window.framebuffer_size();
        while size.x == 0 || size.y == 0 {
            window.wait_events();
            size = window.framebuffer_size();
        }

        let device = self.context.device.clone();
        device.wait_idle()?;
        self.swapchain
            .recreate(&device, &self.surface, size, self.config.present_mode())?;
        for pass in self.context.render_passes.iter_mut() {
            pass.recreate_targets(&device, self.swapchain.extent, &self.swapchain.image_views)?;
        }
        Ok(())
    }

    fn record_frame(&self, drawables: &[Drawable], image_index: u32) -> Result<()> {
        let recorder = self
            .context
            .recorder(self.frame_commands)
            .context("Frame command buffer missing")?;
        let pass = self
            .context
            .render_passes
            .get(self.main_pass)
            .context("Main render pass missing")?;
        let extent = self.swapchain.extent;

        recorder.reset()?;
        recorder.begin(vk::CommandBufferUsageFlags::empty())?;
        recorder.begin_render_pass(pass, image_index as usize, extent)?;

        for drawable in drawables {
            let Some(shader_set) = self.context.shader_sets.get(drawable.shader_set) else {
                continue;
            };
            let Some(pipeline) = self.context.pipelines.get(shader_set.pipeline) else {
                continue;
            };

            let material = self
                .material_sets
                .get(&drawable.albedo)
                .copied()
                .unwrap_or_else(|| {
                    log::error!("No material set for {:?}, using default", drawable.albedo);
                    self.default_material
                });
            let (Some(global), Some(material)) = (
                self.arena.raw_set(self.global_set),
                self.arena.raw_set(material),
            ) else {
                continue;
            };

            let Some(vertex_buffers) = self.mesh_vertex_buffers(&drawable.mesh) else {
                continue;
            };
            let Some(index_buffer) = self
                .context
                .buffers
                .get(drawable.mesh.indices)
                .map(|b| b.buffer)
            else {
                continue;
            };

            recorder.bind_pipeline(pipeline.bind_point(), pipeline.raw);
            recorder.set_viewport(extent);
            recorder.set_scissor(extent);
            recorder.bind_descriptor_sets(
                pipeline.bind_point(),
                pipeline.layout,
                0,
                &[global, material],
            );
            recorder.bind_vertex_buffers(&vertex_buffers);
            recorder.bind_index_buffer(index_buffer);

            let push = PushConstants {
                model: drawable.transform,
            };
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    (&push as *const PushConstants) as *const u8,
                    std::mem::size_of::<PushConstants>(),
                )
            };
            recorder.push_constants(
                pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytes,
            );
            recorder.draw_indexed(drawable.mesh.index_count);
        }

        recorder.end_render_pass();
        recorder.end()
    }

    fn mesh_vertex_buffers(&self, mesh: &MeshBuffers) -> Option<[vk::Buffer; 3]> {
        let positions = self.context.buffers.get(mesh.positions)?.buffer;
        let normals = self.context.buffers.get(mesh.normals)?.buffer;
        let uvs = self.context.buffers.get(mesh.uvs)?.buffer;
        Some([positions, normals, uvs])
    }
}

impl GraphicsBackend for Renderer {
    type Buffer = Buffer;
    type Image = Image;
    type Shader = crate::shader::Shader;
    type Pipeline = Pipeline;

    fn startup(
        config: RenderConfig,
        window: &dyn SurfaceProvider,
        shaders: &[ShaderSource],
        textures: &[TextureData],
    ) -> Result<Self> {
        let device = RenderDevice::new(
            &config.window.title,
            config.debug.validation_layers,
            Some(window.raw_display_handle()),
        )?;
        let mut context = RenderContext::new(device.clone())?;

        let surface = Surface::new(
            &device,
            window.raw_display_handle(),
            window.raw_window_handle(),
        )?;
        let swapchain = Swapchain::new(
            &device,
            &surface,
            window.framebuffer_size(),
            config.present_mode(),
        )?;

        let pass = RenderPass::new(
            &device,
            swapchain.format.format,
            swapchain.extent,
            &swapchain.image_views,
            config.sample_count(),
            config.graphics.depth_test,
            config.clear_color(),
        )?;
        let main_pass = context.render_passes.insert_with_name("main pass", pass);

        let camera_buffer = context
            .create_dynamic_buffer::<CameraData>("camera uniform", vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        let frame_commands = context.create_command_buffer("frame commands")?;
        let in_flight_fence = context.create_fence("in flight", true)?;
        let image_available = context.create_semaphore("image available")?;
        let render_finished = context.create_semaphore("render finished")?;

        let mut renderer = Self {
            context,
            arena: DescriptorArena::new(),
            surface,
            swapchain,
            config,
            camera_buffer,
            main_pass,
            frame_commands,
            in_flight_fence,
            image_available,
            render_finished,
            global_set: Handle::NONE,
            material_sets: HashMap::new(),
            default_material: Handle::NONE,
            shut_down: false,
        };

        renderer.upload_textures(textures)?;
        renderer.build_descriptors()?;
        renderer.build_pipeline(shaders)?;

        log::info!("Renderer ready ({} textures)", renderer.material_sets.len());
        Ok(renderer)
    }

    fn create_mesh_buffers(&mut self, mesh: &MeshData) -> Result<MeshBuffers> {
        self.context.create_mesh_buffers(mesh)
    }

    /// One frame: fence wait, acquire, uniform update, record, submit,
    /// present. A stale surface at acquire or present triggers the resize
    /// protocol; any other failure returns early and the next frame's fence
    /// wait restores consistency.
    fn draw_frame(
        &mut self,
        window: &dyn SurfaceProvider,
        drawables: &[Drawable],
        camera: &CameraData,
    ) -> Result<()> {
        let device = self.context.device.clone();
        let fence = *self
            .context
            .fences
            .get(self.in_flight_fence)
            .context("In-flight fence missing")?;
        let image_available = *self
            .context
            .semaphores
            .get(self.image_available)
            .context("Image-available semaphore missing")?;
        let render_finished = *self
            .context
            .semaphores
            .get(self.render_finished)
            .context("Render-finished semaphore missing")?;

        device.wait_for_fence(fence)?;

        let (image_index, state) = self.swapchain.acquire_next_image(image_available)?;
        if state == SwapchainState::OutOfDate {
            self.recover_swapchain(window)?;
            return Ok(());
        }
        self.context.update_dynamic_buffer(self.camera_buffer, camera)?;
        self.record_frame(drawables, image_index)?;

        let cmd = self
            .context
            .command_buffers
            .get(self.frame_commands)
            .context("Frame command buffer missing")?
            .raw;
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        // Reset only once the frame is fully recorded: any earlier failure
        // returns with the fence still signaled, so the next frame's wait
        // passes. An abandoned frame does leave image-available signaled;
        // the next successful submit consumes that signal before the
        // semaphore is reused.
        device.reset_fence(fence)?;
        unsafe {
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info.build()], fence)
                .context("Failed to submit frame")?;
        }

        let state = self
            .swapchain
            .present(device.graphics_queue, image_index, render_finished)?;
        if state != SwapchainState::Optimal {
            self.recover_swapchain(window)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        log::info!("Shutting down renderer");
        let device = self.context.device.clone();
        if let Err(e) = device.wait_idle() {
            log::error!("Device idle wait failed during shutdown: {}", e);
        }
        self.arena.destroy(&device);
        self.context.shutdown();
        self.swapchain.destroy(&device);
        self.surface.destroy();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn material_resource(image: &Image) -> Result<DescriptorResourceInfo> {
    let sampler = image.sampler.context("Image has no sampler")?;
    Ok(DescriptorResourceInfo {
        image_infos: vec![vk::DescriptorImageInfo {
            sampler,
            image_view: image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }],
        ..Default::default()
    })
}
