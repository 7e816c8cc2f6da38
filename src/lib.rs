//! Explicit-control Vulkan rendering backend.
//!
//! Every GPU object lives in a typed handle registry owned by a
//! [`RenderContext`]; the [`Renderer`] schedules frames over it behind the
//! [`GraphicsBackend`] trait. Windowing, assets and shader compilation are
//! collaborators: the crate takes native handles, geometry arrays, pixel
//! buffers and SPIR-V blobs, and hands opaque handles back.

use anyhow::Result;

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod handle;
pub mod image;
pub mod pipeline;
pub mod render_pass;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod types;

pub use buffer::Buffer;
pub use config::RenderConfig;
pub use context::RenderContext;
pub use descriptor::{DescriptorArena, DescriptorResourceInfo};
pub use device::RenderDevice;
pub use handle::{Handle, HandleRegistry};
pub use image::Image;
pub use pipeline::{Pipeline, PipelineKind};
pub use render_pass::RenderPass;
pub use renderer::Renderer;
pub use shader::{Shader, ShaderSet, ShaderStage};
pub use swapchain::SwapchainState;
pub use types::{
    CameraData, Drawable, MeshBuffers, MeshData, PushConstants, ShaderSource, SurfaceProvider,
    TextureData, TextureKind,
};

/// A rendering backend: resource upload plus a frame loop.
///
/// The associated types name the backend's GPU object records so callers
/// can hold `Handle<B::Image>` etc. without naming a concrete backend.
pub trait GraphicsBackend: Sized {
    type Buffer;
    type Image;
    type Shader;
    type Pipeline;

    /// Bring up the device, swapchain, default render pass and pipeline.
    fn startup(
        config: RenderConfig,
        window: &dyn SurfaceProvider,
        shaders: &[ShaderSource],
        textures: &[TextureData],
    ) -> Result<Self>;

    /// Upload mesh geometry into device-local buffers.
    fn create_mesh_buffers(&mut self, mesh: &MeshData) -> Result<MeshBuffers>;

    /// Render and present one frame.
    fn draw_frame(
        &mut self,
        window: &dyn SurfaceProvider,
        drawables: &[Drawable],
        camera: &CameraData,
    ) -> Result<()>;

    /// Tear down every GPU object. Idempotent; also run on drop.
    fn shutdown(&mut self);
}
