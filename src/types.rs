// Collaborator-facing data types
//
// Geometry, texture pixels and shader bytecode arrive already validated
// from the asset side; the renderer only turns them into GPU objects.

use glam::{IVec2, Mat4, UVec2, Vec2, Vec3};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::buffer::Buffer;
use crate::handle::Handle;
use crate::image::Image;
use crate::shader::{ShaderSet, ShaderStage};

/// What the renderer needs from a window: native handles, the current
/// framebuffer size, and a blocking event wait for resize recovery.
pub trait SurfaceProvider {
    fn raw_display_handle(&self) -> RawDisplayHandle;
    fn raw_window_handle(&self) -> RawWindowHandle;
    fn framebuffer_size(&self) -> IVec2;
    fn wait_events(&self);
}

/// Mesh geometry as three separate vertex streams plus indices
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    /// 8-bit components, mip chain generated on upload
    Color,
    /// 32-bit float components, single mip level
    Hdr,
}

pub struct TextureData {
    pub name: String,
    pub pixels: Vec<u8>,
    pub size: UVec2,
    pub channels: u32,
    pub kind: TextureKind,
}

pub struct ShaderSource {
    pub name: String,
    pub spirv: Vec<u8>,
    pub stage: ShaderStage,
    pub entry_point: String,
}

/// Per-frame camera payload written into the mapped uniform buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CameraData {
    pub view_projection: Mat4,
}

/// Per-draw payload pushed as constants
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PushConstants {
    pub model: Mat4,
}

/// GPU-resident mesh: one static buffer per vertex stream plus indices
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    pub positions: Handle<Buffer>,
    pub normals: Handle<Buffer>,
    pub uvs: Handle<Buffer>,
    pub indices: Handle<Buffer>,
    pub index_count: u32,
}

/// One draw call: a mesh, the shader set rendering it, its albedo texture
/// and a model transform.
pub struct Drawable {
    pub mesh: MeshBuffers,
    pub shader_set: Handle<ShaderSet>,
    pub albedo: Handle<Image>,
    pub transform: Mat4,
}
