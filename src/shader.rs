// Shader modules
//
// Shader bytecode arrives precompiled from the caller; this module only
// validates and wraps it. Compilation from source is someone else's job.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CString;

use crate::device::RenderDevice;
use crate::handle::Handle;
use crate::pipeline::Pipeline;
use crate::render_pass::RenderPass;

/// Shader stages supported by the pipeline builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Reinterpret a SPIR-V byte blob as the u32 words Vulkan expects
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    anyhow::ensure!(
        bytes.len() % 4 == 0,
        "SPIR-V blob length {} is not a multiple of 4",
        bytes.len()
    );
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub struct Shader {
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
    pub entry_point: CString,
    pub name: String,
}

impl Shader {
    pub fn new(
        device: &RenderDevice,
        name: &str,
        spirv: &[u8],
        stage: ShaderStage,
        entry_point: &str,
    ) -> Result<Self> {
        let words = spirv_words(spirv)
            .with_context(|| format!("Invalid SPIR-V for shader '{}'", name))?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .with_context(|| format!("Failed to create shader module '{}'", name))?;

        let entry_point = CString::new(entry_point)
            .with_context(|| format!("Invalid entry point name for shader '{}'", name))?;

        Ok(Self {
            module,
            stage,
            entry_point,
            name: name.to_string(),
        })
    }

    /// Stage info for pipeline creation. The returned struct borrows the
    /// shader's entry-point string.
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage.flags())
            .module(self.module)
            .name(&self.entry_point)
            .build()
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        if self.module != vk::ShaderModule::null() {
            unsafe { device.device.destroy_shader_module(self.module, None) };
            self.module = vk::ShaderModule::null();
        }
    }
}

/// A group of shader stages plus the pipeline and render pass built from them
pub struct ShaderSet {
    pub shaders: Vec<Handle<Shader>>,
    pub pipeline: Handle<Pipeline>,
    pub render_pass: Handle<RenderPass>,
}

impl ShaderSet {
    pub fn new(shaders: Vec<Handle<Shader>>) -> Self {
        Self {
            shaders,
            pipeline: Handle::NONE,
            render_pass: Handle::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_round_trip() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], u32::from_ne_bytes([0x03, 0x02, 0x23, 0x07]));
    }

    #[test]
    fn spirv_words_rejects_truncated_blob() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn spirv_words_accepts_empty() {
        assert!(spirv_words(&[]).unwrap().is_empty());
    }

    #[test]
    fn stage_flag_mapping() {
        assert_eq!(ShaderStage::Vertex.flags(), vk::ShaderStageFlags::VERTEX);
        assert_eq!(ShaderStage::Compute.flags(), vk::ShaderStageFlags::COMPUTE);
    }
}
