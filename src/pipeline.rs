// Pipeline creation
//
// Graphics pipelines consume three separate vertex streams (position,
// normal, uv) and render into a pass-owned framebuffer; viewport and
// scissor are always dynamic so pipelines survive resizes.

use anyhow::{Context, Result};
use ash::vk;

use crate::descriptor::DescriptorArena;
use crate::device::RenderDevice;
use crate::render_pass::RenderPass;
use crate::shader::{Shader, ShaderStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

pub struct Pipeline {
    pub raw: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub kind: PipelineKind,
}

/// Check a stage list against the pipeline kind it is meant to build.
fn validate_stage_list(kind: PipelineKind, stages: &[ShaderStage]) -> Result<()> {
    match kind {
        PipelineKind::Graphics => {
            anyhow::ensure!(
                !stages.is_empty(),
                "Graphics pipeline requires at least one shader stage"
            );
            anyhow::ensure!(
                !stages.contains(&ShaderStage::Compute),
                "Compute shader in a graphics pipeline stage list"
            );
        }
        PipelineKind::Compute => {
            anyhow::ensure!(
                stages.len() == 1 && stages[0] == ShaderStage::Compute,
                "Compute pipeline requires exactly one compute shader, got {:?}",
                stages
            );
        }
    }
    Ok(())
}

impl Pipeline {
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }

    pub fn create_graphics(
        device: &RenderDevice,
        arena: &DescriptorArena,
        pass: &RenderPass,
        shaders: &[&Shader],
    ) -> Result<Self> {
        let stages: Vec<ShaderStage> = shaders.iter().map(|s| s.stage).collect();
        validate_stage_list(PipelineKind::Graphics, &stages)?;

        let layout = Self::create_layout(device, arena)?;
        let raw = match Self::create_graphics_raw(device, layout, pass, shaders) {
            Ok(raw) => raw,
            Err(e) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e);
            }
        };

        Ok(Self {
            raw,
            layout,
            kind: PipelineKind::Graphics,
        })
    }

    pub fn create_compute(
        device: &RenderDevice,
        arena: &DescriptorArena,
        shader: &Shader,
    ) -> Result<Self> {
        validate_stage_list(PipelineKind::Compute, &[shader.stage])?;

        let layout = Self::create_layout(device, arena)?;
        let stage = shader.stage_info();
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout)
            .build();

        let raw = unsafe {
            device.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        }
        .map_err(|(_, e)| e)
        .context("Failed to create compute pipeline");

        match raw {
            Ok(pipelines) => Ok(Self {
                raw: pipelines[0],
                layout,
                kind: PipelineKind::Compute,
            }),
            Err(e) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                Err(e)
            }
        }
    }

    /// Destroy and rebuild in place, dispatching on the pipeline's recorded
    /// kind. A shader list whose stages do not match that kind is an error,
    /// rejected before teardown so the old pipeline survives.
    pub fn recreate(
        &mut self,
        device: &RenderDevice,
        arena: &DescriptorArena,
        pass: Option<&RenderPass>,
        shaders: &[&Shader],
    ) -> Result<()> {
        let stages: Vec<ShaderStage> = shaders.iter().map(|s| s.stage).collect();
        validate_stage_list(self.kind, &stages)?;
        match self.kind {
            PipelineKind::Graphics => {
                let pass = pass.context("Graphics pipeline recreation requires a render pass")?;
                self.destroy(device);
                *self = Self::create_graphics(device, arena, pass, shaders)?;
            }
            PipelineKind::Compute => {
                self.destroy(device);
                *self = Self::create_compute(device, arena, shaders[0])?;
            }
        }
        Ok(())
    }

    fn create_layout(device: &RenderDevice, arena: &DescriptorArena) -> Result<vk::PipelineLayout> {
        let set_layouts = arena.layouts();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(arena.push_constant_ranges());

        unsafe {
            device
                .device
                .create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")
        }
    }

    fn create_graphics_raw(
        device: &RenderDevice,
        layout: vk::PipelineLayout,
        pass: &RenderPass,
        shaders: &[&Shader],
    ) -> Result<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> =
            shaders.iter().map(|s| s.stage_info()).collect();

        // Position, normal, uv as separate streams
        let binding_descriptions = [
            vk::VertexInputBindingDescription {
                binding: 0,
                stride: 12,
                input_rate: vk::VertexInputRate::VERTEX,
            },
            vk::VertexInputBindingDescription {
                binding: 1,
                stride: 12,
                input_rate: vk::VertexInputRate::VERTEX,
            },
            vk::VertexInputBindingDescription {
                binding: 2,
                stride: 8,
                input_rate: vk::VertexInputRate::VERTEX,
            },
        ];
        let attribute_descriptions = [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only; the actual rects are set at record time
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(pass.samples)
            .sample_shading_enable(pass.multisampling)
            .min_sample_shading(if pass.multisampling { 0.2 } else { 1.0 });

        let blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .build();
        let blend_attachments = [blend_attachment];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(pass.raw)
            .subpass(0);
        if pass.depth_test {
            pipeline_info = pipeline_info.depth_stencil_state(&depth_stencil);
        }

        let pipelines = unsafe {
            device.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info.build()],
                None,
            )
        }
        .map_err(|(_, e)| e)
        .context("Failed to create graphics pipeline")?;

        Ok(pipelines[0])
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        unsafe {
            if self.raw != vk::Pipeline::null() {
                device.device.destroy_pipeline(self.raw, None);
                self.raw = vk::Pipeline::null();
            }
            if self.layout != vk::PipelineLayout::null() {
                device.device.destroy_pipeline_layout(self.layout, None);
                self.layout = vk::PipelineLayout::null();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_accepts_vertex_fragment() {
        let stages = [ShaderStage::Vertex, ShaderStage::Fragment];
        assert!(validate_stage_list(PipelineKind::Graphics, &stages).is_ok());
    }

    #[test]
    fn graphics_rejects_compute_stage() {
        let stages = [ShaderStage::Vertex, ShaderStage::Compute];
        assert!(validate_stage_list(PipelineKind::Graphics, &stages).is_err());
    }

    #[test]
    fn graphics_rejects_empty_stage_list() {
        assert!(validate_stage_list(PipelineKind::Graphics, &[]).is_err());
    }

    #[test]
    fn compute_requires_exactly_one_compute_stage() {
        assert!(validate_stage_list(PipelineKind::Compute, &[ShaderStage::Compute]).is_ok());
        assert!(validate_stage_list(PipelineKind::Compute, &[ShaderStage::Vertex]).is_err());
        assert!(validate_stage_list(
            PipelineKind::Compute,
            &[ShaderStage::Compute, ShaderStage::Compute]
        )
        .is_err());
        assert!(validate_stage_list(PipelineKind::Compute, &[]).is_err());
    }
}
