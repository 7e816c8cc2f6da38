// Render passes and framebuffers
//
// A pass owns its non-presentable attachments (MSAA color, depth) and one
// framebuffer per presentable target view. Attachment count is 1-3 depending
// on multisampling and depth; the presentable attachment is always index 0.
// Targets are described by format, extent, and view list rather than the
// swapchain itself, so rebuilds work against any compatible image set.

use anyhow::{Context, Result};
use ash::vk;
use glam::UVec2;

use crate::device::RenderDevice;
use crate::image::{Image, ImageDesc};

pub struct RenderPass {
    pub raw: vk::RenderPass,
    pub color_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub depth_test: bool,
    pub multisampling: bool,
    pub attachments: Vec<Image>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub clear_values: Vec<vk::ClearValue>,
}

impl RenderPass {
    pub fn new(
        device: &RenderDevice,
        color_format: vk::Format,
        extent: vk::Extent2D,
        target_views: &[vk::ImageView],
        requested_samples: vk::SampleCountFlags,
        depth_test: bool,
        clear_color: [f32; 4],
    ) -> Result<Self> {
        let max_samples = device.max_sample_count();
        let samples = if requested_samples.as_raw() > max_samples.as_raw() {
            log::error!(
                "Requested sample count {:?} exceeds device maximum {:?}, clamping",
                requested_samples,
                max_samples
            );
            max_samples
        } else {
            requested_samples
        };
        let multisampling = samples != vk::SampleCountFlags::TYPE_1;

        let depth_format = if depth_test {
            Some(device.find_depth_format()?)
        } else {
            None
        };

        let mut attachment_descs = Vec::new();
        let mut clear_values = Vec::new();

        // Index 0: the presentable image. With multisampling it is only the
        // resolve target, so its load op is DONT_CARE.
        attachment_descs.push(
            vk::AttachmentDescription::builder()
                .format(color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(if multisampling {
                    vk::AttachmentLoadOp::DONT_CARE
                } else {
                    vk::AttachmentLoadOp::CLEAR
                })
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .build(),
        );
        clear_values.push(vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        });

        let mut msaa_index = None;
        if multisampling {
            msaa_index = Some(attachment_descs.len() as u32);
            attachment_descs.push(
                vk::AttachmentDescription::builder()
                    .format(color_format)
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            });
        }

        let mut depth_index = None;
        if let Some(depth_format) = depth_format {
            depth_index = Some(attachment_descs.len() as u32);
            attachment_descs.push(
                vk::AttachmentDescription::builder()
                    .format(depth_format)
                    .samples(samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .build(),
            );
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        }

        // With multisampling the subpass renders into the MSAA attachment
        // and resolves into index 0; otherwise it renders into 0 directly.
        let color_ref = vk::AttachmentReference {
            attachment: msaa_index.unwrap_or(0),
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let resolve_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = depth_index.map(|attachment| vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });

        let color_refs = [color_ref];
        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        let resolve_refs = [resolve_ref];
        if multisampling {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut dst_access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if depth_test {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            dst_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(dst_access)
            .build();

        let subpasses = [subpass.build()];
        let dependencies = [dependency];
        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachment_descs)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let raw = unsafe { device.device.create_render_pass(&create_info, None) }
            .context("Failed to create render pass")?;

        let mut pass = Self {
            raw,
            color_format,
            samples,
            depth_test,
            multisampling,
            attachments: Vec::new(),
            framebuffers: Vec::new(),
            clear_values,
        };
        pass.create_targets(device, extent, target_views)?;
        Ok(pass)
    }

    /// Create the pass-owned attachment images and one framebuffer per
    /// target view, in attachment-index order.
    fn create_targets(
        &mut self,
        device: &RenderDevice,
        extent: vk::Extent2D,
        target_views: &[vk::ImageView],
    ) -> Result<()> {
        let size = UVec2::new(extent.width, extent.height);

        if self.multisampling {
            self.attachments.push(Image::new(
                device,
                &ImageDesc {
                    name: "msaa color attachment",
                    size,
                    mip_levels: 1,
                    samples: self.samples,
                    format: self.color_format,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                        | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                    aspect: vk::ImageAspectFlags::COLOR,
                },
            )?);
        }
        if self.depth_test {
            self.attachments.push(Image::new(
                device,
                &ImageDesc {
                    name: "depth attachment",
                    size,
                    mip_levels: 1,
                    samples: self.samples,
                    format: device.find_depth_format()?,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                    aspect: vk::ImageAspectFlags::DEPTH,
                },
            )?);
        }

        for &target_view in target_views {
            let mut views = vec![target_view];
            views.extend(self.attachments.iter().map(|a| a.view));

            let create_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.raw)
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { device.device.create_framebuffer(&create_info, None) }
                .context("Failed to create framebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Rebuild attachments and framebuffers against a new target set (for
    /// example a recreated swapchain's views). The pass object itself is
    /// format-stable and survives.
    pub fn recreate_targets(
        &mut self,
        device: &RenderDevice,
        extent: vk::Extent2D,
        target_views: &[vk::ImageView],
    ) -> Result<()> {
        self.destroy_targets(device);
        self.create_targets(device, extent, target_views)
    }

    fn destroy_targets(&mut self, device: &RenderDevice) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                device.device.destroy_framebuffer(framebuffer, None);
            }
        }
        for mut attachment in self.attachments.drain(..) {
            attachment.destroy(device);
        }
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        self.destroy_targets(device);
        if self.raw != vk::RenderPass::null() {
            unsafe { device.device.destroy_render_pass(self.raw, None) };
            self.raw = vk::RenderPass::null();
        }
    }
}
