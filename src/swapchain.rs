// Swapchain management
//
// The swapchain is rebuilt whenever the surface goes stale; everything that
// depends on its images (render-pass attachments, framebuffers) is rebuilt
// by the owner afterwards.

use anyhow::{Context, Result};
use ash::vk;
use glam::IVec2;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::device::RenderDevice;
use crate::image;

/// Surface health as reported by acquire/present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Optimal,
    Suboptimal,
    OutOfDate,
}

pub struct Surface {
    pub loader: ash::extensions::khr::Surface,
    pub raw: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(
        device: &RenderDevice,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Self> {
        let loader = ash::extensions::khr::Surface::new(device.entry(), &device.instance);
        let raw = unsafe {
            ash_window::create_surface(device.entry(), &device.instance, display, window, None)
        }
        .context("Failed to create window surface")?;
        Ok(Self { loader, raw })
    }

    pub fn destroy(&mut self) {
        if self.raw != vk::SurfaceKHR::null() {
            unsafe { self.loader.destroy_surface(self.raw, None) };
            self.raw = vk::SurfaceKHR::null();
        }
    }
}

pub struct Swapchain {
    loader: ash::extensions::khr::Swapchain,
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        device: &RenderDevice,
        surface: &Surface,
        framebuffer_size: IVec2,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);
        let mut swapchain = Self {
            loader,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
        };
        swapchain.create(device, surface, framebuffer_size, preferred_present_mode)?;
        Ok(swapchain)
    }

    fn create(
        &mut self,
        device: &RenderDevice,
        surface: &Surface,
        framebuffer_size: IVec2,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<()> {
        let supports_present = unsafe {
            surface.loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface.raw,
            )
        }
        .context("Failed to query surface support")?;
        anyhow::ensure!(
            supports_present,
            "Graphics queue family cannot present to this surface"
        );

        let capabilities = unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(device.physical_device, surface.raw)
        }
        .context("Failed to query surface capabilities")?;
        let formats = unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(device.physical_device, surface.raw)
        }
        .context("Failed to query surface formats")?;
        let present_modes = unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(device.physical_device, surface.raw)
        }
        .context("Failed to query present modes")?;

        let format = Self::choose_format(&formats)?;
        let present_mode = Self::choose_present_mode(&present_modes, preferred_present_mode);
        let extent = Self::choose_extent(&capabilities, framebuffer_size);

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?} ({} images)",
            extent.width,
            extent.height,
            format.format,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.raw)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        self.swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;
        self.format = format;
        self.extent = extent;

        self.images = unsafe { self.loader.get_swapchain_images(self.swapchain) }
            .context("Failed to get swapchain images")?;
        self.image_views = self
            .images
            .iter()
            .map(|&img| {
                image::create_view(device, img, format.format, vk::ImageAspectFlags::COLOR, 1)
            })
            .collect::<Result<_>>()?;

        Ok(())
    }

    fn choose_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
        formats
            .iter()
            .copied()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first().copied())
            .context("Surface reports no formats")
    }

    // FIFO is the only mode Vulkan guarantees
    fn choose_present_mode(
        available: &[vk::PresentModeKHR],
        preferred: vk::PresentModeKHR,
    ) -> vk::PresentModeKHR {
        if available.contains(&preferred) {
            preferred
        } else if available.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        }
    }

    fn choose_extent(
        capabilities: &vk::SurfaceCapabilitiesKHR,
        framebuffer_size: IVec2,
    ) -> vk::Extent2D {
        if capabilities.current_extent.width != u32::MAX {
            return capabilities.current_extent;
        }
        vk::Extent2D {
            width: (framebuffer_size.x.max(0) as u32).clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: (framebuffer_size.y.max(0) as u32).clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire the next presentable image. A stale surface comes back as
    /// `OutOfDate` with an unusable index; the caller must skip the frame.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, SwapchainState)> {
        match unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        } {
            Ok((index, false)) => Ok((index, SwapchainState::Optimal)),
            Ok((index, true)) => Ok((index, SwapchainState::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((0, SwapchainState::OutOfDate)),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<SwapchainState> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(SwapchainState::Optimal),
            Ok(true) => Ok(SwapchainState::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SwapchainState::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    /// Tear down and rebuild against the current surface state. The caller
    /// must have waited for device idle first.
    pub fn recreate(
        &mut self,
        device: &RenderDevice,
        surface: &Surface,
        framebuffer_size: IVec2,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<()> {
        self.destroy(device);
        self.create(device, surface, framebuffer_size, preferred_present_mode)
    }

    pub fn destroy(&mut self, device: &RenderDevice) {
        unsafe {
            for view in self.image_views.drain(..) {
                device.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}
