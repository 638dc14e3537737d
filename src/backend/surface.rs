// Presentation surface
//
// The window-system side of presentation: surface queries, swapchain
// creation, acquire and present. The frame-pacing engine only talks to
// `PresentSurface`; `VulkanSurface` is the ash implementation.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::VulkanDevice;

/// What the surface supports on the selected GPU.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Parameters for one swapchain, already resolved against `SurfaceSupport`.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

pub trait PresentSurface: Send + Sync {
    fn support(&self) -> VkResult<SurfaceSupport>;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Returns the image index and whether the swapchain is suboptimal.
    /// `ERROR_OUT_OF_DATE_KHR` means the swapchain must be recreated.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    /// Returns whether the swapchain is suboptimal.
    fn present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;

    /// Destroy the surface binding. Safe to call more than once.
    fn release(&self);
}

pub struct VulkanSurface {
    surface: Mutex<vk::SurfaceKHR>,
    surface_loader: ash::extensions::khr::Surface,
    swapchain_loader: ash::extensions::khr::Swapchain,
    device: Arc<VulkanDevice>,
}

impl VulkanSurface {
    pub fn new(
        device: Arc<VulkanDevice>,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        let surface = unsafe {
            ash_window::create_surface(&device.entry, &device.instance, display, window, None)
        }
        .context("Failed to create window surface")?;

        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);
        let swapchain_loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let family = super::GpuDevice::graphics_queue_family(device.as_ref());
        let supported = unsafe {
            surface_loader.get_physical_device_surface_support(device.physical_device, family, surface)
        }
        .unwrap_or(false);
        if !supported {
            unsafe { surface_loader.destroy_surface(surface, None) };
            anyhow::bail!("Graphics queue family {} cannot present to this surface", family);
        }

        Ok(Arc::new(Self {
            surface: Mutex::new(surface),
            surface_loader,
            swapchain_loader,
            device,
        }))
    }

    fn handle(&self) -> VkResult<vk::SurfaceKHR> {
        let surface = *self.surface.lock();
        if surface == vk::SurfaceKHR::null() {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        Ok(surface)
    }
}

impl PresentSurface for VulkanSurface {
    fn support(&self) -> VkResult<SurfaceSupport> {
        let surface = self.handle()?;
        let physical_device = self.device.physical_device;
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.handle()?)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(desc.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(desc.composite_alpha)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);

        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, vk::Fence::null())
        }
    }

    fn present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    fn release(&self) {
        let mut surface = self.surface.lock();
        if *surface != vk::SurfaceKHR::null() {
            log::info!("Destroying window surface");
            unsafe { self.surface_loader.destroy_surface(*surface, None) };
            *surface = vk::SurfaceKHR::null();
        }
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        self.release();
    }
}
