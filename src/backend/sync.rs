// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// One set per frame in flight; they survive swapchain recreation.

use ash::prelude::VkResult;
use ash::vk;

use super::GpuDevice;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signaled by acquire, waited on by the frame's submission.
    pub image_available: vk::Semaphore,
    /// Signaled by the submission, waited on by present.
    pub render_finished: vk::Semaphore,
    /// Signaled when the frame's GPU work completes.
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &dyn GpuDevice) -> VkResult<Self> {
        let image_available = device.create_semaphore()?;
        let render_finished = match device.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                device.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        // Start signaled so the first wait on this slot returns immediately
        let in_flight_fence = match device.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_semaphore(image_available);
                device.destroy_semaphore(render_finished);
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    /// Swap in a fresh acquire semaphore. Used when an acquired image is
    /// abandoned and the old semaphore is left signaled with no waiter.
    pub fn replace_image_available(&mut self, device: &dyn GpuDevice) -> VkResult<()> {
        let fresh = device.create_semaphore()?;
        device.destroy_semaphore(self.image_available);
        self.image_available = fresh;
        Ok(())
    }

    /// Swap in a fresh, signaled fence. Used when the old one was reset but
    /// the submission meant to signal it never reached the queue.
    pub fn replace_in_flight_fence(&mut self, device: &dyn GpuDevice) -> VkResult<()> {
        let fresh = device.create_fence(true)?;
        device.destroy_fence(self.in_flight_fence);
        self.in_flight_fence = fresh;
        Ok(())
    }

    pub fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight_fence);
    }
}
