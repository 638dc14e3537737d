// Simulated device and surface for tests
//
// Handles are fabricated from a counter. The graphics queue is modelled as
// an in-order list of submissions: waiting on a fence completes everything
// up to the last submission that signals it. Misuse that a real driver would
// turn into a data race or a hang is recorded as a violation instead.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::Arc;

use super::context::GpuContext;
use super::device::{GpuDevice, Submission};
use super::surface::{PresentSurface, SurfaceSupport, SwapchainDesc};

struct SubmitRecord {
    command_buffers: Vec<vk::CommandBuffer>,
    fence: vk::Fence,
    complete: bool,
}

struct MockSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
    acquired: HashSet<u32>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    live: HashMap<u64, &'static str>,
    violations: Vec<String>,

    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, bool>,
    queue: Vec<SubmitRecord>,
    in_flight: HashSet<vk::CommandBuffer>,

    swapchains: HashMap<vk::SwapchainKHR, MockSwapchain>,
    swapchains_created: usize,
    last_swapchain: Option<SwapchainDesc>,
    scripted_images: VecDeque<u32>,

    capabilities: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    surface_released: bool,

    stale_acquires: u32,
    stale_presents: u32,
    suboptimal_presents: u32,
    fail_submits: u32,
    fail_allocations: u32,

    submissions: usize,
    presents: Vec<u32>,
    wait_idle_calls: usize,
    render_passes_recorded: usize,
    last_render_pass_attachments: Option<u32>,
}

pub struct MockGpu {
    state: Mutex<State>,
    idle_gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl MockGpu {
    /// Surface reporting 2 images minimum (the engine asks for 3), FIFO +
    /// MAILBOX, any extent.
    pub fn new() -> Arc<Self> {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
        };
        let state = State {
            next_handle: 0x1000,
            capabilities,
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            ..Default::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
            idle_gate: Mutex::new(None),
        })
    }

    /// `min_image_count` is what the engine asks for minus one.
    pub fn with_min_image_count(self: Arc<Self>, count: u32) -> Arc<Self> {
        self.state.lock().capabilities.min_image_count = count;
        self
    }

    pub fn context(self: &Arc<Self>) -> GpuContext {
        GpuContext::new(self.clone())
    }

    fn next_raw(state: &mut State, kind: &'static str) -> u64 {
        state.next_handle += 1;
        let raw = state.next_handle;
        state.live.insert(raw, kind);
        raw
    }

    fn release_raw(state: &mut State, raw: u64, kind: &'static str) {
        match state.live.remove(&raw) {
            Some(found) if found == kind => {}
            Some(found) => state
                .violations
                .push(format!("destroyed {} {:#x} as {}", found, raw, kind)),
            None => state
                .violations
                .push(format!("destroyed unknown or freed {} {:#x}", kind, raw)),
        }
    }

    /// Complete every submission up to and including `last`.
    fn retire_through(state: &mut State, last: usize) {
        for index in 0..=last {
            if state.queue[index].complete {
                continue;
            }
            state.queue[index].complete = true;
            let fence = state.queue[index].fence;
            if fence != vk::Fence::null() {
                state.fences.insert(fence, true);
            }
            for cmd in state.queue[index].command_buffers.clone() {
                state.in_flight.remove(&cmd);
            }
        }
    }

    fn retire_all(state: &mut State) {
        if !state.queue.is_empty() {
            let last = state.queue.len() - 1;
            Self::retire_through(state, last);
        }
    }

    fn check_idle(state: &mut State, cmd: vk::CommandBuffer, what: &str) {
        if state.in_flight.contains(&cmd) {
            state.violations.push(format!(
                "{} command buffer {:#x} while its submission is in flight",
                what,
                cmd.as_raw()
            ));
        }
    }

    // -------------------------------------------------------------------------
    // Fault injection and scripting
    // -------------------------------------------------------------------------

    pub fn stale_acquires(&self, count: u32) {
        self.state.lock().stale_acquires = count;
    }

    pub fn stale_presents(&self, count: u32) {
        self.state.lock().stale_presents = count;
    }

    pub fn suboptimal_presents(&self, count: u32) {
        self.state.lock().suboptimal_presents = count;
    }

    pub fn fail_next_submit(&self) {
        self.state.lock().fail_submits = 1;
    }

    pub fn fail_next_allocation(&self) {
        self.state.lock().fail_allocations = 1;
    }

    /// Image indices handed out by upcoming acquires, before falling back to
    /// round robin.
    pub fn script_acquires(&self, indices: &[u32]) {
        self.state.lock().scripted_images.extend(indices.iter().copied());
    }

    /// Make the surface report a fixed extent, as most platforms do.
    pub fn set_current_extent(&self, width: u32, height: u32) {
        self.state.lock().capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().formats = formats;
    }

    /// The next `wait_idle` blocks until the returned sender fires. The
    /// receiver fires once the call has entered.
    pub fn gate_wait_idle(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.idle_gate.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Objects created and not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_of_kind(&self, kind: &str) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.iter().filter(|s| !s.complete).count()
    }

    /// Image indices in the order they were presented.
    pub fn presented(&self) -> Vec<u32> {
        self.state.lock().presents.clone()
    }

    pub fn swapchains_created(&self) -> usize {
        self.state.lock().swapchains_created
    }

    pub fn last_swapchain(&self) -> Option<SwapchainDesc> {
        self.state.lock().last_swapchain
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.state.lock().wait_idle_calls
    }

    pub fn render_passes_recorded(&self) -> usize {
        self.state.lock().render_passes_recorded
    }

    pub fn last_render_pass_attachments(&self) -> Option<u32> {
        self.state.lock().last_render_pass_attachments
    }

    pub fn surface_released(&self) -> bool {
        self.state.lock().surface_released
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }
}

impl GpuDevice for MockGpu {
    fn graphics_queue(&self) -> vk::Queue {
        vk::Queue::from_raw(0x10)
    }

    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn wait_idle(&self) -> VkResult<()> {
        let gate = self.idle_gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        let mut state = self.state.lock();
        state.wait_idle_calls += 1;
        Self::retire_all(&mut state);
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        let mut state = self.state.lock();
        Self::retire_all(&mut state);
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(Self::next_raw(&mut state, "semaphore"));
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        state.semaphores.remove(&semaphore);
        Self::release_raw(&mut state, semaphore.as_raw(), "semaphore");
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(Self::next_raw(&mut state, "fence"));
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        let pending = state
            .queue
            .iter()
            .any(|s| !s.complete && s.fence == fence);
        if pending {
            state
                .violations
                .push(format!("destroyed fence {:#x} with pending work", fence.as_raw()));
        }
        state.fences.remove(&fence);
        Self::release_raw(&mut state, fence.as_raw(), "fence");
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        match state.fences.get(&fence).copied() {
            None => {
                state
                    .violations
                    .push(format!("waited on unknown fence {:#x}", fence.as_raw()));
                Err(vk::Result::ERROR_DEVICE_LOST)
            }
            Some(true) => Ok(()),
            Some(false) => {
                let last = state
                    .queue
                    .iter()
                    .rposition(|s| !s.complete && s.fence == fence);
                match last {
                    Some(last) => {
                        Self::retire_through(&mut state, last);
                        Ok(())
                    }
                    None => {
                        state.violations.push(format!(
                            "waited on fence {:#x} that will never signal",
                            fence.as_raw()
                        ));
                        Err(vk::Result::TIMEOUT)
                    }
                }
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let pending = state
            .queue
            .iter()
            .any(|s| !s.complete && s.fence == fence);
        if pending {
            state
                .violations
                .push(format!("reset fence {:#x} with pending work", fence.as_raw()));
        }
        state.fences.insert(fence, false);
        Ok(())
    }

    fn create_command_pool(&self, _flags: vk::CommandPoolCreateFlags) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        Ok(vk::CommandPool::from_raw(Self::next_raw(&mut state, "command pool")))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        Self::release_raw(&mut state, pool.as_raw(), "command pool");
    }

    fn allocate_command_buffer(
        &self,
        _pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state.lock();
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        Ok(vk::CommandBuffer::from_raw(Self::next_raw(
            &mut state,
            "command buffer",
        )))
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state.lock();
        Self::check_idle(&mut state, command_buffer, "freed");
        Self::release_raw(&mut state, command_buffer.as_raw(), "command buffer");
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        Self::check_idle(&mut state, command_buffer, "began");
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        Self::check_idle(&mut state, command_buffer, "reset");
        Ok(())
    }

    fn cmd_begin_render_pass(&self, _command_buffer: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        let mut state = self.state.lock();
        state.render_passes_recorded += 1;
        if !state.live.contains_key(&info.framebuffer.as_raw()) {
            state.violations.push(format!(
                "render pass begun on dead framebuffer {:#x}",
                info.framebuffer.as_raw()
            ));
        }
    }

    fn cmd_end_render_pass(&self, _command_buffer: vk::CommandBuffer) {}

    fn queue_submit(&self, _queue: vk::Queue, submission: &Submission<'_>, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if state.fail_submits > 0 {
            state.fail_submits -= 1;
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        for &cmd in submission.command_buffers {
            Self::check_idle(&mut state, cmd, "submitted");
        }
        for &semaphore in submission.wait_semaphores {
            if state.semaphores.insert(semaphore, false) != Some(true) {
                state.violations.push(format!(
                    "submission waits on unsignaled semaphore {:#x}",
                    semaphore.as_raw()
                ));
            }
        }
        for &semaphore in submission.signal_semaphores {
            state.semaphores.insert(semaphore, true);
        }
        if fence != vk::Fence::null() && state.fences.get(&fence) == Some(&true) {
            state
                .violations
                .push(format!("submitted with signaled fence {:#x}", fence.as_raw()));
        }

        state.in_flight.extend(submission.command_buffers.iter().copied());
        state.queue.push(SubmitRecord {
            command_buffers: submission.command_buffers.to_vec(),
            fence,
            complete: false,
        });
        state.submissions += 1;
        Ok(())
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        state.last_render_pass_attachments = Some(info.attachment_count);
        Ok(vk::RenderPass::from_raw(Self::next_raw(&mut state, "render pass")))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state.lock();
        Self::release_raw(&mut state, render_pass.as_raw(), "render pass");
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        Ok(vk::Framebuffer::from_raw(Self::next_raw(&mut state, "framebuffer")))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        Self::release_raw(&mut state, framebuffer.as_raw(), "framebuffer");
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        Ok(vk::ImageView::from_raw(Self::next_raw(&mut state, "image view")))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        Self::release_raw(&mut state, view.as_raw(), "image view");
    }

    fn depth_format(&self) -> vk::Format {
        vk::Format::D32_SFLOAT
    }

    fn create_attachment_image(
        &self,
        _extent: vk::Extent2D,
        _format: vk::Format,
        _usage: vk::ImageUsageFlags,
    ) -> VkResult<vk::Image> {
        let mut state = self.state.lock();
        Ok(vk::Image::from_raw(Self::next_raw(&mut state, "attachment image")))
    }

    fn destroy_attachment_image(&self, image: vk::Image) {
        let mut state = self.state.lock();
        Self::release_raw(&mut state, image.as_raw(), "attachment image");
    }
}

impl PresentSurface for MockGpu {
    fn support(&self) -> VkResult<SurfaceSupport> {
        let state = self.state.lock();
        if state.surface_released {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        Ok(SurfaceSupport {
            capabilities: state.capabilities,
            formats: state.formats.clone(),
            present_modes: state.present_modes.clone(),
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        if state.surface_released {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        let swapchain = vk::SwapchainKHR::from_raw(Self::next_raw(&mut state, "swapchain"));
        let images = (0..desc.min_image_count)
            .map(|i| vk::Image::from_raw(0x100_0000 + (swapchain.as_raw() << 4) + u64::from(i)))
            .collect();
        state.swapchains.insert(
            swapchain,
            MockSwapchain {
                images,
                next_image: 0,
                acquired: HashSet::new(),
            },
        );
        state.swapchains_created += 1;
        state.last_swapchain = Some(*desc);
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let state = self.state.lock();
        state
            .swapchains
            .get(&swapchain)
            .map(|s| s.images.clone())
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain);
        Self::release_raw(&mut state, swapchain.as_raw(), "swapchain");
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if state.stale_acquires > 0 {
            state.stale_acquires -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if state.semaphores.get(&semaphore) == Some(&true) {
            state.violations.push(format!(
                "acquire signals semaphore {:#x} that is already signaled",
                semaphore.as_raw()
            ));
        }

        let scripted = state.scripted_images.pop_front();
        let Some(chain) = state.swapchains.get_mut(&swapchain) else {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        };
        let count = chain.images.len() as u32;
        let index = match scripted {
            Some(index) => index % count,
            None => {
                let index = chain.next_image;
                chain.next_image = (index + 1) % count;
                index
            }
        };
        let reacquired = !chain.acquired.insert(index);
        if reacquired {
            state
                .violations
                .push(format!("image {} acquired twice without present", index));
        }
        state.semaphores.insert(semaphore, true);
        Ok((index, false))
    }

    fn present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        if state.semaphores.insert(wait_semaphore, false) != Some(true) {
            state.violations.push(format!(
                "present waits on unsignaled semaphore {:#x}",
                wait_semaphore.as_raw()
            ));
        }
        let was_acquired = state
            .swapchains
            .get_mut(&swapchain)
            .is_some_and(|chain| chain.acquired.remove(&image_index));
        if !was_acquired {
            state
                .violations
                .push(format!("presented image {} that was not acquired", image_index));
        }
        state.presents.push(image_index);

        if state.stale_presents > 0 {
            state.stale_presents -= 1;
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if state.suboptimal_presents > 0 {
            state.suboptimal_presents -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn release(&self) {
        self.state.lock().surface_released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_wait_completes_in_queue_order() {
        let mock = MockGpu::new();
        let queue = mock.graphics_queue();
        let first = mock.create_fence(false).unwrap();
        let second = mock.create_fence(false).unwrap();

        mock.queue_submit(queue, &Submission::default(), first).unwrap();
        mock.queue_submit(queue, &Submission::default(), second).unwrap();
        assert_eq!(mock.pending_submissions(), 2);

        mock.wait_for_fence(second, u64::MAX).unwrap();
        assert!(mock.fence_signaled(first));
        assert_eq!(mock.pending_submissions(), 0);
    }

    #[test]
    fn waiting_on_an_orphan_fence_is_flagged() {
        let mock = MockGpu::new();
        let fence = mock.create_fence(false).unwrap();
        assert_eq!(mock.wait_for_fence(fence, 0), Err(vk::Result::TIMEOUT));
        assert_eq!(mock.violations().len(), 1);
    }

    #[test]
    fn re_recording_in_flight_buffer_is_flagged() {
        let mock = MockGpu::new();
        let pool = mock
            .create_command_pool(vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cmd = mock
            .allocate_command_buffer(pool, vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        let fence = mock.create_fence(false).unwrap();
        let buffers = [cmd];
        let submission = Submission {
            command_buffers: &buffers,
            ..Default::default()
        };
        mock.queue_submit(mock.graphics_queue(), &submission, fence)
            .unwrap();

        mock.reset_command_buffer(cmd).unwrap();
        assert_eq!(mock.violations().len(), 1);

        mock.wait_for_fence(fence, u64::MAX).unwrap();
        mock.reset_command_buffer(cmd).unwrap();
        assert_eq!(mock.violations().len(), 1);
    }
}
