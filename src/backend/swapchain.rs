// Swapchain - frame pacing and window presentation
//
// Owns the chain of images we render to and present, the per-image
// framebuffers and command buffers, and F frames-in-flight of sync objects.
//
// Frame loop:
//   begin_frame  wait slot fence -> acquire image -> hand out its command buffer
//   end_frame    wait image fence -> submit -> present -> next slot
//
// F (frames in flight) bounds how far the CPU runs ahead of the GPU. The
// chain has K images, and K may be larger than F, so each image also
// remembers the fence of the last frame that used it.

use ash::vk;
use glam::Vec4;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::command::{CommandBuffer, CommandBufferOp, CommandBufferState};
use super::context::GpuContext;
use super::device::Submission;
use super::error::{CommandBufferError, FrameError, FrameResult};
use super::render_pass::{full_area, RenderPass, RenderPassSpec};
use super::surface::{PresentSurface, SwapchainDesc};
use super::sync::FrameSync;
use crate::ownership::{Ref, RefCount};

pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    FrameAcquired,
    Recreating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    Rebuilt,
    /// Another recreation was running; nothing was done.
    AlreadyInProgress,
    /// Zero-sized surface; rebuilt on the next non-zero resize.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct SwapchainConfig {
    pub frames_in_flight: usize,
    pub vsync: bool,
    pub clear_color: Vec4,
    /// Give every framebuffer a shared depth attachment.
    pub depth: bool,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            vsync: true,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            depth: false,
        }
    }
}

// =============================================================================
// SURFACE CHOICES
// =============================================================================

/// Prefer BGRA8 UNORM + sRGB non-linear. A lone UNDEFINED entry means the
/// surface takes anything.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match formats {
        [] => None,
        [only] if only.format == vk::Format::UNDEFINED => Some(preferred),
        _ => formats
            .iter()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .or_else(|| formats.first())
            .copied(),
    }
}

// MAILBOX: No vsync, no tearing, triple buffered
// IMMEDIATE: No vsync, lowest latency, may tear
// FIFO: Vsync enabled, guaranteed available
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, so acquire never waits on the driver.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

pub fn choose_image_usage(caps: &vk::SurfaceCapabilitiesKHR) -> vk::ImageUsageFlags {
    let transfer = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
    vk::ImageUsageFlags::COLOR_ATTACHMENT | (caps.supported_usage_flags & transfer)
}

pub fn choose_pre_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub fn choose_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&alpha| caps.supported_composite_alpha.contains(alpha))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
    }
}

// =============================================================================
// SWAPCHAIN
// =============================================================================

/// Everything rebuilt on recreation.
struct ImageSet {
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    depth: Option<(vk::Image, vk::ImageView)>,
    framebuffers: Vec<vk::Framebuffer>,
    command_buffers: Vec<Ref<CommandBuffer>>,
    /// Fence of the last frame that rendered into each image.
    images_in_flight: Vec<vk::Fence>,
}

impl ImageSet {
    fn new(swapchain: vk::SwapchainKHR, format: vk::SurfaceFormatKHR, extent: vk::Extent2D) -> Self {
        Self {
            swapchain,
            format,
            extent,
            images: Vec::new(),
            views: Vec::new(),
            depth: None,
            framebuffers: Vec::new(),
            command_buffers: Vec::new(),
            images_in_flight: Vec::new(),
        }
    }
}

struct Inner {
    state: FrameState,
    width: u32,
    height: u32,
    minimized: bool,
    suboptimal: bool,
    destroyed: bool,

    images: Option<ImageSet>,
    render_pass: Ref<RenderPass>,
    command_pool: vk::CommandPool,
    frames: Vec<FrameSync>,
    current_frame: usize,
    current_image: u32,
}

/// Holds the recreation flag for as long as it lives.
struct RecreateGuard<'a>(&'a AtomicBool);

impl<'a> RecreateGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RecreateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Swapchain {
    ref_count: RefCount,
    context: GpuContext,
    surface: Arc<dyn PresentSurface>,
    config: SwapchainConfig,
    recreating: AtomicBool,
    inner: Mutex<Inner>,
    /// Pool for `submit_immediate` only, locked apart from `inner`.
    immediate_pool: Mutex<vk::CommandPool>,
}

crate::impl_ref_counted!(Swapchain, ref_count);

impl Swapchain {
    /// Build the image chain and all frame-sync objects. Starts `Idle`.
    pub fn create(
        context: &GpuContext,
        surface: Arc<dyn PresentSurface>,
        width: u32,
        height: u32,
        config: SwapchainConfig,
    ) -> FrameResult<Ref<Self>> {
        log::info!(
            "Creating swapchain: {}x{} (vsync: {}, frames in flight: {})",
            width,
            height,
            config.vsync,
            config.frames_in_flight
        );
        let device = context.device();
        let frames_in_flight = config.frames_in_flight.max(1);

        let command_pool = device
            .create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .map_err(FrameError::creation("command pool"))?;
        let immediate_pool = match device.create_command_pool(vk::CommandPoolCreateFlags::TRANSIENT) {
            Ok(pool) => pool,
            Err(result) => {
                device.destroy_command_pool(command_pool);
                return Err(FrameError::Creation {
                    what: "command pool",
                    result,
                });
            }
        };

        let mut frames = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            match FrameSync::new(device) {
                Ok(frame) => frames.push(frame),
                Err(result) => {
                    frames.iter().for_each(|frame| frame.destroy(device));
                    device.destroy_command_pool(immediate_pool);
                    device.destroy_command_pool(command_pool);
                    return Err(FrameError::Creation {
                        what: "frame sync objects",
                        result,
                    });
                }
            }
        }

        // From here on, Drop (cleanup) releases whatever was built
        let swapchain = context.adopt(Self {
            ref_count: RefCount::new(),
            context: context.clone(),
            surface,
            config,
            recreating: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: FrameState::Idle,
                width,
                height,
                minimized: false,
                suboptimal: false,
                destroyed: false,
                images: None,
                render_pass: Ref::null(),
                command_pool,
                frames,
                current_frame: 0,
                current_image: 0,
            }),
            immediate_pool: Mutex::new(immediate_pool),
        });

        {
            let mut inner = swapchain.inner.lock();
            swapchain.build(&mut inner, vk::SwapchainKHR::null())?;
            let image_count = inner.images.as_ref().map_or(0, |set| set.images.len());
            if frames_in_flight > image_count {
                log::warn!(
                    "{} frames in flight but only {} swapchain images",
                    frames_in_flight,
                    image_count
                );
            }
        }

        Ok(swapchain)
    }

    fn build(&self, inner: &mut Inner, old_swapchain: vk::SwapchainKHR) -> FrameResult<()> {
        let support = self
            .surface
            .support()
            .map_err(FrameError::creation("surface support query"))?;
        let caps = &support.capabilities;

        let format = choose_surface_format(&support.formats).ok_or(FrameError::Creation {
            what: "surface format",
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        })?;
        let present_mode = choose_present_mode(&support.present_modes, self.config.vsync);
        let extent = choose_extent(caps, inner.width, inner.height);

        let desc = SwapchainDesc {
            min_image_count: choose_image_count(caps),
            format,
            extent,
            usage: choose_image_usage(caps),
            pre_transform: choose_pre_transform(caps),
            composite_alpha: choose_composite_alpha(caps),
            present_mode,
            old_swapchain,
        };
        let handle = self
            .surface
            .create_swapchain(&desc)
            .map_err(FrameError::creation("swapchain"))?;

        let mut set = ImageSet::new(handle, format, extent);
        let render_pass = match self.populate(&mut set, inner.command_pool) {
            Ok(render_pass) => render_pass,
            Err(e) => {
                let swapchain = self.release_image_set(set);
                self.surface.destroy_swapchain(swapchain);
                return Err(e);
            }
        };

        log::info!(
            "Created swapchain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            set.images.len(),
            format.format,
            present_mode
        );

        inner.render_pass = render_pass;
        inner.images = Some(set);
        Ok(())
    }

    /// Views, render pass, depth, framebuffers and command buffers for a
    /// freshly created chain. On error, `set` holds what was built so far.
    fn populate(&self, set: &mut ImageSet, command_pool: vk::CommandPool) -> FrameResult<Ref<RenderPass>> {
        let device = self.context.device();

        set.images = self
            .surface
            .swapchain_images(set.swapchain)
            .map_err(FrameError::creation("swapchain images"))?;

        for &image in &set.images {
            let view = device
                .create_image_view(image, set.format.format, vk::ImageAspectFlags::COLOR)
                .map_err(FrameError::creation("image view"))?;
            set.views.push(view);
        }

        let mut spec = RenderPassSpec::presentable(set.format.format, set.extent)
            .with_clear_color(self.config.clear_color);
        spec.debug_name = "swapchain".to_string();

        if self.config.depth {
            let depth_format = device.depth_format();
            spec = spec.with_depth(depth_format);

            let image = device
                .create_attachment_image(
                    set.extent,
                    depth_format,
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                )
                .map_err(FrameError::creation("depth image"))?;
            set.depth = Some((image, vk::ImageView::null()));
            let view = device
                .create_image_view(image, depth_format, depth_aspect(depth_format))
                .map_err(FrameError::creation("depth image view"))?;
            set.depth = Some((image, view));
        }

        let render_pass =
            RenderPass::new(&self.context, spec).map_err(FrameError::creation("render pass"))?;

        for &view in &set.views {
            let mut attachments = vec![view];
            if let Some((_, depth_view)) = set.depth {
                attachments.push(depth_view);
            }
            let framebuffer = device
                .create_framebuffer(render_pass.handle(), &attachments, set.extent)
                .map_err(FrameError::creation("framebuffer"))?;
            set.framebuffers.push(framebuffer);
        }

        for _ in 0..set.images.len() {
            set.command_buffers
                .push(CommandBuffer::allocated(&self.context, command_pool, true)?);
        }

        set.images_in_flight = vec![vk::Fence::null(); set.images.len()];
        Ok(render_pass)
    }

    /// Destroy everything in `set` except the swapchain handle, which is
    /// returned so it can be retired into the next chain.
    fn release_image_set(&self, set: ImageSet) -> vk::SwapchainKHR {
        let device = self.context.device();

        // Callers may still hold clones; free the native buffers regardless
        for command_buffer in &set.command_buffers {
            command_buffer.free();
        }
        for &framebuffer in &set.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        for &view in &set.views {
            device.destroy_image_view(view);
        }
        if let Some((image, view)) = set.depth {
            if view != vk::ImageView::null() {
                device.destroy_image_view(view);
            }
            device.destroy_attachment_image(image);
        }
        set.swapchain
    }

    // -------------------------------------------------------------------------
    // Frame loop
    // -------------------------------------------------------------------------

    /// Acquire the next image. `Ok(false)` means skip this frame: a
    /// recreation is running, the surface is zero-sized, or it went stale and
    /// was rebuilt.
    pub fn begin_frame(&self) -> FrameResult<bool> {
        if self.recreating.load(Ordering::Acquire) {
            log::debug!("Swapchain is being recreated, skipping frame");
            return Ok(false);
        }

        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(FrameError::Destroyed);
        }
        if inner.state != FrameState::Idle {
            return Err(FrameError::InvalidState {
                call: "begin_frame",
                state: inner.state,
            });
        }
        if inner.minimized {
            return Ok(false);
        }

        let device = self.context.device();
        let frame = inner.frames[inner.current_frame];
        let Some(swapchain) = inner.images.as_ref().map(|set| set.swapchain) else {
            return Err(FrameError::InvalidState {
                call: "begin_frame",
                state: inner.state,
            });
        };

        // Never more than F frames ahead of the GPU
        device
            .wait_for_fence(frame.in_flight_fence, u64::MAX)
            .map_err(FrameError::FenceWait)?;

        let image_index =
            match self
                .surface
                .acquire_next_image(swapchain, u64::MAX, frame.image_available)
            {
                Ok((index, suboptimal)) => {
                    inner.suboptimal |= suboptimal;
                    index
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::warn!("Swapchain out of date on acquire, recreating");
                    let (width, height) = (inner.width, inner.height);
                    self.recreate_locked(&mut inner, width, height)?;
                    return Ok(false);
                }
                Err(e) => return Err(FrameError::Acquire(e)),
            };

        let Some(set) = inner.images.as_mut() else {
            return Err(FrameError::Destroyed);
        };
        let index = image_index as usize;
        if index >= set.images.len() {
            log::error!(
                "Acquired image {} out of range ({} images)",
                image_index,
                set.images.len()
            );
            return Err(FrameError::Acquire(vk::Result::ERROR_UNKNOWN));
        }

        // The previous frame that rendered to this image must be done before
        // its command buffer is handed out again
        let image_fence = set.images_in_flight[index];
        if image_fence != vk::Fence::null() {
            device
                .wait_for_fence(image_fence, u64::MAX)
                .map_err(FrameError::FenceWait)?;
        }

        let command_buffer = &set.command_buffers[index];
        match command_buffer.state() {
            CommandBufferState::Ready => {}
            CommandBufferState::RecordingEnded | CommandBufferState::Submitted => {
                command_buffer.reset()?;
            }
            _ => {
                // Abandoned mid-recording
                command_buffer.free();
                command_buffer.allocate()?;
            }
        }

        let area = full_area(set.extent);
        inner.render_pass.set_render_area(area);
        inner.current_image = image_index;
        inner.state = FrameState::FrameAcquired;
        Ok(true)
    }

    /// Submit the current image's command buffer and present it. An `Err`
    /// is fatal to the frame loop; staleness is handled here by recreating.
    pub fn end_frame(&self) -> FrameResult<()> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(FrameError::Destroyed);
        }
        if inner.state != FrameState::FrameAcquired {
            return Err(FrameError::InvalidState {
                call: "end_frame",
                state: inner.state,
            });
        }

        let device = self.context.device();
        let queue = device.graphics_queue();
        let frame = inner.frames[inner.current_frame];
        let image_index = inner.current_image;
        let index = image_index as usize;

        let Some(set) = inner.images.as_mut() else {
            return Err(FrameError::Destroyed);
        };
        let command_buffer = set.command_buffers[index].clone();
        let recorded = command_buffer.state();
        if recorded != CommandBufferState::RecordingEnded {
            return Err(CommandBufferError::InvalidTransition {
                state: recorded,
                op: CommandBufferOp::MarkSubmitted,
            }
            .into());
        }

        let image_fence = set.images_in_flight[index];
        if image_fence != vk::Fence::null() {
            device
                .wait_for_fence(image_fence, u64::MAX)
                .map_err(FrameError::FenceWait)?;
        }
        let swapchain = set.swapchain;

        device
            .reset_fence(frame.in_flight_fence)
            .map_err(FrameError::Submit)?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer.handle()];
        let signal_semaphores = [frame.render_finished];
        let submission = Submission {
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            command_buffers: &command_buffers,
            signal_semaphores: &signal_semaphores,
        };
        if let Err(e) = device.queue_submit(queue, &submission, frame.in_flight_fence) {
            log::error!("Failed to submit frame {}: {}", inner.current_frame, e);
            self.discard_unsubmitted_fence(&mut inner, frame.in_flight_fence);
            return Err(FrameError::Submit(e));
        }
        if let Some(set) = inner.images.as_mut() {
            set.images_in_flight[index] = frame.in_flight_fence;
        }
        command_buffer.mark_submitted()?;

        let present = self
            .surface
            .present(queue, swapchain, image_index, frame.render_finished);

        inner.current_frame = (inner.current_frame + 1) % inner.frames.len();
        inner.state = FrameState::Idle;

        let stale = match present {
            Ok(suboptimal) => suboptimal || std::mem::take(&mut inner.suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(FrameError::Present(e)),
        };
        if stale {
            log::warn!("Swapchain out of date on present, recreating");
            let (width, height) = (inner.width, inner.height);
            self.recreate_locked(&mut inner, width, height)?;
        }
        Ok(())
    }

    /// The slot's fence was reset for a submission that never happened, so
    /// nothing will signal it. Give the slot a signaled one and forget the
    /// old handle wherever an image still points at it.
    fn discard_unsubmitted_fence(&self, inner: &mut Inner, fence: vk::Fence) {
        let slot = inner.current_frame;
        if let Err(e) = inner.frames[slot].replace_in_flight_fence(self.context.device()) {
            log::error!("Failed to replace fence for frame {}: {}", slot, e);
            return;
        }
        if let Some(set) = inner.images.as_mut() {
            for image_fence in set.images_in_flight.iter_mut() {
                if *image_fence == fence {
                    *image_fence = vk::Fence::null();
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Recreation and teardown
    // -------------------------------------------------------------------------

    /// Rebuild the image chain for a new size. A call that overlaps a running
    /// recreation does nothing and returns `AlreadyInProgress`.
    pub fn recreate(&self, width: u32, height: u32) -> FrameResult<RecreateOutcome> {
        let Some(_guard) = RecreateGuard::acquire(&self.recreating) else {
            log::warn!("Swapchain recreation already in progress, ignoring request");
            return Ok(RecreateOutcome::AlreadyInProgress);
        };
        let mut inner = self.inner.lock();
        self.rebuild(&mut inner, width, height)
    }

    /// Window size changed. A zero dimension defers the rebuild and makes
    /// `begin_frame` skip until a non-zero size arrives.
    pub fn resize(&self, width: u32, height: u32) -> FrameResult<RecreateOutcome> {
        log::debug!("Resize requested: {}x{}", width, height);
        self.recreate(width, height)
    }

    /// Recreation from inside the frame loop, lock already held.
    fn recreate_locked(&self, inner: &mut Inner, width: u32, height: u32) -> FrameResult<RecreateOutcome> {
        let Some(_guard) = RecreateGuard::acquire(&self.recreating) else {
            log::warn!("Swapchain recreation already in progress, ignoring request");
            return Ok(RecreateOutcome::AlreadyInProgress);
        };
        self.rebuild(inner, width, height)
    }

    fn rebuild(&self, inner: &mut Inner, width: u32, height: u32) -> FrameResult<RecreateOutcome> {
        if inner.destroyed {
            return Err(FrameError::Destroyed);
        }
        inner.width = width;
        inner.height = height;
        if width == 0 || height == 0 {
            log::info!("Surface is zero-sized, deferring swapchain recreation");
            inner.minimized = true;
            return Ok(RecreateOutcome::Deferred);
        }
        inner.minimized = false;

        log::info!("Recreating swapchain: {}x{}", width, height);
        let previous = inner.state;
        inner.state = FrameState::Recreating;
        let result = self.rebuild_image_set(inner, previous);
        inner.state = FrameState::Idle;
        result.map(|_| RecreateOutcome::Rebuilt)
    }

    fn rebuild_image_set(&self, inner: &mut Inner, previous: FrameState) -> FrameResult<()> {
        let device = self.context.device();
        device
            .wait_idle()
            .map_err(FrameError::creation("device idle wait"))?;

        if previous == FrameState::FrameAcquired {
            // The acquired image is abandoned; its semaphore stays signaled
            // with no waiter, so the slot gets a fresh one
            let slot = inner.current_frame;
            inner.frames[slot]
                .replace_image_available(device)
                .map_err(FrameError::creation("acquire semaphore"))?;
        }

        let retired = match inner.images.take() {
            Some(set) => self.release_image_set(set),
            None => vk::SwapchainKHR::null(),
        };
        inner.render_pass.release();
        inner.suboptimal = false;

        let result = self.build(inner, retired);
        if retired != vk::SwapchainKHR::null() {
            self.surface.destroy_swapchain(retired);
        }
        result
    }

    /// Full teardown: image chain, frame sync, command pool and the surface
    /// binding. Terminal and idempotent.
    pub fn cleanup(&self) {
        let device = self.context.device();
        {
            // Never held together with `inner` here; waits out a running
            // `submit_immediate`
            let mut pool = self.immediate_pool.lock();
            if *pool != vk::CommandPool::null() {
                device.destroy_command_pool(*pool);
                *pool = vk::CommandPool::null();
            }
        }

        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        log::info!("Cleaning up swapchain");

        if let Err(e) = device.wait_idle() {
            log::error!("Device wait idle failed during cleanup: {}", e);
        }

        if let Some(set) = inner.images.take() {
            let swapchain = self.release_image_set(set);
            self.surface.destroy_swapchain(swapchain);
        }
        inner.render_pass.release();
        for frame in inner.frames.drain(..) {
            frame.destroy(device);
        }
        device.destroy_command_pool(inner.command_pool);
        inner.command_pool = vk::CommandPool::null();
        self.surface.release();

        inner.destroyed = true;
    }

    /// Record and run one-off GPU work on the graphics queue, blocking until
    /// it completes. Not for per-frame use.
    ///
    /// `record` may call back into this swapchain; only the immediate pool
    /// is locked while it runs.
    pub fn submit_immediate<F>(&self, record: F) -> FrameResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        // Command pools are single-threaded; hold the pool lock throughout
        let pool = self.immediate_pool.lock();
        if *pool == vk::CommandPool::null() {
            return Err(FrameError::Destroyed);
        }
        let command_buffer = CommandBuffer::new(&self.context, *pool, true);
        command_buffer.allocate_and_begin_single_use()?;
        record(command_buffer.handle());
        command_buffer.end_single_use(self.context.device().graphics_queue())?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn state(&self) -> FrameState {
        if self.recreating.load(Ordering::Acquire) {
            return FrameState::Recreating;
        }
        self.inner.lock().state
    }

    pub fn current_frame_index(&self) -> usize {
        self.inner.lock().current_frame
    }

    pub fn current_image_index(&self) -> u32 {
        self.inner.lock().current_image
    }

    pub fn frames_in_flight(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn image_count(&self) -> usize {
        self.inner
            .lock()
            .images
            .as_ref()
            .map_or(0, |set| set.images.len())
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.inner
            .lock()
            .images
            .as_ref()
            .map_or(vk::Extent2D::default(), |set| set.extent)
    }

    pub fn format(&self) -> vk::Format {
        self.inner
            .lock()
            .images
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |set| set.format.format)
    }

    /// The pass every framebuffer was built for. Replaced on recreation.
    pub fn render_pass(&self) -> Ref<RenderPass> {
        self.inner.lock().render_pass.clone()
    }

    /// Command buffer for the image acquired by the last `begin_frame`.
    pub fn current_command_buffer(&self) -> Option<Ref<CommandBuffer>> {
        let inner = self.inner.lock();
        let index = inner.current_image as usize;
        inner
            .images
            .as_ref()
            .and_then(|set| set.command_buffers.get(index).cloned())
    }

    pub fn current_framebuffer(&self) -> Option<vk::Framebuffer> {
        let inner = self.inner.lock();
        let index = inner.current_image as usize;
        inner
            .images
            .as_ref()
            .and_then(|set| set.framebuffers.get(index).copied())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.cleanup();
    }
}
