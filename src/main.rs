// =============================================================================
// VKFRAME DEMO - clear-color frame loop on top of the frame-pacing engine
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, input, redraw requests)              │
// │    └── Swapchain (frame pacing, recreation)                     │
// │          └── Command buffers (one per swapchain image)          │
// │                └── Frame sync (fences, semaphores per slot)     │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. begin_frame: wait for the slot, acquire an image
// 2. Record the image's command buffer (one render pass that clears)
// 3. end_frame: submit and present
//
// =============================================================================

use anyhow::{Context, Result};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use vkframe::backend::{
    CommandBufferUsage, FrameError, GpuContext, RenderPass, Swapchain, VulkanDevice,
    VulkanSurface,
};
use vkframe::config::Config;
use vkframe::ownership::{Ref, WeakRef};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting vkframe demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Vsync: {}, frames in flight: {}",
        config.graphics.vsync,
        config.graphics.max_frames_in_flight
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.exit_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// RUST_LOG wins over the configured level.
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str())).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The swapchain goes before the
/// surface and device it was built from.
struct App {
    config: Config,

    swapchain: Option<Ref<Swapchain>>,
    /// Cached handle; goes invalid when the swapchain is recreated.
    render_pass: WeakRef<RenderPass>,
    device: Option<Arc<VulkanDevice>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// Set when the loop stops on an error; returned from main.
    exit_error: Option<anyhow::Error>,

    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            swapchain: None,
            render_pass: WeakRef::default(),
            device: None,
            window: None,
            is_fullscreen,
            exit_error: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let display = window.raw_display_handle();
        let enable_validation = self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, display)?;

        let surface = VulkanSurface::new(device.clone(), display, window.raw_window_handle())?;

        let size = window.inner_size();
        let context = GpuContext::new(device.clone());
        let swapchain = Swapchain::create(
            &context,
            surface,
            size.width,
            size.height,
            self.config.swapchain_config(),
        )
        .context("Failed to create swapchain")?;

        self.device = Some(device);
        self.swapchain = Some(swapchain);
        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Returns `Ok(false)` when the engine asked to skip this frame.
    fn render_frame(&mut self) -> Result<bool, FrameError> {
        let Some(swapchain) = self.swapchain.clone() else {
            return Ok(false);
        };

        if !swapchain.begin_frame()? {
            return Ok(false);
        }

        let render_pass = match self.render_pass.upgrade() {
            Some(render_pass) => render_pass,
            None => {
                let render_pass = swapchain.render_pass();
                self.render_pass = render_pass.downgrade();
                render_pass
            }
        };

        if let (Some(cmd), Some(framebuffer)) = (
            swapchain.current_command_buffer(),
            swapchain.current_framebuffer(),
        ) {
            cmd.begin(CommandBufferUsage::SINGLE_USE)?;
            cmd.begin_render_pass(&render_pass, framebuffer)?;
            cmd.end_render_pass()?;
            cmd.end()?;
        }

        swapchain.end_frame()?;
        Ok(true)
    }

    fn stop(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.exit_error = Some(error);
        event_loop.exit();
    }

    fn resize(&mut self, event_loop: &ActiveEventLoop, width: u32, height: u32) {
        let Some(swapchain) = self.swapchain.clone() else {
            return;
        };
        match swapchain.resize(width, height) {
            Ok(outcome) => log::debug!("Resize to {}x{}: {:?}", width, height, outcome),
            Err(e) => self.stop(event_loop, anyhow::Error::new(e).context("Swapchain recreation failed")),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.stop(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            self.stop(event_loop, e.context("Failed to initialize Vulkan"));
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                self.resize(event_loop, size.width, size.height);
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) if e.is_fatal() => {
                    self.stop(event_loop, anyhow::Error::new(e).context("Frame failed"));
                }
                Err(e) => log::warn!("Frame skipped: {}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        // Swapchain first: it waits for the GPU and releases the surface
        if let Some(swapchain) = self.swapchain.take() {
            swapchain.cleanup();
        }
        self.render_pass = WeakRef::default();
        self.device = None;

        log::info!("Cleanup complete");
    }
}
