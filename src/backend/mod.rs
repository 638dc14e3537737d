// Backend module - Vulkan frame pacing layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// The swapchain talks to the GPU only through `GpuDevice` and
// `PresentSurface`, so the frame loop runs against a simulated device in tests.

pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

pub use command::{CommandBuffer, CommandBufferOp, CommandBufferState, CommandBufferUsage};
pub use context::GpuContext;
pub use device::{GpuDevice, Submission, VulkanDevice};
pub use error::{CommandBufferError, FrameError, FrameResult};
pub use render_pass::{ClearFlags, RenderPass, RenderPassSpec};
pub use surface::{PresentSurface, VulkanSurface};
pub use swapchain::{FrameState, RecreateOutcome, Swapchain, SwapchainConfig};
pub use sync::FrameSync;
