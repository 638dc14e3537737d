//! Vulkan frame pacing: swapchain lifecycle, command buffer state tracking
//! and intrusive reference-counted GPU objects.

pub mod backend;
pub mod config;
pub mod ownership;

pub use backend::{FrameError, Swapchain, SwapchainConfig};
pub use config::Config;
pub use ownership::{LiveRegistry, Ref, RefCounted, WeakRef};
