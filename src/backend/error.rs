// Error types for the frame-pacing backend
//
// Environment failures (stale surface, failed submit, lost device) and
// programmer errors (calls in the wrong state) are both typed so callers can
// tell "skip a frame" apart from "stop the loop".

use ash::vk;
use thiserror::Error;

use super::command::{CommandBufferOp, CommandBufferState};
use super::swapchain::FrameState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandBufferError {
    #[error("illegal command buffer transition: {op:?} from {state:?}")]
    InvalidTransition {
        state: CommandBufferState,
        op: CommandBufferOp,
    },

    #[error("{op:?} failed: {result}")]
    Vulkan {
        op: CommandBufferOp,
        result: vk::Result,
    },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("{call} called in state {state:?}")]
    InvalidState {
        call: &'static str,
        state: FrameState,
    },

    #[error("waiting for frame fence failed: {0}")]
    FenceWait(vk::Result),

    #[error("acquiring swapchain image failed: {0}")]
    Acquire(vk::Result),

    #[error("queue submission failed: {0}")]
    Submit(vk::Result),

    #[error("presentation failed: {0}")]
    Present(vk::Result),

    #[error("failed to create {what}: {result}")]
    Creation {
        what: &'static str,
        result: vk::Result,
    },

    #[error(transparent)]
    CommandBuffer(#[from] CommandBufferError),

    #[error("swapchain has been cleaned up")]
    Destroyed,
}

impl FrameError {
    /// Shorthand for `map_err` on creation calls.
    pub(crate) fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Creation { what, result }
    }

    /// True for failures the frame loop cannot recover from by retrying.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidState { .. })
    }
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;
