// Command buffers with an explicit recording state machine
//
// Every state change goes through `transition`, the one table of legal
// moves. Illegal calls come back as `CommandBufferError::InvalidTransition`
// and leave the buffer untouched.

use ash::vk;
use parking_lot::Mutex;

use super::context::GpuContext;
use super::device::Submission;
use super::error::CommandBufferError;
use super::render_pass::RenderPass;
use crate::ownership::{Ref, RefCount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    NotAllocated,
    Ready,
    Recording,
    InRenderPass,
    RecordingEnded,
    Submitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferOp {
    Allocate,
    Free,
    Begin,
    End,
    BeginRenderPass,
    EndRenderPass,
    MarkSubmitted,
    Reset,
}

/// Legal state transitions. Anything not listed is rejected.
pub fn transition(
    state: CommandBufferState,
    op: CommandBufferOp,
) -> Result<CommandBufferState, CommandBufferError> {
    use CommandBufferOp as Op;
    use CommandBufferState as S;

    let next = match (state, op) {
        (S::NotAllocated, Op::Allocate) => S::Ready,
        (_, Op::Free) => S::NotAllocated,
        (S::Ready, Op::Begin) => S::Recording,
        (S::Recording, Op::BeginRenderPass) => S::InRenderPass,
        (S::InRenderPass, Op::EndRenderPass) => S::Recording,
        (S::Recording, Op::End) => S::RecordingEnded,
        (S::RecordingEnded, Op::MarkSubmitted) => S::Submitted,
        (S::RecordingEnded | S::Submitted, Op::Reset) => S::Ready,
        _ => return Err(CommandBufferError::InvalidTransition { state, op }),
    };
    Ok(next)
}

/// Flags for `CommandBuffer::begin`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandBufferUsage {
    pub single_use: bool,
    pub render_pass_continue: bool,
    pub simultaneous_use: bool,
}

impl CommandBufferUsage {
    pub const SINGLE_USE: Self = Self {
        single_use: true,
        render_pass_continue: false,
        simultaneous_use: false,
    };

    pub fn flags(self) -> vk::CommandBufferUsageFlags {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if self.single_use {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if self.render_pass_continue {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        if self.simultaneous_use {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        flags
    }
}

struct Inner {
    state: CommandBufferState,
    handle: vk::CommandBuffer,
}

/// One command buffer from a pool. The pool must outlive it and must be
/// created with `RESET_COMMAND_BUFFER` for `reset` to be valid.
pub struct CommandBuffer {
    ref_count: RefCount,
    context: GpuContext,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    inner: Mutex<Inner>,
}

crate::impl_ref_counted!(CommandBuffer, ref_count);

impl CommandBuffer {
    /// A buffer in `NotAllocated`; call `allocate` before use.
    pub fn new(context: &GpuContext, pool: vk::CommandPool, primary: bool) -> Ref<Self> {
        let level = if primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };
        context.adopt(Self {
            ref_count: RefCount::new(),
            context: context.clone(),
            pool,
            level,
            inner: Mutex::new(Inner {
                state: CommandBufferState::NotAllocated,
                handle: vk::CommandBuffer::null(),
            }),
        })
    }

    /// New buffer, already allocated.
    pub fn allocated(
        context: &GpuContext,
        pool: vk::CommandPool,
        primary: bool,
    ) -> Result<Ref<Self>, CommandBufferError> {
        let buffer = Self::new(context, pool, primary);
        buffer.allocate()?;
        Ok(buffer)
    }

    pub fn state(&self) -> CommandBufferState {
        self.inner.lock().state
    }

    /// Native handle, null while not allocated.
    pub fn handle(&self) -> vk::CommandBuffer {
        self.inner.lock().handle
    }

    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn is_primary(&self) -> bool {
        self.level == vk::CommandBufferLevel::PRIMARY
    }

    pub fn allocate(&self) -> Result<(), CommandBufferError> {
        let op = CommandBufferOp::Allocate;
        let mut inner = self.inner.lock();
        let next = transition(inner.state, op)?;
        inner.handle = self
            .context
            .device()
            .allocate_command_buffer(self.pool, self.level)
            .map_err(|result| CommandBufferError::Vulkan { op, result })?;
        inner.state = next;
        Ok(())
    }

    /// Return the buffer to its pool. No-op when not allocated.
    pub fn free(&self) {
        let mut inner = self.inner.lock();
        let Ok(next) = transition(inner.state, CommandBufferOp::Free) else {
            return;
        };
        if inner.handle != vk::CommandBuffer::null() {
            self.context
                .device()
                .free_command_buffer(self.pool, inner.handle);
            inner.handle = vk::CommandBuffer::null();
        }
        inner.state = next;
    }

    pub fn begin(&self, usage: CommandBufferUsage) -> Result<(), CommandBufferError> {
        let op = CommandBufferOp::Begin;
        let mut inner = self.inner.lock();
        let next = transition(inner.state, op)?;
        self.context
            .device()
            .begin_command_buffer(inner.handle, usage.flags())
            .map_err(|result| CommandBufferError::Vulkan { op, result })?;
        inner.state = next;
        Ok(())
    }

    /// Close recording. A render pass left open must be ended first.
    pub fn end(&self) -> Result<(), CommandBufferError> {
        let op = CommandBufferOp::End;
        let mut inner = self.inner.lock();
        let next = transition(inner.state, op)?;
        self.context
            .device()
            .end_command_buffer(inner.handle)
            .map_err(|result| CommandBufferError::Vulkan { op, result })?;
        inner.state = next;
        Ok(())
    }

    /// Record `vkCmdBeginRenderPass` for `render_pass` on `framebuffer`,
    /// using the pass's current render area and clear values.
    pub fn begin_render_pass(
        &self,
        render_pass: &RenderPass,
        framebuffer: vk::Framebuffer,
    ) -> Result<(), CommandBufferError> {
        let mut inner = self.inner.lock();
        let next = transition(inner.state, CommandBufferOp::BeginRenderPass)?;

        let clear_values = render_pass.clear_values();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass.handle())
            .framebuffer(framebuffer)
            .render_area(render_pass.render_area())
            .clear_values(&clear_values);
        self.context
            .device()
            .cmd_begin_render_pass(inner.handle, &begin_info);

        inner.state = next;
        Ok(())
    }

    pub fn end_render_pass(&self) -> Result<(), CommandBufferError> {
        let mut inner = self.inner.lock();
        let next = transition(inner.state, CommandBufferOp::EndRenderPass)?;
        self.context.device().cmd_end_render_pass(inner.handle);
        inner.state = next;
        Ok(())
    }

    /// Record that the buffer was handed to a queue. It stays unusable until
    /// `reset`.
    pub fn mark_submitted(&self) -> Result<(), CommandBufferError> {
        let mut inner = self.inner.lock();
        inner.state = transition(inner.state, CommandBufferOp::MarkSubmitted)?;
        Ok(())
    }

    /// Back to `Ready` without reallocating. The caller must know the GPU is
    /// done with the previous submission.
    pub fn reset(&self) -> Result<(), CommandBufferError> {
        let op = CommandBufferOp::Reset;
        let mut inner = self.inner.lock();
        let next = transition(inner.state, op)?;
        self.context
            .device()
            .reset_command_buffer(inner.handle)
            .map_err(|result| CommandBufferError::Vulkan { op, result })?;
        inner.state = next;
        Ok(())
    }

    pub fn allocate_and_begin_single_use(&self) -> Result<(), CommandBufferError> {
        self.allocate()?;
        if let Err(e) = self.begin(CommandBufferUsage::SINGLE_USE) {
            self.free();
            return Err(e);
        }
        Ok(())
    }

    /// End recording, submit to `queue`, block until the queue is idle, then
    /// free the buffer. Stalls the queue: setup work only, never per frame.
    pub fn end_single_use(&self, queue: vk::Queue) -> Result<(), CommandBufferError> {
        let result = self.submit_and_wait(queue);
        self.free();
        result
    }

    fn submit_and_wait(&self, queue: vk::Queue) -> Result<(), CommandBufferError> {
        self.end()?;

        let device = self.context.device();
        let command_buffers = [self.handle()];
        let submission = Submission {
            command_buffers: &command_buffers,
            ..Default::default()
        };
        device
            .queue_submit(queue, &submission, vk::Fence::null())
            .map_err(|result| CommandBufferError::Vulkan {
                op: CommandBufferOp::MarkSubmitted,
                result,
            })?;
        self.mark_submitted()?;

        device
            .queue_wait_idle(queue)
            .map_err(|result| CommandBufferError::Vulkan {
                op: CommandBufferOp::MarkSubmitted,
                result,
            })
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockGpu;
    use crate::backend::render_pass::RenderPassSpec;
    use crate::backend::GpuDevice;
    use CommandBufferOp as Op;
    use CommandBufferState as S;

    const ALL_STATES: [S; 6] = [
        S::NotAllocated,
        S::Ready,
        S::Recording,
        S::InRenderPass,
        S::RecordingEnded,
        S::Submitted,
    ];

    fn pool(mock: &MockGpu) -> vk::CommandPool {
        mock.create_command_pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .expect("pool")
    }

    #[test]
    fn table_accepts_only_listed_moves() {
        let legal = [
            (S::NotAllocated, Op::Allocate, S::Ready),
            (S::Ready, Op::Begin, S::Recording),
            (S::Recording, Op::BeginRenderPass, S::InRenderPass),
            (S::InRenderPass, Op::EndRenderPass, S::Recording),
            (S::Recording, Op::End, S::RecordingEnded),
            (S::RecordingEnded, Op::MarkSubmitted, S::Submitted),
            (S::RecordingEnded, Op::Reset, S::Ready),
            (S::Submitted, Op::Reset, S::Ready),
        ];
        for (state, op, next) in legal {
            assert_eq!(transition(state, op), Ok(next), "{:?} {:?}", state, op);
        }

        for state in ALL_STATES {
            assert_eq!(transition(state, Op::Free), Ok(S::NotAllocated));
        }

        let rejected = [
            (S::Ready, Op::Allocate),
            (S::NotAllocated, Op::Begin),
            (S::Recording, Op::Begin),
            (S::InRenderPass, Op::End),
            (S::Ready, Op::End),
            (S::Submitted, Op::MarkSubmitted),
            (S::Recording, Op::MarkSubmitted),
            (S::Recording, Op::Reset),
            (S::Ready, Op::EndRenderPass),
            (S::Submitted, Op::Begin),
        ];
        for (state, op) in rejected {
            assert_eq!(
                transition(state, op),
                Err(CommandBufferError::InvalidTransition { state, op })
            );
        }
    }

    #[test]
    fn full_cycle_reaches_submitted_and_back() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        let cmd = CommandBuffer::allocated(&context, pool, true).expect("allocate");
        assert!(cmd.is_primary());
        assert_eq!(cmd.state(), S::Ready);

        cmd.begin(CommandBufferUsage::default()).expect("begin");
        cmd.end().expect("end");
        cmd.mark_submitted().expect("submitted");
        assert_eq!(cmd.state(), S::Submitted);

        // a submitted buffer cannot be re-recorded without a reset
        assert!(cmd.begin(CommandBufferUsage::default()).is_err());
        cmd.reset().expect("reset");
        assert_eq!(cmd.state(), S::Ready);

        drop(cmd);
        mock.destroy_command_pool(pool);
        assert_eq!(mock.live_objects(), 0);
    }

    #[test]
    fn reset_through_handle_keeps_buffer_allocated() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        let mut cmd = CommandBuffer::allocated(&context, pool, true).expect("allocate");
        let handle = cmd.handle();
        cmd.begin(CommandBufferUsage::default()).expect("begin");
        cmd.end().expect("end");

        cmd.reset().expect("reset");
        assert!(!cmd.is_null());
        assert_eq!(cmd.state(), S::Ready);
        assert_eq!(cmd.handle(), handle);
        assert_eq!(mock.live_of_kind("command buffer"), 1);

        // dropping the handle is a separate, explicit call
        cmd.release();
        assert!(cmd.is_null());
        assert_eq!(mock.live_of_kind("command buffer"), 0);
    }

    #[test]
    fn rejected_call_leaves_state_untouched() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        let cmd = CommandBuffer::new(&context, pool, false);
        assert!(!cmd.is_primary());

        let err = cmd.end().unwrap_err();
        assert_eq!(
            err,
            CommandBufferError::InvalidTransition {
                state: S::NotAllocated,
                op: Op::End
            }
        );
        assert_eq!(cmd.state(), S::NotAllocated);
        assert_eq!(cmd.handle(), vk::CommandBuffer::null());
    }

    #[test]
    fn end_inside_render_pass_is_rejected() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        let extent = vk::Extent2D { width: 4, height: 4 };
        let spec = RenderPassSpec::presentable(vk::Format::B8G8R8A8_UNORM, extent);
        let render_pass = RenderPass::new(&context, spec).expect("render pass");
        let framebuffer = mock
            .create_framebuffer(render_pass.handle(), &[], extent)
            .expect("framebuffer");

        let cmd = CommandBuffer::allocated(&context, pool, true).expect("allocate");
        cmd.begin(CommandBufferUsage::default()).expect("begin");
        cmd.begin_render_pass(&render_pass, framebuffer).expect("begin pass");
        assert_eq!(cmd.state(), S::InRenderPass);
        assert!(cmd.end().is_err());

        cmd.end_render_pass().expect("end pass");
        cmd.end().expect("end");
        assert_eq!(cmd.state(), S::RecordingEnded);
        assert_eq!(mock.render_passes_recorded(), 1);
        mock.destroy_framebuffer(framebuffer);
    }

    #[test]
    fn free_is_idempotent() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        let cmd = CommandBuffer::allocated(&context, pool, true).expect("allocate");
        let before = mock.live_objects();
        cmd.free();
        cmd.free();
        assert_eq!(mock.live_objects(), before - 1);
        assert_eq!(cmd.state(), S::NotAllocated);

        // and it can be allocated again
        cmd.allocate().expect("reallocate");
        assert_eq!(cmd.state(), S::Ready);

        // freeing mid-recording lands where the table says
        cmd.begin(CommandBufferUsage::default()).expect("begin");
        cmd.free();
        assert_eq!(
            cmd.state(),
            transition(S::Recording, CommandBufferOp::Free).expect("free is always allowed")
        );
        assert_eq!(mock.live_objects(), before - 1);
    }

    #[test]
    fn allocation_failure_is_surfaced() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        mock.fail_next_allocation();

        let cmd = CommandBuffer::new(&context, pool, true);
        let err = cmd.allocate().unwrap_err();
        assert!(matches!(
            err,
            CommandBufferError::Vulkan {
                op: Op::Allocate,
                ..
            }
        ));
        assert_eq!(cmd.state(), S::NotAllocated);
    }

    #[test]
    fn single_use_blocks_until_idle_and_frees() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        let queue = mock.graphics_queue();

        let cmd = CommandBuffer::new(&context, pool, true);
        cmd.allocate_and_begin_single_use().expect("begin single use");
        assert_eq!(cmd.state(), S::Recording);
        cmd.end_single_use(queue).expect("end single use");

        assert_eq!(cmd.state(), S::NotAllocated);
        assert_eq!(mock.submissions(), 1);
        assert_eq!(mock.pending_submissions(), 0);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn single_use_submit_failure_still_frees() {
        let mock = MockGpu::new();
        let context = mock.context();
        let pool = pool(&mock);
        let live_before = mock.live_objects();

        let cmd = CommandBuffer::new(&context, pool, true);
        cmd.allocate_and_begin_single_use().expect("begin single use");
        mock.fail_next_submit();
        assert!(cmd.end_single_use(mock.graphics_queue()).is_err());
        assert_eq!(cmd.state(), S::NotAllocated);
        assert_eq!(mock.live_objects(), live_before);
    }
}
