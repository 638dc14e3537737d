// Render pass - attachment set for one pass over a swapchain image
//
// Load ops come from the clear flags, layouts from where the pass sits in
// the frame's pass chain. A single external dependency keeps color writes
// behind the acquire semaphore.

use ash::prelude::VkResult;
use ash::vk;
use bitflags::bitflags;
use glam::Vec4;
use parking_lot::Mutex;

use super::context::GpuContext;
use crate::ownership::{Ref, RefCount};

bitflags! {
    /// Which attachments are cleared at the start of the pass.
    pub struct ClearFlags: u32 {
        const COLOR = 0b001;
        const DEPTH = 0b010;
        const STENCIL = 0b100;
    }
}

#[derive(Debug, Clone)]
pub struct RenderPassSpec {
    pub color_format: vk::Format,
    /// `None` for a color-only pass.
    pub depth_format: Option<vk::Format>,
    pub render_area: vk::Rect2D,
    pub clear_color: Vec4,
    pub clear_depth: f32,
    pub clear_stencil: u32,
    pub clear_flags: ClearFlags,
    /// Another pass wrote the attachments earlier in the frame.
    pub has_prev_pass: bool,
    /// Another pass reads the attachments later in the frame.
    pub has_next_pass: bool,
    pub debug_name: String,
}

impl RenderPassSpec {
    /// Single pass straight to presentation, clearing color.
    pub fn presentable(color_format: vk::Format, extent: vk::Extent2D) -> Self {
        Self {
            color_format,
            depth_format: None,
            render_area: full_area(extent),
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            clear_depth: 1.0,
            clear_stencil: 0,
            clear_flags: ClearFlags::COLOR,
            has_prev_pass: false,
            has_next_pass: false,
            debug_name: "present".to_string(),
        }
    }

    /// Add a depth attachment that is cleared every frame.
    pub fn with_depth(mut self, depth_format: vk::Format) -> Self {
        self.depth_format = Some(depth_format);
        self.clear_flags |= ClearFlags::DEPTH;
        self
    }

    pub fn with_clear_color(mut self, clear_color: Vec4) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn attachment_count(&self) -> usize {
        1 + usize::from(self.depth_format.is_some())
    }
}

pub fn full_area(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

fn load_op(clear: bool) -> vk::AttachmentLoadOp {
    if clear {
        vk::AttachmentLoadOp::CLEAR
    } else {
        vk::AttachmentLoadOp::LOAD
    }
}

/// Color first, then depth when present.
pub fn attachment_descriptions(spec: &RenderPassSpec) -> Vec<vk::AttachmentDescription> {
    let mut attachments = Vec::with_capacity(spec.attachment_count());

    attachments.push(
        vk::AttachmentDescription::builder()
            .format(spec.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(load_op(spec.clear_flags.contains(ClearFlags::COLOR)))
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(if spec.has_prev_pass {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::UNDEFINED
            })
            .final_layout(if spec.has_next_pass {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::PRESENT_SRC_KHR
            })
            .build(),
    );

    if let Some(depth_format) = spec.depth_format {
        let stencil_load_op = if spec.clear_flags.contains(ClearFlags::STENCIL) {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(depth_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(load_op(spec.clear_flags.contains(ClearFlags::DEPTH)))
                // Nothing reads depth after the last pass
                .store_op(if spec.has_next_pass {
                    vk::AttachmentStoreOp::STORE
                } else {
                    vk::AttachmentStoreOp::DONT_CARE
                })
                .stencil_load_op(stencil_load_op)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(if spec.has_prev_pass {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                } else {
                    vk::ImageLayout::UNDEFINED
                })
                .final_layout(if spec.has_next_pass {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                } else {
                    vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
                })
                .build(),
        );
    }

    attachments
}

/// External -> subpass 0: color output waits for the image to be released
/// by the presentation engine.
pub fn external_dependency(spec: &RenderPassSpec) -> vk::SubpassDependency {
    let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let mut access =
        vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    if spec.depth_format.is_some() {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }

    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(access)
        .build()
}

/// Clear values in attachment order.
pub fn clear_values(spec: &RenderPassSpec) -> Vec<vk::ClearValue> {
    let mut values = vec![vk::ClearValue {
        color: vk::ClearColorValue {
            float32: spec.clear_color.to_array(),
        },
    }];
    if spec.depth_format.is_some() {
        values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: spec.clear_depth,
                stencil: spec.clear_stencil,
            },
        });
    }
    values
}

pub struct RenderPass {
    ref_count: RefCount,
    context: GpuContext,
    handle: vk::RenderPass,
    spec: RenderPassSpec,
    render_area: Mutex<vk::Rect2D>,
}

crate::impl_ref_counted!(RenderPass, ref_count);

impl RenderPass {
    pub fn new(context: &GpuContext, spec: RenderPassSpec) -> VkResult<Ref<Self>> {
        let attachments = attachment_descriptions(&spec);

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if spec.depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass.build()];
        let dependencies = [external_dependency(&spec)];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = context.device().create_render_pass(&create_info)?;
        log::debug!(
            "Created render pass '{}' ({} attachments)",
            spec.debug_name,
            attachments.len()
        );

        let render_area = Mutex::new(spec.render_area);
        Ok(context.adopt(Self {
            ref_count: RefCount::new(),
            context: context.clone(),
            handle,
            spec,
            render_area,
        }))
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn spec(&self) -> &RenderPassSpec {
        &self.spec
    }

    pub fn render_area(&self) -> vk::Rect2D {
        *self.render_area.lock()
    }

    pub fn set_render_area(&self, area: vk::Rect2D) {
        *self.render_area.lock() = area;
    }

    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        clear_values(&self.spec)
    }

    pub fn attachment_count(&self) -> usize {
        self.spec.attachment_count()
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        log::debug!("Destroying render pass '{}'", self.spec.debug_name);
        self.context.device().destroy_render_pass(self.handle);
    }
}
