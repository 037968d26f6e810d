//! Attachment layout for dynamic rendering (spec §4.10): Cardinal targets
//! devices with `VK_KHR_dynamic_rendering`, so pipelines are built against
//! a [`vk::PipelineRenderingCreateInfo`] rather than a `vk::RenderPass`
//! object, and draws are bracketed with `cmd_begin_rendering`/
//! `cmd_end_rendering` instead of render-pass begin/end.

use ash::vk;

/// The color/depth formats a pipeline is compiled against; must match the
/// swapchain's negotiated formats exactly (spec §4.7/§4.10 invariant).
#[derive(Copy, Clone, Debug)]
pub struct AttachmentLayout {
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
}

impl AttachmentLayout {
    pub fn rendering_create_info(&self) -> RenderingCreateInfoStorage {
        RenderingCreateInfoStorage {
            color_formats: [self.color_format],
            depth_format: self.depth_format.unwrap_or(vk::Format::UNDEFINED),
        }
    }
}

pub struct RenderingCreateInfoStorage {
    pub color_formats: [vk::Format; 1],
    pub depth_format: vk::Format,
}

impl RenderingCreateInfoStorage {
    pub fn as_create_info(&self) -> vk::PipelineRenderingCreateInfo<'_> {
        vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&self.color_formats)
            .depth_attachment_format(self.depth_format)
    }
}

/// Records `cmd_begin_rendering`/`f`/`cmd_end_rendering` around the
/// callback, owning the attachment info structs for the duration of the
/// call so no lifetime needs to leak out.
///
/// # Safety
/// `command_buffer` must be in the recording state; `color_view` (and
/// `depth_view`, if given) must be valid image views in
/// `COLOR_ATTACHMENT_OPTIMAL`/`DEPTH_ATTACHMENT_OPTIMAL` layout.
pub unsafe fn begin_rendering<F: FnOnce()>(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    color_view: vk::ImageView,
    depth_view: Option<vk::ImageView>,
    extent: vk::Extent2D,
    clear_color: [f32; 4],
    f: F,
) {
    let color_attachment = vk::RenderingAttachmentInfo::default()
        .image_view(color_view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        });
    let color_attachments = [color_attachment];

    let depth_attachment = depth_view.map(|view| {
        vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            })
    });

    let mut rendering_info = vk::RenderingInfo::default()
        .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent })
        .layer_count(1)
        .color_attachments(&color_attachments);
    if let Some(depth) = &depth_attachment {
        rendering_info = rendering_info.depth_attachment(depth);
    }

    device.cmd_begin_rendering(command_buffer, &rendering_info);
    f();
    device.cmd_end_rendering(command_buffer);
}
