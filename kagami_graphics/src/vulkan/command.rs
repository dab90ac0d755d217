//! Command buffer recording helpers for the video pass.

use std::sync::Arc;

use anyhow::Result;

use super::resource::{Buffer, Image, Pipeline};
use super::{vk, DeviceShared};

pub struct CommandBuffer {
    pub(crate) raw: vk::CommandBuffer,
    device: Arc<DeviceShared>,
}

impl CommandBuffer {
    pub(crate) fn new(device: Arc<DeviceShared>, raw: vk::CommandBuffer) -> Self {
        Self { raw, device }
    }

    pub fn begin(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.raw.begin_command_buffer(self.raw, &begin_info)?;
        }
        Ok(())
    }

    pub fn end(&self) -> Result<()> {
        unsafe {
            self.device.raw.end_command_buffer(self.raw)?;
        }
        Ok(())
    }

    /// Transition a sampled image between transfer-destination and
    /// shader-read layouts.
    pub fn transition_image(
        &self,
        image: &Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) {
        let (src_stage, src_access) = stage_access_for(from);
        let (dst_stage, dst_access) = stage_access_for(to);
        let barrier = vk::ImageMemoryBarrier2::default()
            .image(image.raw)
            .old_layout(from)
            .new_layout(to)
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.device.raw.cmd_pipeline_barrier2(self.raw, &dependency);
        }
    }

    /// Copy a tightly or loosely packed staging buffer into an image.
    /// `row_stride_texels` lets the copy skip the stride padding the frame
    /// pool keeps for alignment.
    pub fn copy_buffer_to_image(&self, buffer: &Buffer, image: &Image, row_stride_texels: u32) {
        let region = vk::BufferImageCopy::default()
            .buffer_offset(0)
            .buffer_row_length(row_stride_texels)
            .buffer_image_height(0)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: image.extent.width,
                height: image.extent.height,
                depth: 1,
            });
        unsafe {
            self.device.raw.cmd_copy_buffer_to_image(
                self.raw,
                buffer.raw,
                image.raw,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    pub fn begin_rendering_to(
        &self,
        view: vk::ImageView,
        extent: vk::Extent2D,
        clear: [f32; 4],
    ) {
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue { float32: clear },
            });
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(std::slice::from_ref(&color_attachment));
        unsafe {
            self.device.raw.cmd_begin_rendering(self.raw, &rendering_info);
        }
    }

    pub fn end_rendering(&self) {
        unsafe {
            self.device.raw.cmd_end_rendering(self.raw);
        }
    }

    pub fn transition_swapchain_image(
        &self,
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) {
        let barrier = vk::ImageMemoryBarrier2::default()
            .image(image)
            .old_layout(from)
            .new_layout(to)
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::empty())
            .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            )
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let dependency =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.device.raw.cmd_pipeline_barrier2(self.raw, &dependency);
        }
    }

    pub fn bind_pipeline(&self, pipeline: &Pipeline) {
        unsafe {
            self.device.raw.cmd_bind_pipeline(
                self.raw,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw,
            );
        }
    }

    pub fn bind_descriptor_set(&self, pipeline: &Pipeline, set: vk::DescriptorSet) {
        unsafe {
            self.device.raw.cmd_bind_descriptor_sets(
                self.raw,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.raw_layout,
                0,
                &[set],
                &[],
            );
        }
    }

    pub fn push_fragment_constants(&self, pipeline: &Pipeline, data: &[u8]) {
        unsafe {
            self.device.raw.cmd_push_constants(
                self.raw,
                pipeline.raw_layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                data,
            );
        }
    }

    pub fn set_viewport_scissor(&self, extent: vk::Extent2D) {
        let viewport = vk::Viewport::default()
            .width(extent.width as f32)
            .height(extent.height as f32)
            .min_depth(0.0)
            .max_depth(1.0);
        let scissor = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        };
        unsafe {
            self.device
                .raw
                .cmd_set_viewport(self.raw, 0, std::slice::from_ref(&viewport));
            self.device
                .raw
                .cmd_set_scissor(self.raw, 0, std::slice::from_ref(&scissor));
        }
    }

    pub fn draw(&self, vertex_count: u32) {
        unsafe {
            self.device.raw.cmd_draw(self.raw, vertex_count, 1, 0, 0);
        }
    }
}

fn stage_access_for(layout: vk::ImageLayout) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::empty())
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        _ => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
    }
}
