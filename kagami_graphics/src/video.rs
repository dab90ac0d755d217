//! The video renderer: consumes decoded frames, uploads YUV planes through
//! rotating staging buffers, and draws one full-screen triangle through the
//! BT.709 conversion shader.
//!
//! The staging rotation pipelines the CPU→GPU transfer one frame ahead of
//! GPU sampling: the CPU writes plane data for frame N into staging A while
//! the copy command for this frame reads frame N−1's bytes out of staging
//! B, then the pair swaps. A resize tears down images and staging and
//! rebuilds them at the new dimensions.

use std::sync::Arc;

use anyhow::Result;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use kagami_media::{FrameHandle, Metrics};

use crate::vulkan::command::CommandBuffer;
use crate::vulkan::device::Device;
use crate::vulkan::resource::{
    Buffer, BufferDescriptor, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutDescriptor,
    Image, ImageDescriptor, Pipeline, PipelineDescriptor, Sampler, SamplerDescriptor,
};
use crate::vulkan::shader::ShaderStage;
use crate::vulkan::vk;

const SHADER_VS: &str = "shaders/video.vs.glsl";
const SHADER_FS: &str = "shaders/video.fs.glsl";

/// CPU copy of the most recent frame's luma plane, for template matching.
#[derive(Clone, Debug)]
pub struct FrameGrab {
    pub width: u32,
    pub height: u32,
    pub luma: Vec<u8>,
}

/// Rotating staging buffers per plane. The CPU writes slot N while the
/// GPU copy for this frame reads slot N-1 (last frame's bytes); the third
/// slot keeps rewrites clear of the two frames that may still be in
/// flight.
const STAGING_RING: usize = 3;

struct PlaneStaging {
    buffers: [Buffer; STAGING_RING],
    row_stride: usize,
}

struct PlaneSet {
    width: u32,
    height: u32,
    semi_planar: bool,
    image_y: Image,
    image_u: Image,
    image_v: Image,
    image_uv: Image,
    staging_y: PlaneStaging,
    staging_u: PlaneStaging,
    staging_v: PlaneStaging,
    staging_uv: PlaneStaging,
    descriptor_set: vk::DescriptorSet,
    images_initialized: bool,
}

pub struct VideoRenderer {
    device: Arc<Device>,
    pipeline: Pipeline,
    descriptor_layout: Arc<DescriptorSetLayout>,
    descriptor_pool: DescriptorPool,
    sampler: Sampler,
    planes: Option<PlaneSet>,
    write_index: usize,
    uploads: u64,
    last_frame: Option<FrameHandle>,
    metrics: Arc<Metrics>,
}

impl VideoRenderer {
    pub fn new(
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let device = Arc::new(Device::new(window_handle, display_handle)?);

        let bindings = (0..4)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_count(1)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            })
            .collect::<Vec<_>>();
        let descriptor_layout = Arc::new(
            device.create_descriptor_set_layout(DescriptorSetLayoutDescriptor { bindings })?,
        );

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(16)];
        let descriptor_pool = device.create_descriptor_pool(4, &pool_sizes)?;

        let sampler = device.create_sampler(SamplerDescriptor::default())?;

        let shader_modules = vec![
            device.create_shader_module(SHADER_VS, ShaderStage::Vertex)?,
            device.create_shader_module(SHADER_FS, ShaderStage::Fragment)?,
        ];
        let pipeline = device.create_pipeline(PipelineDescriptor {
            descriptor_set_layouts: vec![descriptor_layout.clone()],
            shader_modules,
            color_attachment_format: device.swapchain_color_format(),
            push_constant_bytes: 4,
        })?;

        Ok(Self {
            device,
            pipeline,
            descriptor_layout,
            descriptor_pool,
            sampler,
            planes: None,
            write_index: 0,
            uploads: 0,
            last_frame: None,
            metrics,
        })
    }

    /// Draw one frame. `frame` is the newest decoded frame, if any; without
    /// one the previous textures are redrawn so exposes stay cheap.
    pub fn render(&mut self, frame: Option<FrameHandle>) -> Result<()> {
        let started = std::time::Instant::now();

        let has_new_frame = frame.is_some();
        if let Some(frame) = &frame {
            self.prepare_planes(frame)?;
        }

        // Stage after the frame fence so a staging slot is never rewritten
        // while a submission that reads it is still in flight.
        let command_buffer = self.device.frame_begin()?;
        if let Some(frame) = &frame {
            self.stage_frame(frame)?;
            self.record_uploads(&command_buffer);
        }
        self.record_draw(&command_buffer);
        self.device.frame_submit_and_present(command_buffer)?;

        if has_new_frame {
            self.write_index = (self.write_index + 1) % STAGING_RING;
            self.uploads += 1;
            // Keep the newest frame alive for grabs until it is replaced.
            self.last_frame = frame;
            self.metrics
                .report_render_latency(started.elapsed().as_secs_f64() * 1000.0);
        }
        Ok(())
    }

    /// Copy of the newest frame's luma plane, stride padding removed.
    pub fn grab(&self) -> Option<FrameGrab> {
        let frame = self.last_frame.as_ref()?;
        let geometry = frame.geometry();
        let src = frame.buffer().plane_y();
        let mut luma = vec![0u8; geometry.width as usize * geometry.height as usize];
        for row in 0..geometry.height as usize {
            let s = row * geometry.stride_y;
            let d = row * geometry.width as usize;
            luma[d..d + geometry.width as usize]
                .copy_from_slice(&src[s..s + geometry.width as usize]);
        }
        Some(FrameGrab {
            width: geometry.width,
            height: geometry.height,
            luma,
        })
    }

    /// Create or recreate plane textures and staging for the frame's
    /// dimensions and layout.
    fn prepare_planes(&mut self, frame: &FrameHandle) -> Result<()> {
        let geometry = frame.geometry();
        let semi_planar = frame.meta().layout_is_semi_planar;
        if let Some(planes) = &self.planes {
            if planes.width == geometry.width
                && planes.height == geometry.height
                && planes.semi_planar == semi_planar
            {
                return Ok(());
            }
            log::info!(
                "renderer: plane resources {}x{} -> {}x{} (semi_planar: {semi_planar})",
                planes.width,
                planes.height,
                geometry.width,
                geometry.height,
            );
            // Rare path; idle the GPU so images and the descriptor set can
            // be torn down without fencing every binding individually.
            self.device.wait_idle();
            if let Some(old) = self.planes.take() {
                self.descriptor_pool.free(old.descriptor_set);
            }
        }

        let (width, height) = (geometry.width, geometry.height);
        let chroma = (width / 2, height / 2);

        let image_y = self.create_plane_image(width, height, vk::Format::R8_UNORM)?;
        let image_u = self.create_plane_image(chroma.0, chroma.1, vk::Format::R8_UNORM)?;
        let image_v = self.create_plane_image(chroma.0, chroma.1, vk::Format::R8_UNORM)?;
        let image_uv = self.create_plane_image(chroma.0, chroma.1, vk::Format::R8G8_UNORM)?;

        let staging_y = self.create_plane_staging(geometry.stride_y, height as usize)?;
        let staging_u = self.create_plane_staging(geometry.stride_u, chroma.1 as usize)?;
        let staging_v = self.create_plane_staging(geometry.stride_v, chroma.1 as usize)?;
        let staging_uv = self.create_plane_staging(geometry.stride_uv, chroma.1 as usize)?;

        let descriptor_set = self.descriptor_pool.allocate(&self.descriptor_layout)?;
        self.descriptor_pool
            .write_image_sampler(descriptor_set, 0, &image_y, &self.sampler);
        self.descriptor_pool
            .write_image_sampler(descriptor_set, 1, &image_u, &self.sampler);
        self.descriptor_pool
            .write_image_sampler(descriptor_set, 2, &image_v, &self.sampler);
        self.descriptor_pool
            .write_image_sampler(descriptor_set, 3, &image_uv, &self.sampler);

        self.planes = Some(PlaneSet {
            width,
            height,
            semi_planar,
            image_y,
            image_u,
            image_v,
            image_uv,
            staging_y,
            staging_u,
            staging_v,
            staging_uv,
            descriptor_set,
            images_initialized: false,
        });
        self.uploads = 0;
        self.write_index = 0;
        Ok(())
    }

    fn create_plane_image(&self, width: u32, height: u32, format: vk::Format) -> Result<Image> {
        self.device
            .create_image(ImageDescriptor::sampled_2d(width.max(1), height.max(1), format))
    }

    fn create_plane_staging(&self, row_stride: usize, rows: usize) -> Result<PlaneStaging> {
        let size = (row_stride * rows).max(4) as u64;
        let make = || {
            self.device.create_buffer(BufferDescriptor {
                size,
                usage_flags: vk::BufferUsageFlags::TRANSFER_SRC,
                memory_location: MemoryLocation::CpuToGpu,
            })
        };
        Ok(PlaneStaging {
            buffers: [make()?, make()?, make()?],
            row_stride,
        })
    }

    /// Write the frame's planes into the CPU-side staging slot.
    fn stage_frame(&mut self, frame: &FrameHandle) -> Result<()> {
        let planes = self.planes.as_ref().expect("prepare_planes ran");
        let buffer = frame.buffer();
        // Prime every slot on the first upload so the draw that reads
        // "last frame's" buffer never sees uninitialised memory.
        let targets: &[usize] = if self.uploads == 0 {
            &[0, 1, 2]
        } else {
            std::slice::from_ref(&self.write_index)
        };

        for &index in targets {
            write_plane(&planes.staging_y.buffers[index], buffer.plane_y())?;
            if planes.semi_planar {
                write_plane(&planes.staging_uv.buffers[index], buffer.plane_uv())?;
            } else {
                write_plane(&planes.staging_u.buffers[index], buffer.plane_u())?;
                write_plane(&planes.staging_v.buffers[index], buffer.plane_v())?;
            }
        }
        Ok(())
    }

    /// Record the texture updates reading from the *other* staging buffer:
    /// last frame's bytes, one frame behind the CPU writes.
    fn record_uploads(&mut self, command_buffer: &CommandBuffer) {
        let Some(planes) = self.planes.as_mut() else {
            return;
        };
        // Last frame's slot: one behind the current write target.
        let read_index = (self.write_index + STAGING_RING - 1) % STAGING_RING;
        let from_layout = if planes.images_initialized {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };

        let upload = |image: &Image, staging: &PlaneStaging, texels_per_row: u32| {
            command_buffer.transition_image(
                image,
                from_layout,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            command_buffer.copy_buffer_to_image(&staging.buffers[read_index], image, texels_per_row);
            command_buffer.transition_image(
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        };

        upload(
            &planes.image_y,
            &planes.staging_y,
            planes.staging_y.row_stride as u32,
        );
        if planes.semi_planar {
            // The UV image is two bytes per texel, so the buffer row length
            // is half the byte stride.
            upload(
                &planes.image_uv,
                &planes.staging_uv,
                (planes.staging_uv.row_stride / 2) as u32,
            );
            // U and V still need defined layouts for the descriptor set.
            if !planes.images_initialized {
                command_buffer.transition_image(
                    &planes.image_u,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
                command_buffer.transition_image(
                    &planes.image_v,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        } else {
            upload(
                &planes.image_u,
                &planes.staging_u,
                planes.staging_u.row_stride as u32,
            );
            upload(
                &planes.image_v,
                &planes.staging_v,
                planes.staging_v.row_stride as u32,
            );
            if !planes.images_initialized {
                command_buffer.transition_image(
                    &planes.image_uv,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            }
        }
        planes.images_initialized = true;
    }

    fn record_draw(&self, command_buffer: &CommandBuffer) {
        let extent = self.device.swapchain_extent();
        let swapchain = self.device.swapchain.lock();
        let swapchain_image = swapchain.current_image_raw();
        let swapchain_view = swapchain.current_image_view_raw();
        drop(swapchain);

        command_buffer.transition_swapchain_image(
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        command_buffer.begin_rendering_to(swapchain_view, extent, [0.0, 0.0, 0.0, 1.0]);

        if let Some(planes) = &self.planes {
            if planes.images_initialized {
                command_buffer.bind_pipeline(&self.pipeline);
                command_buffer.bind_descriptor_set(&self.pipeline, planes.descriptor_set);
                let semi_planar = (planes.semi_planar as i32).to_ne_bytes();
                command_buffer.push_fragment_constants(&self.pipeline, &semi_planar);
                command_buffer.set_viewport_scissor(extent);
                command_buffer.draw(3);
            }
        }

        command_buffer.end_rendering();
        command_buffer.transition_swapchain_image(
            swapchain_image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
    }
}

impl Drop for VideoRenderer {
    fn drop(&mut self) {
        self.device.wait_idle();
        if let Some(planes) = self.planes.take() {
            self.descriptor_pool.free(planes.descriptor_set);
        }
    }
}

fn write_plane(buffer: &Buffer, data: &[u8]) -> Result<()> {
    let len = data.len().min(buffer.size() as usize);
    buffer.write_bytes(0, &data[..len])
}
