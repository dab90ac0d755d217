//! Logical device wrapper: frame pacing (two frames in flight, fence per
//! frame), per-frame command buffers, and resource creation entry points.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::command::CommandBuffer;
use super::resource::{
    Buffer, BufferDescriptor, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutDescriptor,
    Image, ImageDescriptor, Pipeline, PipelineDescriptor, Sampler, SamplerDescriptor,
};
use super::shader::{ShaderModule, ShaderStage};
use super::{vk, DeviceShared, Instance, Surface, Swapchain};

pub const MAX_FRAMES: usize = 2;

struct FrameResources {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    in_flight: vk::Fence,
    image_acquired: vk::Semaphore,
    render_complete: vk::Semaphore,
}

/// Owns the swapchain and drives the per-frame synchronisation. Passed
/// around as an immutable reference; internally mutable where needed.
pub struct Device {
    frames: Vec<FrameResources>,
    current_frame: Mutex<usize>,
    queue: vk::Queue,
    pub(crate) swapchain: Mutex<Swapchain>,
    swapchain_generation: Mutex<u64>,
    pub(crate) shared: Arc<DeviceShared>,
}

impl Device {
    pub fn new(window_handle: RawWindowHandle, display_handle: RawDisplayHandle) -> Result<Self> {
        let instance = Instance::new(display_handle)?;
        let surface = Surface::new(&instance, window_handle, display_handle)?;
        let shared = Arc::new(DeviceShared::new(instance, surface)?);
        let swapchain = Mutex::new(Swapchain::new(shared.clone())?);

        let queue = unsafe {
            shared
                .raw
                .get_device_queue(shared.physical_device.graphics_family_index, 0)
        };

        let mut frames = Vec::with_capacity(MAX_FRAMES);
        for _ in 0..MAX_FRAMES {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(shared.physical_device.graphics_family_index);
            let command_pool = unsafe { shared.raw.create_command_pool(&pool_info, None)? };

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = unsafe { shared.raw.allocate_command_buffers(&alloc_info)?[0] };

            let fence_info =
                vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            let in_flight = unsafe { shared.raw.create_fence(&fence_info, None)? };

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let image_acquired = unsafe { shared.raw.create_semaphore(&semaphore_info, None)? };
            let render_complete = unsafe { shared.raw.create_semaphore(&semaphore_info, None)? };

            frames.push(FrameResources {
                command_pool,
                command_buffer,
                in_flight,
                image_acquired,
                render_complete,
            });
        }

        Ok(Self {
            frames,
            current_frame: Mutex::new(0),
            queue,
            swapchain,
            swapchain_generation: Mutex::new(0),
            shared,
        })
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.lock().extent
    }

    pub fn swapchain_color_format(&self) -> vk::Format {
        self.swapchain.lock().surface_format.format
    }

    /// Bumped on every swapchain recreation so callers can rebuild
    /// size-dependent state.
    pub fn swapchain_generation(&self) -> u64 {
        *self.swapchain_generation.lock()
    }

    /// Wait for this frame's previous submission, acquire a swapchain
    /// image (recreating on demand) and hand back a recording command
    /// buffer.
    pub fn frame_begin(&self) -> Result<CommandBuffer> {
        let frame_index = *self.current_frame.lock();
        let frame = &self.frames[frame_index];

        unsafe {
            self.shared
                .raw
                .wait_for_fences(&[frame.in_flight], true, u64::MAX)?;
            self.shared.raw.reset_fences(&[frame.in_flight])?;
            self.shared.raw.reset_command_pool(
                frame.command_pool,
                vk::CommandPoolResetFlags::empty(),
            )?;
        }

        let mut swapchain = self.swapchain.lock();
        if swapchain.acquire_next_image(frame.image_acquired).is_err() {
            swapchain.recreate()?;
            *self.swapchain_generation.lock() += 1;
            swapchain.acquire_next_image(frame.image_acquired)?;
        }

        let command_buffer = CommandBuffer::new(self.shared.clone(), frame.command_buffer);
        command_buffer.begin()?;
        Ok(command_buffer)
    }

    /// Submit the recorded frame and present it. Flushes the queue to the
    /// driver immediately; pacing comes from the per-frame fence, not from
    /// a deep queue.
    pub fn frame_submit_and_present(&self, command_buffer: CommandBuffer) -> Result<()> {
        let mut frame_slot = self.current_frame.lock();
        let frame = &self.frames[*frame_slot];

        command_buffer.end()?;

        let wait_semaphores = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.image_acquired)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        let signal_semaphores = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.render_complete)
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        let command_infos =
            [vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer.raw)];

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_semaphores)
            .signal_semaphore_infos(&signal_semaphores)
            .command_buffer_infos(&command_infos);

        unsafe {
            self.shared.raw.queue_submit2(
                self.queue,
                std::slice::from_ref(&submit_info),
                frame.in_flight,
            )?;
        }

        let swapchain = self.swapchain.lock();
        match swapchain.queue_present(self.queue, &[frame.render_complete]) {
            Ok(_) => {}
            Err(_) => {
                // Out-of-date surfaces get rebuilt at the next frame_begin.
                drop(swapchain);
                self.swapchain.lock().recreate()?;
                *self.swapchain_generation.lock() += 1;
            }
        }

        *frame_slot = (*frame_slot + 1) % MAX_FRAMES;
        Ok(())
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.shared.raw.device_wait_idle();
        }
    }

    pub fn create_buffer(&self, descriptor: BufferDescriptor) -> Result<Buffer> {
        Buffer::new(self.shared.clone(), descriptor)
    }

    pub fn create_image(&self, descriptor: ImageDescriptor) -> Result<Image> {
        Image::new(self.shared.clone(), descriptor)
    }

    pub fn create_sampler(&self, descriptor: SamplerDescriptor) -> Result<Sampler> {
        Sampler::new(self.shared.clone(), descriptor)
    }

    pub fn create_descriptor_set_layout(
        &self,
        descriptor: DescriptorSetLayoutDescriptor,
    ) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(self.shared.clone(), descriptor)
    }

    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorPool> {
        DescriptorPool::new(self.shared.clone(), max_sets, sizes)
    }

    pub fn create_shader_module(&self, source_path: &str, stage: ShaderStage) -> Result<ShaderModule> {
        ShaderModule::from_glsl_file(self.shared.clone(), source_path, stage)
    }

    pub fn create_pipeline(&self, descriptor: PipelineDescriptor) -> Result<Pipeline> {
        Pipeline::new(self.shared.clone(), descriptor)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.shared.raw.device_wait_idle();
            for frame in self.frames.drain(..) {
                self.shared.raw.destroy_semaphore(frame.image_acquired, None);
                self.shared
                    .raw
                    .destroy_semaphore(frame.render_complete, None);
                self.shared.raw.destroy_fence(frame.in_flight, None);
                self.shared.raw.destroy_command_pool(frame.command_pool, None);
            }
        }
    }
}
