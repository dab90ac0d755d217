//! GPU resources: buffers, images, samplers, descriptor machinery and the
//! one graphics pipeline shape the video quad needs.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use super::shader::ShaderModule;
use super::{vk, DeviceShared};

pub struct BufferDescriptor {
    pub size: u64,
    pub usage_flags: vk::BufferUsageFlags,
    pub memory_location: MemoryLocation,
}

pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    size: u64,
    allocation: Option<Allocation>,
    device: Arc<DeviceShared>,
}

impl Buffer {
    pub(crate) fn new(device: Arc<DeviceShared>, descriptor: BufferDescriptor) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(descriptor.usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { device.raw.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.raw.get_buffer_memory_requirements(raw) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: descriptor.memory_location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            device
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }

        Ok(Self {
            raw,
            size: descriptor.size,
            allocation: Some(allocation),
            device,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write into the mapped range of a CPU-visible buffer. The caller is
    /// responsible for not racing the GPU; the video path guarantees that
    /// by rotating staging buffers.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| anyhow!("buffer has no allocation"))?;
        let mapped = allocation
            .mapped_slice()
            .ok_or_else(|| anyhow!("buffer is not host-visible"))?;
        // mapped_slice returns &[u8]; the allocation is exclusively ours,
        // so the mutable view is sound.
        let dst = unsafe {
            std::slice::from_raw_parts_mut(mapped.as_ptr() as *mut u8, mapped.len())
        };
        dst[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator.lock().free(allocation);
        }
        unsafe {
            self.device.raw.destroy_buffer(self.raw, None);
        }
    }
}

pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage_flags: vk::ImageUsageFlags,
}

impl ImageDescriptor {
    pub fn sampled_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage_flags: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }
}

pub struct Image {
    pub(crate) raw: vk::Image,
    pub(crate) raw_view: vk::ImageView,
    allocation: Option<Allocation>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    device: Arc<DeviceShared>,
}

impl Image {
    pub(crate) fn new(device: Arc<DeviceShared>, descriptor: ImageDescriptor) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(descriptor.format)
            .extent(vk::Extent3D {
                width: descriptor.width,
                height: descriptor.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(descriptor.usage_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { device.raw.create_image(&image_info, None)? };
        let requirements = unsafe { device.raw.get_image_memory_requirements(raw) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            device
                .raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(raw)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(descriptor.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .level_count(1)
                    .layer_count(1),
            );
        let raw_view = unsafe { device.raw.create_image_view(&view_info, None)? };

        Ok(Self {
            raw,
            raw_view,
            allocation: Some(allocation),
            extent: vk::Extent2D {
                width: descriptor.width,
                height: descriptor.height,
            },
            format: descriptor.format,
            device,
        })
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator.lock().free(allocation);
        }
        unsafe {
            self.device.raw.destroy_image_view(self.raw_view, None);
            self.device.raw.destroy_image(self.raw, None);
        }
    }
}

pub struct SamplerDescriptor {
    pub filter: vk::Filter,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
        }
    }
}

pub struct Sampler {
    pub(crate) raw: vk::Sampler,
    device: Arc<DeviceShared>,
}

impl Sampler {
    pub(crate) fn new(device: Arc<DeviceShared>, descriptor: SamplerDescriptor) -> Result<Self> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .min_filter(descriptor.filter)
            .mag_filter(descriptor.filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let raw = unsafe { device.raw.create_sampler(&sampler_info, None)? };
        Ok(Self { raw, device })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_sampler(self.raw, None);
        }
    }
}

pub struct DescriptorSetLayoutDescriptor {
    pub bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

pub struct DescriptorSetLayout {
    pub(crate) raw: vk::DescriptorSetLayout,
    device: Arc<DeviceShared>,
}

impl DescriptorSetLayout {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        descriptor: DescriptorSetLayoutDescriptor,
    ) -> Result<Self> {
        let layout_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&descriptor.bindings);
        let raw = unsafe { device.raw.create_descriptor_set_layout(&layout_info, None)? };
        Ok(Self { raw, device })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_descriptor_set_layout(self.raw, None);
        }
    }
}

pub struct DescriptorPool {
    pub(crate) raw: vk::DescriptorPool,
    device: Arc<DeviceShared>,
}

impl DescriptorPool {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(sizes);
        let raw = unsafe { device.raw.create_descriptor_pool(&pool_info, None)? };
        Ok(Self { raw, device })
    }

    pub fn allocate(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout.raw];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.raw)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.raw.allocate_descriptor_sets(&alloc_info)? };
        Ok(sets[0])
    }

    /// Point one combined-image-sampler binding at an image view.
    pub fn write_image_sampler(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        image: &Image,
        sampler: &Sampler,
    ) {
        let image_info = [vk::DescriptorImageInfo::default()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(image.raw_view)
            .sampler(sampler.raw)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe {
            self.device.raw.update_descriptor_sets(&[write], &[]);
        }
    }

    pub fn free(&self, set: vk::DescriptorSet) {
        unsafe {
            let _ = self.device.raw.free_descriptor_sets(self.raw, &[set]);
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_descriptor_pool(self.raw, None);
        }
    }
}

pub struct PipelineDescriptor {
    pub descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub shader_modules: Vec<ShaderModule>,
    pub color_attachment_format: vk::Format,
    pub push_constant_bytes: u32,
}

/// Graphics pipeline for a full-screen pass: no vertex input, dynamic
/// viewport/scissor, one color attachment, dynamic rendering.
pub struct Pipeline {
    pub(crate) raw: vk::Pipeline,
    pub(crate) raw_layout: vk::PipelineLayout,
    _descriptor_set_layouts: Vec<Arc<DescriptorSetLayout>>,
    device: Arc<DeviceShared>,
}

impl Pipeline {
    pub(crate) fn new(device: Arc<DeviceShared>, descriptor: PipelineDescriptor) -> Result<Self> {
        let set_layouts = descriptor
            .descriptor_set_layouts
            .iter()
            .map(|layout| layout.raw)
            .collect::<Vec<_>>();

        let push_constant_ranges = if descriptor.push_constant_bytes > 0 {
            vec![vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .size(descriptor.push_constant_bytes)]
        } else {
            Vec::new()
        };

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let raw_layout = unsafe { device.raw.create_pipeline_layout(&layout_info, None)? };

        let entry_point = c"main";
        let stages = descriptor
            .shader_modules
            .iter()
            .map(|module| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(module.stage.to_vk())
                    .module(module.raw)
                    .name(entry_point)
            })
            .collect::<Vec<_>>();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [descriptor.color_attachment_format];
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(raw_layout)
            .push_next(&mut rendering_info);

        let raw = unsafe {
            device
                .raw
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    std::slice::from_ref(&pipeline_info),
                    None,
                )
                .map_err(|(_, err)| anyhow!("pipeline creation failed: {err}"))?[0]
        };

        Ok(Self {
            raw,
            raw_layout,
            _descriptor_set_layouts: descriptor.descriptor_set_layouts,
            device,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.raw.destroy_pipeline(self.raw, None);
            self.device.raw.destroy_pipeline_layout(self.raw_layout, None);
        }
    }
}
