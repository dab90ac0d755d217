//! Vulkan bootstrap: instance, surface, physical/logical device selection
//! and the swapchain. The mirroring window needs exactly one graphics+
//! present queue and a low-latency present mode; anything fancier stays
//! out.

use std::{
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
    sync::Arc,
};

use anyhow::{anyhow, Result};
use ash::{ext::debug_utils, khr};
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

pub mod command;
pub mod device;
pub mod resource;
pub mod shader;

pub use ash::vk;

pub(crate) struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    debug_utils: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    pub(crate) fn new(display_handle: RawDisplayHandle) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new("kagami")?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        let enable_debug = cfg!(debug_assertions);
        if enable_debug {
            extension_names.push(debug_utils::NAME.as_ptr());
        }

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug = if enable_debug {
            let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));
            let loader = debug_utils::Instance::new(&entry, &raw);
            let messenger =
                unsafe { loader.create_debug_utils_messenger(&debug_utils_info, None)? };
            Some((loader, messenger))
        } else {
            None
        };

        Ok(Self {
            entry,
            raw,
            debug_utils: debug,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);
    if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[vk] {message:?}");
    } else {
        log::warn!("[vk] {message:?}");
    }
    vk::FALSE
}

pub(crate) struct Surface {
    pub(crate) raw_ash: khr::surface::Instance,
    pub(crate) raw_vulkan: vk::SurfaceKHR,
}

impl Surface {
    pub(crate) fn new(
        instance: &Instance,
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
    ) -> Result<Self> {
        let raw_ash = khr::surface::Instance::new(&instance.entry, &instance.raw);
        let raw_vulkan = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                display_handle,
                window_handle,
                None,
            )?
        };
        Ok(Self {
            raw_ash,
            raw_vulkan,
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.raw_ash.destroy_surface(self.raw_vulkan, None);
        }
    }
}

#[derive(Clone)]
pub(crate) struct PhysicalDevice {
    pub(crate) raw: vk::PhysicalDevice,
    pub(crate) name: String,
    pub(crate) device_type: vk::PhysicalDeviceType,
    pub(crate) graphics_family_index: u32,
}

impl PhysicalDevice {
    fn enumerate(instance: &Instance, surface: &Surface) -> Result<Vec<Self>> {
        let raw_devices = unsafe { instance.raw.enumerate_physical_devices()? };
        let mut out = Vec::new();
        for raw in raw_devices {
            let properties = unsafe { instance.raw.get_physical_device_properties(raw) };
            let name = unsafe {
                CStr::from_ptr(properties.device_name.as_ptr())
                    .to_string_lossy()
                    .into_owned()
            };
            let families =
                unsafe { instance.raw.get_physical_device_queue_family_properties(raw) };
            let mut graphics_family_index = None;
            for (index, family) in families.iter().enumerate() {
                if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    continue;
                }
                let present = unsafe {
                    surface.raw_ash.get_physical_device_surface_support(
                        raw,
                        index as u32,
                        surface.raw_vulkan,
                    )?
                };
                if present {
                    graphics_family_index = Some(index as u32);
                    break;
                }
            }
            if let Some(family) = graphics_family_index {
                out.push(Self {
                    raw,
                    name,
                    device_type: properties.device_type,
                    graphics_family_index: family,
                });
            }
        }
        Ok(out)
    }

    /// Prefer a discrete GPU, fall back to whatever can present.
    fn select(devices: Vec<Self>) -> Result<Self> {
        devices
            .iter()
            .find(|d| d.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
            .or_else(|| devices.first())
            .cloned()
            .ok_or_else(|| anyhow!("no Vulkan device can present to this surface"))
    }
}

pub(crate) struct DeviceShared {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,
    pub(crate) physical_device: PhysicalDevice,
    pub(crate) surface: Surface,
    pub(crate) instance: Instance,
}

impl DeviceShared {
    pub(crate) fn new(instance: Instance, surface: Surface) -> Result<Self> {
        let physical_device =
            PhysicalDevice::select(PhysicalDevice::enumerate(&instance, &surface)?)?;
        log::info!("renderer: using {}", physical_device.name);

        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(physical_device.graphics_family_index)
            .queue_priorities(&queue_priorities)];

        let extension_names = [khr::swapchain::NAME.as_ptr()];

        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan13_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let raw = unsafe {
            instance
                .raw
                .create_device(physical_device.raw, &device_create_info, None)?
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: physical_device.raw,
            debug_settings: AllocatorDebugSettings::default(),
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })?;

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            raw,
            physical_device,
            surface,
            instance,
        })
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}

pub(crate) struct Swapchain {
    raw_ash: khr::swapchain::Device,
    raw_vulkan: vk::SwapchainKHR,
    images_raw: Vec<vk::Image>,
    image_views_raw: Vec<vk::ImageView>,
    pub(crate) image_index: u32,
    pub(crate) surface_format: vk::SurfaceFormatKHR,
    pub(crate) extent: vk::Extent2D,
    device: Arc<DeviceShared>,
}

impl Swapchain {
    pub(crate) fn new(device: Arc<DeviceShared>) -> Result<Self> {
        let surface = &device.surface;
        let physical = device.physical_device.raw;

        let formats = unsafe {
            surface
                .raw_ash
                .get_physical_device_surface_formats(physical, surface.raw_vulkan)?
        };
        let surface_format = *formats
            .iter()
            .find(|format| {
                format.format == vk::Format::B8G8R8A8_UNORM
                    && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .unwrap_or(&formats[0]);

        // Immediate presentation keeps glass-to-glass latency down;
        // mailbox is the next best and FIFO is always there.
        let present_modes = unsafe {
            surface
                .raw_ash
                .get_physical_device_surface_present_modes(physical, surface.raw_vulkan)?
        };
        let present_mode = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ]
        .into_iter()
        .find(|mode| present_modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO);

        let capabilities = unsafe {
            surface
                .raw_ash
                .get_physical_device_surface_capabilities(physical, surface.raw_vulkan)?
        };
        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            capabilities.max_image_extent
        };

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.raw_vulkan)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .present_mode(present_mode);

        let raw_ash = khr::swapchain::Device::new(&device.instance.raw, &device.raw);
        let raw_vulkan = unsafe { raw_ash.create_swapchain(&create_info, None)? };

        let images_raw = unsafe { raw_ash.get_swapchain_images(raw_vulkan)? };
        let image_views_raw = images_raw
            .iter()
            .map(|image| {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(*image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .level_count(1)
                            .layer_count(1),
                    );
                Ok(unsafe { device.raw.create_image_view(&view_info, None)? })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            raw_ash,
            raw_vulkan,
            images_raw,
            image_views_raw,
            image_index: 0,
            surface_format,
            extent,
            device,
        })
    }

    pub(crate) fn acquire_next_image(
        &mut self,
        signal_semaphore: vk::Semaphore,
    ) -> Result<(u32, bool)> {
        let (image_index, is_suboptimal) = unsafe {
            self.raw_ash.acquire_next_image(
                self.raw_vulkan,
                u64::MAX - 1,
                signal_semaphore,
                vk::Fence::null(),
            )?
        };
        self.image_index = image_index;
        Ok((image_index, is_suboptimal))
    }

    /// Returns whether the swapchain is suboptimal for the surface.
    pub(crate) fn queue_present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.raw_vulkan];
        let image_indices = [self.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let suboptimal = unsafe { self.raw_ash.queue_present(queue, &present_info)? };
        Ok(suboptimal)
    }

    pub(crate) fn current_image_raw(&self) -> vk::Image {
        self.images_raw[self.image_index as usize]
    }

    pub(crate) fn current_image_view_raw(&self) -> vk::ImageView {
        self.image_views_raw[self.image_index as usize]
    }

    pub(crate) fn recreate(&mut self) -> Result<()> {
        unsafe {
            self.device.raw.device_wait_idle()?;
        }
        self.destroy();
        let fresh = Self::new(self.device.clone())?;
        *self = fresh;
        Ok(())
    }

    fn destroy(&mut self) {
        if !self.image_views_raw.is_empty() {
            unsafe {
                for view in self.image_views_raw.drain(..) {
                    self.device.raw.destroy_image_view(view, None);
                }
                self.raw_ash.destroy_swapchain(self.raw_vulkan, None);
            }
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}
