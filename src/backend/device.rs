// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation (1.1 preferred, 1.0 fallback) with optional validation
// - Window surface and physical device selection
// - Logical device + queue creation, YCbCr sampling feature
// - Memory allocator setup
// - Transfer image storage for the pool (`TransferDevice`)

use anyhow::{Context, Result};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr};
use std::mem::ManuallyDrop;
use std::sync::{Arc, Weak};

use super::image::{VulkanImage, TRANSFER_IMAGE_USAGE};
use crate::error::Result as DisplayResult;
use crate::format::fits_extent;
use crate::gpu::TransferDevice;
use crate::image::{HostMapping, ImageDescription};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const APP_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Presentation
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,

    // Dropped by hand before the device goes away.
    allocator: ManuallyDrop<Mutex<Allocator>>,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    api_version: u32,
    ycbcr_supported: bool,

    /// Lets transfer image storage keep the device alive.
    self_ref: Weak<VulkanDevice>,
}

/// Physical device that passed the suitability checks.
struct Candidate {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    queue_family: u32,
    name: String,
}

impl VulkanDevice {
    /// Create the device and the surface of `window`.
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers if installed
    /// * `gpu_index` - Position in the name-sorted GPU list, automatic when `None`
    pub fn new<W>(app_name: &str, enable_validation: bool, gpu_index: Option<usize>, window: &W) -> Result<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let display_handle = window.display_handle().context("Window has no display handle")?.as_raw();
        let window_handle = window.window_handle().context("Window has no window handle")?.as_raw();
        let enable_validation = enable_validation && Self::validation_available(&entry)?;
        let (instance, instance_version) = Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Surface
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe { ash_window::create_surface(&entry, &instance, display_handle, window_handle, None) }
            .context("Failed to create window surface")?;

        // Step 5: Pick physical device (GPU)
        let candidate = Self::pick_physical_device(&instance, &surface_loader, surface, gpu_index)?;
        let api_version = candidate.properties.api_version.min(instance_version);
        let ycbcr_supported = Self::supports_ycbcr(&instance, candidate.physical_device, api_version);

        log::info!("Selected GPU: {}", candidate.name);
        log::info!(
            "API Version: {}.{}.{} (YCbCr sampling {})",
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version),
            if ycbcr_supported { "available" } else { "unavailable" }
        );

        // Step 6: Create logical device
        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            candidate.physical_device,
            candidate.queue_family,
            ycbcr_supported,
        )?;
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        // Step 7: Create memory allocator
        let allocator = Self::create_allocator(&instance, candidate.physical_device, &device)?;

        Ok(Arc::new_cyclic(|self_ref| Self {
            device,
            physical_device: candidate.physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            graphics_queue_family: candidate.queue_family,
            surface,
            surface_loader,
            swapchain_loader,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            debug_utils,
            properties: candidate.properties,
            api_version,
            ycbcr_supported,
            self_ref: self_ref.clone(),
        }))
    }

    fn validation_available(entry: &Entry) -> Result<bool> {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }?;
        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        Ok(found)
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: raw_window_handle::RawDisplayHandle,
    ) -> Result<(ash::Instance, u32)> {
        let app_name_cstr = std::ffi::CString::new(app_name)?;

        // Platform surface extensions
        let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display_handle)
            .context("Window system is not supported by Vulkan")?
            .to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let loader_version = unsafe { entry.try_enumerate_instance_version() }?.unwrap_or(vk::API_VERSION_1_0);
        let mut api_version = if loader_version >= vk::API_VERSION_1_1 {
            vk::API_VERSION_1_1
        } else {
            vk::API_VERSION_1_0
        };

        loop {
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name_cstr)
                .application_version(APP_VERSION)
                .engine_name(c"video-presenter")
                .engine_version(APP_VERSION)
                .api_version(api_version);

            let create_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions)
                .enabled_layer_names(&layer_names);

            match unsafe { entry.create_instance(&create_info, None) } {
                Ok(instance) => return Ok((instance, api_version)),
                Err(vk::Result::ERROR_INCOMPATIBLE_DRIVER) if api_version != vk::API_VERSION_1_0 => {
                    log::warn!("Driver rejected Vulkan 1.1 instance, retrying with 1.0");
                    api_version = vk::API_VERSION_1_0;
                }
                Err(e) => return Err(e).context("Failed to create Vulkan instance"),
            }
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        gpu_index: Option<usize>,
    ) -> Result<Candidate> {
        let mut devices: Vec<(vk::PhysicalDevice, vk::PhysicalDeviceProperties, String)> =
            unsafe { instance.enumerate_physical_devices() }?
                .into_iter()
                .map(|device| {
                    let props = unsafe { instance.get_physical_device_properties(device) };
                    let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
                        .to_string_lossy()
                        .into_owned();
                    (device, props, name)
                })
                .collect();

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }
        devices.sort_by(|a, b| a.2.cmp(&b.2));

        for (index, (_, props, name)) in devices.iter().enumerate() {
            log::info!("GPU {}: {} ({:?})", index, name, props.device_type);
        }

        if let Some(index) = gpu_index {
            let (device, props, name) = devices
                .get(index)
                .with_context(|| format!("gpu_index {} out of range ({} GPUs)", index, devices.len()))?
                .clone();
            let queue_family = Self::find_queue_family(instance, surface_loader, surface, device)?
                .with_context(|| format!("GPU {} ({}) cannot present to this window", index, name))?;
            return Ok(Candidate { physical_device: device, properties: props, queue_family, name });
        }

        // Score each device (prefer discrete GPU)
        let mut best: Option<(u32, Candidate)> = None;
        for (device, props, name) in devices {
            let Some(queue_family) = Self::find_queue_family(instance, surface_loader, surface, device)? else {
                log::debug!("Skipping {}: no present-capable graphics queue or swapchain support", name);
                continue;
            };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
                best = Some((score, Candidate { physical_device: device, properties: props, queue_family, name }));
            }
        }

        best.map(|(_, candidate)| candidate)
            .ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    /// Graphics queue family that can present to `surface`, if the device
    /// also exposes the swapchain extension.
    fn find_queue_family(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<Option<u32>> {
        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let has_swapchain = extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == ash::khr::swapchain::NAME);
        if !has_swapchain {
            return Ok(None);
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        for (index, family) in queue_families.iter().enumerate() {
            let index = index as u32;
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                continue;
            }
            let can_present =
                unsafe { surface_loader.get_physical_device_surface_support(device, index, surface) }?;
            if can_present {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn supports_ycbcr(instance: &ash::Instance, physical_device: vk::PhysicalDevice, api_version: u32) -> bool {
        if api_version < vk::API_VERSION_1_1 {
            return false;
        }
        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut ycbcr);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
        ycbcr.sampler_ycbcr_conversion == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        enable_ycbcr: bool,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);

        // Required device extensions
        let extensions = [ash::khr::swapchain::NAME.as_ptr()];

        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default().sampler_ycbcr_conversion(true);
        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions);
        if enable_ycbcr {
            create_info = create_info.push_next(&mut ycbcr);
        }

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    pub fn allocator(&self) -> &Mutex<Allocator> {
        &self.allocator
    }

    /// Linear-tiling feature flags of `format`.
    pub fn linear_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
                .linear_tiling_features
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl TransferDevice for VulkanDevice {
    type Storage = VulkanImage;

    fn api_version(&self) -> u32 {
        self.api_version
    }

    fn ycbcr_supported(&self) -> bool {
        self.ycbcr_supported
    }

    fn is_format_supported(&self, description: ImageDescription) -> DisplayResult<bool> {
        let result = unsafe {
            self.instance.get_physical_device_image_format_properties(
                self.physical_device,
                description.format,
                vk::ImageType::TYPE_2D,
                vk::ImageTiling::LINEAR,
                TRANSFER_IMAGE_USAGE,
                vk::ImageCreateFlags::empty(),
            )
        };
        match result {
            Ok(props) => Ok(fits_extent(description, props.max_extent)),
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn create_storage(&self, id: u32) -> DisplayResult<VulkanImage> {
        let device = self
            .self_ref
            .upgrade()
            .context("Vulkan device is being destroyed")?;
        Ok(VulkanImage::new(device, id)?)
    }

    fn recreate_storage(&self, storage: &mut VulkanImage, description: ImageDescription) -> DisplayResult<HostMapping> {
        Ok(storage.recreate(description)?)
    }

    fn is_released(&self, storage: &VulkanImage) -> DisplayResult<bool> {
        Ok(storage.is_released()?)
    }

    fn wait_idle(&self) -> DisplayResult<()> {
        Ok(VulkanDevice::wait_idle(self)?)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
