// SPDX-License-Identifier: CEPL-1.0
//! Instance, surface and logical device bootstrap.
//!
//! The renderer needs Vulkan 1.3 (dynamic rendering, synchronization2), the
//! descriptor indexing features behind the bindless table, mesh shaders and
//! shader objects. A device lacking any of them is skipped with a log line
//! naming what it is missing.

use std::ffi::{c_void, CStr, CString};

use anyhow::{anyhow, bail, Context, Result};
use ash::ext::debug_utils as ext_debug;
use ash::ext::{mesh_shader, shader_object};
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{debug, error, info, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const DEVICE_EXTENSIONS: [&CStr; 3] = [swapchain::NAME, shader_object::NAME, mesh_shader::NAME];

#[cfg(debug_assertions)]
type DebugState = Option<(ext_debug::Instance, vk::DebugUtilsMessengerEXT)>;
#[cfg(not(debug_assertions))]
type DebugState = ();

/// Per-device ceilings for update-after-bind descriptors, read once at
/// selection time.
#[derive(Clone, Copy, Debug, Default)]
pub struct DescriptorLimits {
    pub sampled_images: u32,
    pub samplers: u32,
    pub storage_buffers: u32,
    pub uniform_buffers: u32,
    pub storage_images: u32,
}

struct Candidate {
    phys: vk::PhysicalDevice,
    queue_family: u32,
    score: u32,
}

/// Everything that lives exactly as long as the device.
pub struct GpuDevice {
    _entry: Entry,
    pub instance: Instance,
    debug: DebugState,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub phys: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub swapchain_loader: swapchain::Device,
    pub shader_object: shader_object::Device,
    pub mesh_shader: mesh_shader::Device,
    pub mem_props: vk::PhysicalDeviceMemoryProperties,
    pub limits: DescriptorLimits,
    pub name: String,
}

impl GpuDevice {
    /// # Safety
    /// The window and display handles must outlive the returned device.
    pub unsafe fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> Result<Self> {
        let entry = Entry::linked();
        let display_raw = display.display_handle()?.as_raw();
        let window_raw = window.window_handle()?.as_raw();

        let validation = validation && cfg!(debug_assertions) && has_validation_layer(&entry);
        let instance = create_instance(&entry, display_raw, validation)?;
        let debug = create_debug_messenger(&entry, &instance, validation);

        let surface = ash_window::create_surface(&entry, &instance, display_raw, window_raw, None)
            .context("create_surface")?;
        let surface_loader = surface::Instance::new(&entry, &instance);

        let picked = pick_device(&instance, &surface_loader, surface)?;
        let props = instance.get_physical_device_properties(picked.phys);
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_owned());
        info!(
            device = %name,
            api = %format_version(props.api_version),
            queue_family = picked.queue_family,
            "selected GPU"
        );

        let device = create_device(&instance, picked.phys, picked.queue_family)?;
        let queue = device.get_device_queue(picked.queue_family, 0);
        let swapchain_loader = swapchain::Device::new(&instance, &device);
        let shader_object = shader_object::Device::new(&instance, &device);
        let mesh_shader = mesh_shader::Device::new(&instance, &device);
        let mem_props = instance.get_physical_device_memory_properties(picked.phys);
        let limits = query_descriptor_limits(&instance, picked.phys);
        debug!(?limits, "update-after-bind descriptor limits");

        Ok(Self {
            _entry: entry,
            instance,
            debug,
            surface_loader,
            surface,
            phys: picked.phys,
            device,
            queue_family: picked.queue_family,
            queue,
            swapchain_loader,
            shader_object,
            mesh_shader,
            mem_props,
            limits,
            name,
        })
    }

    pub fn find_memory_type(&self, type_bits: u32, req: vk::MemoryPropertyFlags) -> Option<u32> {
        (0..self.mem_props.memory_type_count).find(|&i| {
            (type_bits & (1 << i)) != 0
                && self.mem_props.memory_types[i as usize]
                    .property_flags
                    .contains(req)
        })
    }
}

// Device before surface, surface before instance. Every child object is owned
// by something holding an Arc to this, so it is gone by the time we run.
impl Drop for GpuDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            destroy_debug_messenger(&mut self.debug);
            self.instance.destroy_instance(None);
        }
    }
}

fn format_version(v: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(v),
        vk::api_version_minor(v),
        vk::api_version_patch(v)
    )
}

unsafe fn has_validation_layer(entry: &Entry) -> bool {
    let layers = entry.enumerate_instance_layer_properties().unwrap_or_default();
    let found = layers
        .iter()
        .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
    if !found {
        warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
    }
    found
}

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle, validation: bool) -> Result<Instance> {
    let app = CString::new("Woven")?;
    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: 0,
        p_engine_name: app.as_ptr(),
        engine_version: 0,
        api_version: vk::API_VERSION_1_3,
        ..Default::default()
    };

    let mut extensions = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    if validation {
        extensions.push(ext_debug::NAME.as_ptr());
    }
    let layers = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    entry
        .create_instance(&create_info, None)
        .context("vkCreateInstance (Vulkan 1.3 required)")
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "{msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "{msg}");
    } else {
        debug!(target: "vulkan", "{msg}");
    }
    vk::FALSE
}

#[cfg(debug_assertions)]
unsafe fn create_debug_messenger(entry: &Entry, instance: &Instance, validation: bool) -> DebugState {
    if !validation {
        return None;
    }
    let loader = ext_debug::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    match loader.create_debug_utils_messenger(&ci, None) {
        Ok(messenger) => Some((loader, messenger)),
        Err(e) => {
            warn!("debug messenger unavailable: {e}");
            None
        }
    }
}

#[cfg(not(debug_assertions))]
unsafe fn create_debug_messenger(_entry: &Entry, _instance: &Instance, _validation: bool) -> DebugState {}

#[cfg(debug_assertions)]
unsafe fn destroy_debug_messenger(dbg: &mut DebugState) {
    if let Some((loader, messenger)) = dbg.take() {
        loader.destroy_debug_utils_messenger(messenger, None);
    }
}

#[cfg(not(debug_assertions))]
unsafe fn destroy_debug_messenger(_dbg: &mut DebugState) {}

unsafe fn pick_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<Candidate> {
    let devices = instance
        .enumerate_physical_devices()
        .context("enumerate_physical_devices")?;
    if devices.is_empty() {
        bail!("no Vulkan devices found");
    }

    let mut best: Option<Candidate> = None;
    for phys in devices {
        let props = instance.get_physical_device_properties(phys);
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if props.api_version < vk::API_VERSION_1_3 {
            info!(device = %name, api = %format_version(props.api_version), "skipping: Vulkan 1.3 required");
            continue;
        }
        let missing_ext = missing_extensions(instance, phys);
        if !missing_ext.is_empty() {
            info!(device = %name, missing = ?missing_ext, "skipping: extensions unavailable");
            continue;
        }
        let missing_feat = missing_features(instance, phys);
        if !missing_feat.is_empty() {
            info!(device = %name, missing = ?missing_feat, "skipping: features unavailable");
            continue;
        }
        let Some(queue_family) = graphics_present_family(instance, surface_loader, surface, phys) else {
            info!(device = %name, "skipping: no queue family can both draw and present");
            continue;
        };

        let score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 10,
        };
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(Candidate {
                phys,
                queue_family,
                score,
            });
        }
    }
    best.ok_or_else(|| anyhow!("no device supports mesh shaders, shader objects and bindless descriptors"))
}

unsafe fn missing_extensions(instance: &Instance, phys: vk::PhysicalDevice) -> Vec<&'static str> {
    let available = instance
        .enumerate_device_extension_properties(phys)
        .unwrap_or_default();
    DEVICE_EXTENSIONS
        .iter()
        .filter(|want| {
            !available
                .iter()
                .any(|e| e.extension_name_as_c_str() == Ok(**want))
        })
        .map(|want| want.to_str().unwrap_or("?"))
        .collect()
}

macro_rules! require {
    ($missing:ident, $($s:ident . $f:ident),+ $(,)?) => {
        $(
            if $s.$f != vk::TRUE {
                $missing.push(concat!(stringify!($s), ".", stringify!($f)));
            }
        )+
    };
}

unsafe fn missing_features(instance: &Instance, phys: vk::PhysicalDevice) -> Vec<&'static str> {
    let mut v12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut v13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT::default();
    let mut objects = vk::PhysicalDeviceShaderObjectFeaturesEXT::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut v12)
        .push_next(&mut v13)
        .push_next(&mut mesh)
        .push_next(&mut objects);
    instance.get_physical_device_features2(phys, &mut features);

    let mut missing = Vec::new();
    require!(
        missing,
        v12.descriptor_indexing,
        v12.runtime_descriptor_array,
        v12.descriptor_binding_partially_bound,
        v12.descriptor_binding_variable_descriptor_count,
        v12.descriptor_binding_update_unused_while_pending,
        v12.descriptor_binding_sampled_image_update_after_bind,
        v12.descriptor_binding_storage_image_update_after_bind,
        v12.descriptor_binding_storage_buffer_update_after_bind,
        v12.descriptor_binding_uniform_buffer_update_after_bind,
        v12.shader_sampled_image_array_non_uniform_indexing,
        v12.scalar_block_layout,
        v13.dynamic_rendering,
        v13.synchronization2,
        v13.maintenance4,
        mesh.task_shader,
        mesh.mesh_shader,
        objects.shader_object,
    );
    missing
}

unsafe fn graphics_present_family(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
    phys: vk::PhysicalDevice,
) -> Option<u32> {
    instance
        .get_physical_device_queue_family_properties(phys)
        .iter()
        .enumerate()
        .find_map(|(i, q)| {
            let i = i as u32;
            let graphics = q.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false);
            (graphics && present).then_some(i)
        })
}

unsafe fn query_descriptor_limits(instance: &Instance, phys: vk::PhysicalDevice) -> DescriptorLimits {
    let mut v12 = vk::PhysicalDeviceVulkan12Properties::default();
    let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut v12);
    instance.get_physical_device_properties2(phys, &mut props);
    DescriptorLimits {
        sampled_images: v12.max_descriptor_set_update_after_bind_sampled_images,
        samplers: v12.max_descriptor_set_update_after_bind_samplers,
        storage_buffers: v12.max_descriptor_set_update_after_bind_storage_buffers,
        uniform_buffers: v12.max_descriptor_set_update_after_bind_uniform_buffers,
        storage_images: v12.max_descriptor_set_update_after_bind_storage_images,
    }
}

unsafe fn create_device(instance: &Instance, phys: vk::PhysicalDevice, queue_family: u32) -> Result<ash::Device> {
    let mut v12 = vk::PhysicalDeviceVulkan12Features {
        descriptor_indexing: vk::TRUE,
        runtime_descriptor_array: vk::TRUE,
        descriptor_binding_partially_bound: vk::TRUE,
        descriptor_binding_variable_descriptor_count: vk::TRUE,
        descriptor_binding_update_unused_while_pending: vk::TRUE,
        descriptor_binding_sampled_image_update_after_bind: vk::TRUE,
        descriptor_binding_storage_image_update_after_bind: vk::TRUE,
        descriptor_binding_storage_buffer_update_after_bind: vk::TRUE,
        descriptor_binding_uniform_buffer_update_after_bind: vk::TRUE,
        shader_sampled_image_array_non_uniform_indexing: vk::TRUE,
        scalar_block_layout: vk::TRUE,
        ..Default::default()
    };
    let mut v13 = vk::PhysicalDeviceVulkan13Features {
        dynamic_rendering: vk::TRUE,
        synchronization2: vk::TRUE,
        maintenance4: vk::TRUE,
        ..Default::default()
    };
    let mut mesh = vk::PhysicalDeviceMeshShaderFeaturesEXT {
        task_shader: vk::TRUE,
        mesh_shader: vk::TRUE,
        ..Default::default()
    };
    let mut objects = vk::PhysicalDeviceShaderObjectFeaturesEXT {
        shader_object: vk::TRUE,
        ..Default::default()
    };
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut v12)
        .push_next(&mut v13)
        .push_next(&mut mesh)
        .push_next(&mut objects);

    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities);
    let extensions = DEVICE_EXTENSIONS.map(CStr::as_ptr);
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extensions)
        .push_next(&mut features);

    instance
        .create_device(phys, &create_info, None)
        .context("vkCreateDevice")
}
