// SPDX-License-Identifier: CEPL-1.0
//! Presentable chain and the extent-dependent render targets.

use ash::vk;
use tracing::{debug, info};
use woven_render::{BackendError, RenderSize};

use crate::device::GpuDevice;
use crate::vk_call;

pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const SRGB: [vk::Format; 2] = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];
    let nonlinear = |f: &&vk::SurfaceFormatKHR| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;

    SRGB.iter()
        .find_map(|want| formats.iter().filter(nonlinear).find(|f| f.format == *want))
        .or_else(|| {
            formats
                .iter()
                .filter(nonlinear)
                .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
        })
        .or_else(|| formats.first())
        .copied()
}

/// Lowest-latency mode the surface offers; FIFO is always there.
pub(crate) fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface-chosen extent when it has one, otherwise the window size clamped
/// to the surface bounds. A zero-sized window stays zero so the caller parks.
pub(crate) fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> RenderSize {
    if caps.current_extent.width != u32::MAX {
        RenderSize::new(caps.current_extent.width, caps.current_extent.height)
    } else if want.is_empty() {
        RenderSize::new(0, 0)
    } else {
        RenderSize::new(
            want.width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            want.height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        )
    }
}

/// One more than the minimum, so the CPU is not stalled on the compositor.
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count + 1;
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

pub(crate) const fn to_extent(size: RenderSize) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

const fn color_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

unsafe fn create_view(
    gpu: &GpuDevice,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView, BackendError> {
    let view_ci = vk::ImageViewCreateInfo {
        s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
        image,
        view_type: vk::ImageViewType::TYPE_2D,
        format,
        subresource_range: color_range(aspect),
        ..Default::default()
    };
    vk_call!("vkCreateImageView", gpu.device.create_image_view(&view_ci, None))
}

pub(crate) struct VkSwapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: RenderSize,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    /// Signalled by the submit that renders into the image of the same index.
    pub render_finished: Vec<vk::Semaphore>,
}

impl VkSwapchain {
    pub unsafe fn create(gpu: &GpuDevice, extent: RenderSize) -> Result<Self, BackendError> {
        let caps = vk_call!(
            "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
            gpu.surface_loader
                .get_physical_device_surface_capabilities(gpu.phys, gpu.surface)
        )?;
        let formats = vk_call!(
            "vkGetPhysicalDeviceSurfaceFormatsKHR",
            gpu.surface_loader
                .get_physical_device_surface_formats(gpu.phys, gpu.surface)
        )?;
        let modes = vk_call!(
            "vkGetPhysicalDeviceSurfacePresentModesKHR",
            gpu.surface_loader
                .get_physical_device_surface_present_modes(gpu.phys, gpu.surface)
        )?;

        let format = choose_surface_format(&formats).ok_or(BackendError::Unsupported("surface format"))?;
        let present_mode = choose_present_mode(&modes);
        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST;
        if !caps.supported_usage_flags.contains(usage) {
            return Err(BackendError::Unsupported("transfer destination usage"));
        }

        let create_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: gpu.surface,
            min_image_count: image_count(&caps),
            image_format: format.format,
            image_color_space: format.color_space,
            image_extent: to_extent(extent),
            image_array_layers: 1,
            image_usage: usage,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            ..Default::default()
        };
        let handle = vk_call!(
            "vkCreateSwapchainKHR",
            gpu.swapchain_loader.create_swapchain(&create_info, None)
        )?;

        let mut chain = Self {
            handle,
            format,
            extent,
            images: Vec::new(),
            views: Vec::new(),
            render_finished: Vec::new(),
        };
        if let Err(e) = chain.fill(gpu) {
            chain.destroy(gpu);
            return Err(e);
        }
        info!(
            width = extent.width,
            height = extent.height,
            images = chain.images.len(),
            format = ?format.format,
            present_mode = ?present_mode,
            "swapchain created"
        );
        Ok(chain)
    }

    unsafe fn fill(&mut self, gpu: &GpuDevice) -> Result<(), BackendError> {
        self.images = vk_call!(
            "vkGetSwapchainImagesKHR",
            gpu.swapchain_loader.get_swapchain_images(self.handle)
        )?;
        let sem_ci = vk::SemaphoreCreateInfo::default();
        for &image in &self.images {
            self.views
                .push(create_view(gpu, image, self.format.format, vk::ImageAspectFlags::COLOR)?);
            self.render_finished
                .push(vk_call!("vkCreateSemaphore", gpu.device.create_semaphore(&sem_ci, None))?);
        }
        Ok(())
    }

    pub unsafe fn destroy(&mut self, gpu: &GpuDevice) {
        for sem in self.render_finished.drain(..) {
            gpu.device.destroy_semaphore(sem, None);
        }
        for view in self.views.drain(..) {
            gpu.device.destroy_image_view(view, None);
        }
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            gpu.swapchain_loader.destroy_swapchain(self.handle, None);
            self.handle = vk::SwapchainKHR::null();
        }
        debug!("swapchain destroyed");
    }
}

pub(crate) const HDR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

pub(crate) struct TargetImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

impl TargetImage {
    unsafe fn create(
        gpu: &GpuDevice,
        extent: RenderSize,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self, BackendError> {
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = vk_call!("vkCreateImage", gpu.device.create_image(&img_ci, None))?;

        let mem_req = gpu.device.get_image_memory_requirements(image);
        let Some(memory_type_index) =
            gpu.find_memory_type(mem_req.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        else {
            gpu.device.destroy_image(image, None);
            return Err(BackendError::Unsupported("device-local memory type"));
        };
        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: mem_req.size,
            memory_type_index,
            ..Default::default()
        };
        let memory = match vk_call!("vkAllocateMemory", gpu.device.allocate_memory(&alloc, None)) {
            Ok(m) => m,
            Err(e) => {
                gpu.device.destroy_image(image, None);
                return Err(e);
            }
        };
        let mut target = Self {
            image,
            memory,
            view: vk::ImageView::null(),
        };
        let bound = vk_call!("vkBindImageMemory", gpu.device.bind_image_memory(image, memory, 0))
            .and_then(|()| create_view(gpu, image, format, aspect));
        match bound {
            Ok(view) => {
                target.view = view;
                Ok(target)
            }
            Err(e) => {
                target.destroy(gpu);
                Err(e)
            }
        }
    }

    unsafe fn destroy(&mut self, gpu: &GpuDevice) {
        if self.view != vk::ImageView::null() {
            gpu.device.destroy_image_view(self.view, None);
        }
        gpu.device.destroy_image(self.image, None);
        gpu.device.free_memory(self.memory, None);
        self.view = vk::ImageView::null();
    }
}

unsafe fn pick_depth_format(gpu: &GpuDevice) -> Option<vk::Format> {
    // Depth only; nothing here uses stencil.
    [
        vk::Format::D32_SFLOAT,
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D16_UNORM,
    ]
    .into_iter()
    .find(|&fmt| {
        gpu.instance
            .get_physical_device_format_properties(gpu.phys, fmt)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

/// Depth buffer plus the HDR color target the scene renders into before it
/// is blitted to the swapchain image.
pub(crate) struct RenderTargets {
    pub depth: TargetImage,
    pub hdr: TargetImage,
    pub extent: RenderSize,
}

impl RenderTargets {
    pub unsafe fn create(gpu: &GpuDevice, extent: RenderSize) -> Result<Self, BackendError> {
        let depth_format = pick_depth_format(gpu).ok_or(BackendError::Unsupported("depth format"))?;
        let mut depth = TargetImage::create(
            gpu,
            extent,
            depth_format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?;
        let hdr = TargetImage::create(
            gpu,
            extent,
            HDR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC,
            vk::ImageAspectFlags::COLOR,
        );
        let hdr = match hdr {
            Ok(hdr) => hdr,
            Err(e) => {
                depth.destroy(gpu);
                return Err(e);
            }
        };
        debug!(?depth_format, width = extent.width, height = extent.height, "render targets created");
        Ok(Self { depth, hdr, extent })
    }

    pub unsafe fn destroy(&mut self, gpu: &GpuDevice) {
        self.hdr.destroy(gpu);
        self.depth.destroy(gpu);
    }
}
