// SPDX-License-Identifier: CEPL-1.0
//! Vulkan half of the frame scheduler: per-slot command buffers, semaphores
//! and fences, plus the swapchain and render targets they draw into.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, warn};
use woven_render::image_state::ImageBarrier;
use woven_render::{
    AcquireResult, BackendError, ChainImages, FrameBackend, PresentResult, RenderSize, SwapchainBackend,
    TargetImages, FRAMES_IN_FLIGHT,
};

use crate::device::GpuDevice;
use crate::swapchain::{extent_from_caps, RenderTargets, VkSwapchain};
use crate::{barrier, vk_call};

/// Everything one frame in flight owns.
struct FrameSlot {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    image_available: vk::Semaphore,
    in_flight: vk::Fence,
    /// Image index acquired for the frame currently using this slot.
    acquired: Option<u32>,
}

impl FrameSlot {
    unsafe fn create(gpu: &GpuDevice) -> Result<Self, BackendError> {
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: gpu.queue_family,
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            ..Default::default()
        };
        let pool = vk_call!("vkCreateCommandPool", gpu.device.create_command_pool(&pool_info, None))?;
        let mut slot = Self {
            pool,
            cmd: vk::CommandBuffer::null(),
            image_available: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
            acquired: None,
        };
        if let Err(e) = slot.fill(gpu) {
            slot.destroy(gpu);
            return Err(e);
        }
        Ok(slot)
    }

    unsafe fn fill(&mut self, gpu: &GpuDevice) -> Result<(), BackendError> {
        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: self.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        self.cmd = vk_call!(
            "vkAllocateCommandBuffers",
            gpu.device.allocate_command_buffers(&alloc_info)
        )?
        .into_iter()
        .next()
        .ok_or(BackendError::Unsupported("command buffer"))?;

        self.image_available = vk_call!(
            "vkCreateSemaphore",
            gpu.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        )?;
        // Signaled so the first wait on a fresh slot returns at once.
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        self.in_flight = vk_call!("vkCreateFence", gpu.device.create_fence(&fence_ci, None))?;
        Ok(())
    }

    unsafe fn destroy(&mut self, gpu: &GpuDevice) {
        if self.in_flight != vk::Fence::null() {
            gpu.device.destroy_fence(self.in_flight, None);
        }
        if self.image_available != vk::Semaphore::null() {
            gpu.device.destroy_semaphore(self.image_available, None);
        }
        // Frees the command buffer with it.
        gpu.device.destroy_command_pool(self.pool, None);
    }
}

pub struct VkFrameBackend {
    gpu: Arc<GpuDevice>,
    slots: Vec<FrameSlot>,
    swapchain: Option<VkSwapchain>,
    targets: Option<RenderTargets>,
}

impl VkFrameBackend {
    pub fn new(gpu: Arc<GpuDevice>) -> Result<Self, BackendError> {
        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            match unsafe { FrameSlot::create(&gpu) } {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for mut slot in slots {
                        unsafe { slot.destroy(&gpu) };
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            gpu,
            slots,
            swapchain: None,
            targets: None,
        })
    }

    pub fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    /// The command buffer the slot records into between `begin_frame` and
    /// `end_frame`.
    pub fn command_buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.slots[slot].cmd
    }

    pub fn depth_view(&self) -> Option<vk::ImageView> {
        self.targets.as_ref().map(|t| t.depth.view)
    }

    pub fn hdr_view(&self) -> Option<vk::ImageView> {
        self.targets.as_ref().map(|t| t.hdr.view)
    }

    fn chain(&self, op: &'static str) -> Result<&VkSwapchain, BackendError> {
        self.swapchain.as_ref().ok_or(BackendError::Call {
            op,
            message: "no swapchain".into(),
        })
    }
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

impl SwapchainBackend for VkFrameBackend {
    type Image = vk::Image;

    fn wait_idle(&mut self) -> Result<(), BackendError> {
        unsafe { vk_call!("vkDeviceWaitIdle", self.gpu.device.device_wait_idle()) }
    }

    fn surface_extent(&mut self, hint: RenderSize) -> Result<RenderSize, BackendError> {
        let caps = unsafe {
            vk_call!(
                "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
                self.gpu
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.gpu.phys, self.gpu.surface)
            )?
        };
        Ok(extent_from_caps(&caps, hint))
    }

    fn create_swapchain(&mut self, extent: RenderSize) -> Result<ChainImages<vk::Image>, BackendError> {
        if let Some(mut old) = self.swapchain.take() {
            warn!("swapchain created while another was alive; destroying the old one");
            unsafe { old.destroy(&self.gpu) };
        }
        let chain = unsafe { VkSwapchain::create(&self.gpu, extent)? };
        let images = ChainImages {
            images: chain.images.clone(),
            extent: chain.extent,
        };
        self.swapchain = Some(chain);
        Ok(images)
    }

    fn destroy_swapchain(&mut self) {
        if let Some(mut chain) = self.swapchain.take() {
            unsafe { chain.destroy(&self.gpu) };
        }
        for slot in &mut self.slots {
            slot.acquired = None;
        }
    }

    fn create_targets(&mut self, extent: RenderSize) -> Result<TargetImages<vk::Image>, BackendError> {
        self.destroy_targets();
        let targets = unsafe { RenderTargets::create(&self.gpu, extent)? };
        let images = TargetImages {
            depth: targets.depth.image,
            hdr: targets.hdr.image,
        };
        self.targets = Some(targets);
        Ok(images)
    }

    fn destroy_targets(&mut self) {
        if let Some(mut targets) = self.targets.take() {
            unsafe { targets.destroy(&self.gpu) };
        }
    }
}

impl FrameBackend for VkFrameBackend {
    fn wait_slot(&mut self, slot: usize, timeout: Duration) -> Result<bool, BackendError> {
        let fence = self.slots[slot].in_flight;
        match unsafe { self.gpu.device.wait_for_fences(&[fence], true, timeout_ns(timeout)) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(crate::map_vk_error("vkWaitForFences", e)),
        }
    }

    fn reset_slot(&mut self, slot: usize) -> Result<(), BackendError> {
        let s = &self.slots[slot];
        unsafe {
            vk_call!("vkResetFences", self.gpu.device.reset_fences(&[s.in_flight]))?;
            vk_call!(
                "vkResetCommandPool",
                self.gpu
                    .device
                    .reset_command_pool(s.pool, vk::CommandPoolResetFlags::empty())
            )
        }
    }

    fn acquire_image(&mut self, slot: usize, timeout: Duration) -> Result<AcquireResult, BackendError> {
        let handle = self.chain("vkAcquireNextImageKHR")?.handle;
        let semaphore = self.slots[slot].image_available;
        let result = unsafe {
            self.gpu.swapchain_loader.acquire_next_image(
                handle,
                timeout_ns(timeout),
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => {
                self.slots[slot].acquired = Some(index);
                Ok(AcquireResult::Acquired { index, suboptimal })
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(AcquireResult::NotReady),
            Err(e) => Err(crate::map_vk_error("vkAcquireNextImageKHR", e)),
        }
    }

    fn begin_commands(&mut self, slot: usize) -> Result<(), BackendError> {
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            vk_call!(
                "vkBeginCommandBuffer",
                self.gpu.device.begin_command_buffer(self.slots[slot].cmd, &begin)
            )
        }
    }

    fn record_barrier(&mut self, slot: usize, b: &ImageBarrier<vk::Image>) {
        unsafe { barrier::record(&self.gpu.device, self.slots[slot].cmd, b) };
    }

    fn end_commands(&mut self, slot: usize) -> Result<(), BackendError> {
        unsafe {
            vk_call!(
                "vkEndCommandBuffer",
                self.gpu.device.end_command_buffer(self.slots[slot].cmd)
            )
        }
    }

    fn submit(&mut self, slot: usize) -> Result<(), BackendError> {
        let s = &self.slots[slot];
        let index = s.acquired.ok_or(BackendError::Call {
            op: "vkQueueSubmit2",
            message: "slot has no acquired image".into(),
        })?;
        let render_finished = *self
            .chain("vkQueueSubmit2")?
            .render_finished
            .get(index as usize)
            .ok_or(BackendError::Unsupported("image index"))?;

        // The first writes to the swapchain image are the blit and the color
        // output, so the acquire is waited on at both.
        let wait = vk::SemaphoreSubmitInfo {
            s_type: vk::StructureType::SEMAPHORE_SUBMIT_INFO,
            semaphore: s.image_available,
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags2::ALL_TRANSFER,
            ..Default::default()
        };
        let signal = vk::SemaphoreSubmitInfo {
            s_type: vk::StructureType::SEMAPHORE_SUBMIT_INFO,
            semaphore: render_finished,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        };
        let cmd = vk::CommandBufferSubmitInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_SUBMIT_INFO,
            command_buffer: s.cmd,
            ..Default::default()
        };
        let submit = vk::SubmitInfo2 {
            s_type: vk::StructureType::SUBMIT_INFO_2,
            wait_semaphore_info_count: 1,
            p_wait_semaphore_infos: &wait,
            command_buffer_info_count: 1,
            p_command_buffer_infos: &cmd,
            signal_semaphore_info_count: 1,
            p_signal_semaphore_infos: &signal,
            ..Default::default()
        };
        unsafe {
            vk_call!(
                "vkQueueSubmit2",
                self.gpu.device.queue_submit2(self.gpu.queue, &[submit], s.in_flight)
            )
        }
    }

    fn release_slot(&mut self, slot: usize, recording: bool) -> Result<(), BackendError> {
        let s = &mut self.slots[slot];
        s.acquired = None;
        if recording {
            unsafe { vk_call!("vkEndCommandBuffer", self.gpu.device.end_command_buffer(s.cmd))? };
        }
        // An empty batch that waits on the acquire and signals the fence
        // leaves the slot exactly as a completed frame would.
        let wait = vk::SemaphoreSubmitInfo {
            s_type: vk::StructureType::SEMAPHORE_SUBMIT_INFO,
            semaphore: s.image_available,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        };
        let submit = vk::SubmitInfo2 {
            s_type: vk::StructureType::SUBMIT_INFO_2,
            wait_semaphore_info_count: 1,
            p_wait_semaphore_infos: &wait,
            ..Default::default()
        };
        unsafe {
            vk_call!(
                "vkQueueSubmit2",
                self.gpu.device.queue_submit2(self.gpu.queue, &[submit], s.in_flight)
            )
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentResult, BackendError> {
        let chain = self.chain("vkQueuePresentKHR")?;
        let wait = *chain
            .render_finished
            .get(image_index as usize)
            .ok_or(BackendError::Unsupported("image index"))?;
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &chain.handle,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let result = unsafe { self.gpu.swapchain_loader.queue_present(self.gpu.queue, &present) };
        self.slots[slot].acquired = None;
        match result {
            Ok(false) => Ok(PresentResult::Presented),
            Ok(true) => Ok(PresentResult::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!(image_index, "present reported out of date");
                Ok(PresentResult::OutOfDate)
            }
            Err(e) => Err(crate::map_vk_error("vkQueuePresentKHR", e)),
        }
    }
}

// STRICT TEARDOWN ORDER: device idle, then the chain and targets, then the
// per-slot objects. The device itself goes when the last Arc drops.
impl Drop for VkFrameBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.gpu.device.device_wait_idle();
        }
        self.destroy_targets();
        self.destroy_swapchain();
        for mut slot in self.slots.drain(..) {
            unsafe { slot.destroy(&self.gpu) };
        }
    }
}
