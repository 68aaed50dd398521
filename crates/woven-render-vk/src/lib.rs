// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend. `VkRenderer` owns one instance of every component and
//! drives them once per frame.

macro_rules! vk_call {
    ($op:literal, $e:expr) => {
        $e.map_err(|err| $crate::map_vk_error($op, err))
    };
}
pub(crate) use vk_call;

mod barrier;
pub mod bindless;
pub mod device;
mod draw;
pub mod frame;
pub mod shader_object;
mod swapchain;

use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info};
use woven_render::shader::{ShaderCompiler, ShaderRequest, ShaderStage};
use woven_render::{
    BackendError, BindlessCategory, BindlessError, BindlessTable, CancelToken, ExtentSource, FrameError,
    FrameOutcome, FrameScheduler, FrameTicket, ImageUsage, PushBlock, RenderConfig, Renderer, ResizeRequests,
};

pub use bindless::{BindlessResource, VkDescriptorSink};
pub use device::GpuDevice;
pub use frame::VkFrameBackend;
pub use shader_object::ShaderObjects;

/// Stages compiled and turned into shader objects before the first frame.
pub const STARTUP_SHADERS: [ShaderRequest<'static>; 3] = [
    ShaderRequest {
        module: "mesh_demo",
        entry_point: "taskMain",
        stage: ShaderStage::Task,
    },
    ShaderRequest {
        module: "mesh_demo",
        entry_point: "meshMain",
        stage: ShaderStage::Mesh,
    },
    ShaderRequest {
        module: "mesh_demo",
        entry_point: "fragMain",
        stage: ShaderStage::Fragment,
    },
];

/// Table slots the renderer itself fills.
pub const LINEAR_SAMPLER_SLOT: u32 = 0;
pub const HDR_STORAGE_SLOT: u32 = 0;

pub(crate) fn map_vk_error(op: &'static str, err: vk::Result) -> BackendError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost(op),
        vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost(op),
        other => BackendError::call(op, other),
    }
}

fn table_error(err: BindlessError) -> FrameError {
    match err {
        BindlessError::Backend(e) => FrameError::Backend(e),
        other => FrameError::Backend(BackendError::call("bindless table", other)),
    }
}

unsafe fn create_linear_sampler(gpu: &GpuDevice) -> Result<vk::Sampler, BackendError> {
    let info = vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: vk::Filter::LINEAR,
        min_filter: vk::Filter::LINEAR,
        mipmap_mode: vk::SamplerMipmapMode::LINEAR,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        max_lod: vk::LOD_CLAMP_NONE,
        ..Default::default()
    };
    vk_call!("vkCreateSampler", gpu.device.create_sampler(&info, None))
}

// Field order is drop order: shader objects and the table go before the
// scheduler's backend, and the device outlives all of them through its Arc.
pub struct VkRenderer {
    shaders: ShaderObjects,
    table: BindlessTable<VkDescriptorSink>,
    scheduler: FrameScheduler<VkFrameBackend, Box<dyn ExtentSource>>,
    sampler: vk::Sampler,
    gpu: Arc<GpuDevice>,
    clear: [f32; 4],
    /// Rebuild count the HDR storage slot was last written for.
    hdr_slot_rebuild: Option<u64>,
}

impl VkRenderer {
    pub fn device_name(&self) -> &str {
        &self.gpu.name
    }

    pub fn frame_number(&self) -> u64 {
        self.scheduler.frame_number()
    }

    pub fn rebuild_count(&self) -> u64 {
        self.scheduler.rebuild_count()
    }

    /// Token that aborts any wait the renderer is blocked in.
    pub fn cancel_token(&self) -> CancelToken {
        self.scheduler.cancel_token().clone()
    }

    pub fn table(&mut self) -> &mut BindlessTable<VkDescriptorSink> {
        &mut self.table
    }

    /// Points the storage-image slot at the current HDR target. Re-run after
    /// every chain rebuild since the target is recreated with it.
    fn refresh_target_slots(&mut self) -> Result<(), FrameError> {
        let rebuilds = self.scheduler.rebuild_count();
        if self.hdr_slot_rebuild == Some(rebuilds) {
            return Ok(());
        }
        let view = self
            .scheduler
            .backend()
            .hdr_view()
            .ok_or(FrameError::NoSwapchain)?;
        self.table
            .write(
                BindlessCategory::StorageImage,
                HDR_STORAGE_SLOT,
                &BindlessResource::StorageImage(view),
            )
            .map_err(table_error)?;
        self.hdr_slot_rebuild = Some(rebuilds);
        debug!(rebuilds, "HDR storage slot rewritten");
        Ok(())
    }

    fn record(&mut self, ticket: &FrameTicket, time: f32) -> Result<(), FrameError> {
        let backend = self.scheduler.backend();
        let cmd = backend.command_buffer(ticket.slot());
        let depth_view = backend.depth_view().ok_or(FrameError::NoSwapchain)?;
        let hdr_view = backend.hdr_view().ok_or(FrameError::NoSwapchain)?;
        let extent = self.scheduler.extent().ok_or(FrameError::NoSwapchain)?;

        let depth = self.scheduler.depth_target()?;
        let hdr = self.scheduler.hdr_target()?;
        let present = self.scheduler.present_image(ticket)?;
        let hdr_image = self.scheduler.tracker().handle(hdr)?;
        let present_image = self.scheduler.tracker().handle(present)?;

        // Both targets are cleared on load.
        self.scheduler.discard(depth)?;
        self.scheduler.transition(ticket, depth, ImageUsage::DepthAttachment)?;
        self.scheduler.discard(hdr)?;
        self.scheduler.transition(ticket, hdr, ImageUsage::ColorAttachment)?;

        let push = PushBlock::new(time, ticket.frame_number(), extent.width, extent.height);
        // Bound outside the rendering scope so a failure leaves no pass open.
        self.table.bind_for(&cmd).map_err(table_error)?;
        unsafe {
            draw::begin_rendering(&self.gpu, cmd, extent, hdr_view, depth_view, self.clear);
            self.shaders.bind_graphics(cmd);
            draw::set_draw_state(&self.gpu, cmd, extent);
            self.gpu.device.cmd_push_constants(
                cmd,
                self.table.sink().pipeline_layout(),
                vk::ShaderStageFlags::ALL,
                0,
                push.as_bytes(),
            );
            self.gpu.mesh_shader.cmd_draw_mesh_tasks(cmd, 1, 1, 1);
            self.gpu.device.cmd_end_rendering(cmd);
        }

        self.scheduler.transition(ticket, hdr, ImageUsage::TransferSrc)?;
        // The blit overwrites every texel.
        self.scheduler.discard(present)?;
        self.scheduler.transition(ticket, present, ImageUsage::TransferDst)?;
        unsafe { draw::blit_to_present(&self.gpu, cmd, hdr_image, present_image, extent) };
        self.scheduler.transition(ticket, present, ImageUsage::Presented)?;
        Ok(())
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        extent: Box<dyn ExtentSource>,
        config: &RenderConfig,
    ) -> Result<Self> {
        let gpu = Arc::new(unsafe { GpuDevice::new(window, display, config.validation)? });

        let mut compiler = ShaderCompiler::new(&config.shader).context("starting the shader compiler")?;
        let compiled = compiler
            .compile_all(&STARTUP_SHADERS)
            .context("compiling startup shaders")?;

        let sink = VkDescriptorSink::new(gpu.clone(), &config.bindless).context("creating the bindless set")?;
        let shaders =
            ShaderObjects::new(gpu.clone(), &compiled, sink.set_layout()).context("creating shader objects")?;
        let mut table = BindlessTable::new(config.bindless, sink)?;

        let backend = VkFrameBackend::new(gpu.clone()).context("creating frame slots")?;
        let scheduler = FrameScheduler::new(backend, extent, config.timeouts, CancelToken::new())
            .context("building the initial swapchain")?;

        let sampler = unsafe { create_linear_sampler(&gpu)? };
        if let Err(e) = table.write(
            BindlessCategory::Sampler,
            LINEAR_SAMPLER_SLOT,
            &BindlessResource::Sampler(sampler),
        ) {
            unsafe { gpu.device.destroy_sampler(sampler, None) };
            return Err(e.into());
        }

        info!(device = %gpu.name, shaders = shaders.len(), "renderer ready");
        Ok(Self {
            shaders,
            table,
            scheduler,
            sampler,
            gpu,
            clear: config.clear_color,
            hdr_slot_rebuild: None,
        })
    }

    fn resize_handle(&self) -> ResizeRequests {
        self.scheduler.resize_handle()
    }

    fn render(&mut self, time: f32) -> Result<FrameOutcome<()>, FrameError> {
        let ticket = match self.scheduler.begin_frame()? {
            FrameOutcome::Ready(ticket) => ticket,
            FrameOutcome::Retry => return Ok(FrameOutcome::Retry),
        };
        if let Err(e) = self.refresh_target_slots().and_then(|()| self.record(&ticket, time)) {
            error!(frame = ticket.frame_number(), "recording failed: {e}");
            if let Err(abandon) = self.scheduler.abandon_frame(ticket) {
                error!("abandoning frame: {abandon}");
            }
            return Err(e);
        }
        self.scheduler.end_frame(ticket)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
    }
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        if let Err(e) = self.scheduler.shutdown() {
            error!("renderer shutdown: {e}");
        }
        unsafe { self.gpu.device.destroy_sampler(self.sampler, None) };
    }
}
