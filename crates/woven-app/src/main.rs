// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
mod config;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use woven_core::init_tracing;
use woven_platform::winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};
use woven_platform::WindowSignals;
use woven_render::{FrameOutcome, Renderer};
use woven_render_vk::VkRenderer;

use crate::config::{load_cfg, AppCfg};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; missing means defaults
    #[arg(long, default_value = "woven.toml")]
    config: PathBuf,
    /// Directory searched first for shader modules
    #[arg(long)]
    shader_dir: Option<PathBuf>,
}

// The renderer is declared first so it drops before the window it draws to.
struct App {
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    signals: Option<WindowSignals>,
    cfg: AppCfg,
    started: Instant,
    exiting: bool,
    failure: Option<anyhow::Error>,

    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        let now = Instant::now();
        Self {
            renderer: None,
            window: None,
            signals: None,
            cfg,
            started: now,
            exiting: false,
            failure: None,
            frames: 0,
            last_fps_instant: now,
        }
    }

    fn paused(&self) -> bool {
        self.signals.as_ref().map_or(true, WindowSignals::is_paused)
    }

    fn request_redraw(&self) {
        if let Some(w) = &self.window {
            w.request_redraw();
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        self.failure = Some(err);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        self.renderer = None;
        self.window = None;
        event_loop.exit();
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.cfg.window.title.clone())
            .with_inner_size(PhysicalSize::new(self.cfg.window.width, self.cfg.window.height));
        let window = event_loop.create_window(attrs)?;
        let signals = WindowSignals::new(window.inner_size());

        let mut renderer = VkRenderer::new(&window, &window, Box::new(signals.clone()), &self.cfg.render)?;
        renderer.set_clear_color(self.cfg.render.clear_color);
        // Resized events raise the rebuild flag through this copy.
        let signals = signals.with_resize_requests(renderer.resize_handle());
        info!(device = renderer.device_name(), "vk renderer up");

        self.signals = Some(signals);
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        match renderer.render(self.started.elapsed().as_secs_f32()) {
            Ok(FrameOutcome::Ready(())) => {
                // count only frames that were actually presented
                self.frames = self.frames.saturating_add(1);
            }
            Ok(FrameOutcome::Retry) => self.request_redraw(),
            Err(e) => {
                if e.is_programmer_error() {
                    error!("renderer misuse: {e}");
                }
                self.fail(event_loop, e.into());
            }
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e.context("renderer init failed"));
                return;
            }
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        info!("resumed → paused={}", self.paused());
        if !self.paused() {
            self.request_redraw();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                if let Some(signals) = &self.signals {
                    signals.on_resized(new_size);
                }
                info!("Resized → {}x{} (paused={})", new_size.width, new_size.height, self.paused());
                if !self.paused() {
                    self.request_redraw();
                }
            }

            WindowEvent::Occluded(occluded) => {
                if let Some(signals) = &self.signals {
                    signals.on_occluded(occluded);
                }
                info!("Occluded={} → paused={}", occluded, self.paused());
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused() {
                    return;
                }
                self.draw(event_loop);
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }
        if self.paused() {
            // zero-sized or occluded: sleep until the window changes
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        self.request_redraw();

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            let rebuilds = self.renderer.as_ref().map_or(0, VkRenderer::rebuild_count);
            info!("fps ~ {} (swapchain rebuilds: {rebuilds})", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = load_cfg(&args.config);
    if let Some(dir) = args.shader_dir {
        cfg.render.shader.dir = Some(dir);
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App::new(cfg);
    event_loop.run_app(&mut app)?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
