// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use flex_core::init_tracing;
use flex_platform::{PlatformWindow, WindowDesc, WindowSignal};
use flex_render::{Mesh, RenderApi, RenderSize, RenderWindow, Renderer};
use flex_render_vk::{MeshBuffer, RendererConfig, VkRenderer, VkVsyncMode};
use glam::{Mat4, Vec3};
use tracing::{error, info, warn};

use flex_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::WindowId,
};

use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf, time::Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; missing or invalid means defaults
    #[arg(long, default_value = "flex.toml")]
    config: PathBuf,
    /// Exit after this many presented frames
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
struct WindowCfg {
    title: String,
    width: u32,
    height: u32,
    fullscreen: bool,
}

impl Default for WindowCfg {
    fn default() -> Self {
        let d = WindowDesc::default();
        WindowCfg {
            title: d.title,
            width: d.width,
            height: d.height,
            fullscreen: d.fullscreen,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum VsyncMode {
    Fifo,
    #[default]
    Mailbox,
    Immediate,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
struct RenderCfg {
    clear_color: [f32; 4],
    vsync_mode: VsyncMode,
    /// Unset keeps the build default (on in debug builds).
    validation: Option<bool>,
    acquire_timeout_ms: u64,
}

impl Default for RenderCfg {
    fn default() -> Self {
        let d = RendererConfig::default();
        RenderCfg {
            clear_color: d.clear_color,
            vsync_mode: VsyncMode::Mailbox,
            validation: None,
            acquire_timeout_ms: d.acquire_timeout_ns / 1_000_000,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
struct AppCfg {
    window: WindowCfg,
    render: RenderCfg,
}

impl AppCfg {
    fn window_desc(&self) -> WindowDesc {
        WindowDesc {
            title: self.window.title.clone(),
            width: self.window.width,
            height: self.window.height,
            fullscreen: self.window.fullscreen,
            render_api: RenderApi::Vulkan,
        }
    }

    /// File values over defaults; `FLEX_*` environment variables win over both.
    fn renderer_config(&self) -> RendererConfig {
        let d = RendererConfig::default();
        RendererConfig {
            vsync_mode: match self.render.vsync_mode {
                VsyncMode::Fifo => VkVsyncMode::Fifo,
                VsyncMode::Mailbox => VkVsyncMode::Mailbox,
                VsyncMode::Immediate => VkVsyncMode::Immediate,
            },
            validation: self.render.validation.unwrap_or(d.validation),
            acquire_timeout_ns: self.render.acquire_timeout_ms.saturating_mul(1_000_000),
            clear_color: self.render.clear_color,
        }
        .with_env()
    }
}

fn parse_cfg(text: &str) -> AppCfg {
    match toml::from_str::<AppCfg>(text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("config: {e}; using defaults");
            AppCfg::default()
        }
    }
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s),
        Err(_) => {
            info!("no config at {}, using defaults", path.display());
            AppCfg::default()
        }
    }
}

/// Camera looking at the origin from +Z, Vulkan clip space (Y down, depth 0..1).
fn view_proj(size: RenderSize) -> Mat4 {
    let aspect = if size.is_empty() {
        1.0
    } else {
        size.width as f32 / size.height as f32
    };
    let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
    proj.y_axis.y *= -1.0;
    proj * Mat4::look_at_rh(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y)
}

struct App {
    cfg: AppCfg,
    frame_limit: Option<u64>,

    // Field order is drop order: renderer before the window it draws into.
    mesh_buffer: Option<MeshBuffer>,
    renderer: Option<VkRenderer>,
    window: Option<PlatformWindow>,

    mesh: Mesh,
    started: Instant,
    presented: u64,
    fps_frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: AppCfg, frame_limit: Option<u64>) -> Self {
        let now = Instant::now();
        App {
            cfg,
            frame_limit,
            mesh_buffer: None,
            renderer: None,
            window: None,
            mesh: Mesh::cube(),
            started: now,
            presented: 0,
            fps_frames: 0,
            last_fps_instant: now,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = PlatformWindow::create(event_loop, &self.cfg.window_desc())?;
        let mut renderer = VkRenderer::with_config(&window, self.cfg.renderer_config())?;
        let buffer = renderer.create_mesh_buffer(&self.mesh)?;
        window.request_redraw();

        self.mesh_buffer = Some(buffer);
        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    /// One acquire → record → present cycle. Two copies of the cube, one per shader.
    fn draw_frame(&mut self) -> Result<()> {
        let (Some(renderer), Some(buffer), Some(window)) =
            (self.renderer.as_mut(), self.mesh_buffer.as_ref(), self.window.as_ref())
        else {
            return Ok(());
        };

        if !renderer.acquire_next_frame()? {
            return Ok(());
        }

        let t = self.started.elapsed().as_secs_f32();
        let vp = view_proj(window.drawable_size());
        let spin = Mat4::from_rotation_y(t) * Mat4::from_rotation_x(t * 0.5);

        renderer.start_draw()?;
        for (shader_id, x) in [(flex_render::DEFAULT_SHADER_ID, -0.8f32), (1, 0.8)] {
            self.mesh.shader_id = shader_id;
            self.mesh.transform = vp * Mat4::from_translation(Vec3::new(x, 0.0, 0.0)) * spin;
            renderer.draw_mesh(&self.mesh, buffer)?;
        }
        renderer.end_draw()?;
        renderer.present()?;

        self.presented += 1;
        self.fps_frames += 1;
        Ok(())
    }

    /// Drain the GPU, free the mesh buffer, then drop renderer and window in that order.
    fn shutdown(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.stop() {
                error!("stop: {e:#}");
            }
            if let Some(buffer) = self.mesh_buffer.take() {
                if let Err(e) = renderer.destroy_mesh_buffer(buffer) {
                    error!("destroy_mesh_buffer: {e:#}");
                }
            }
        }
        self.window = None;
        info!("shutdown after {} presented frames", self.presented);
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            error!("startup failed: {e:#}");
            self.shutdown();
            event_loop.exit();
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        let Some(window) = self.window.as_mut() else {
            return;
        };
        if window_id != window.id() {
            return;
        }

        match window.handle_event(&event) {
            WindowSignal::Exit => {
                info!("CloseRequested");
                self.shutdown();
                event_loop.exit();
            }
            WindowSignal::Resized(size) => {
                if let Some(r) = self.renderer.as_mut() {
                    r.resize(size);
                }
                window.request_redraw();
            }
            WindowSignal::Redraw => {
                if let Err(e) = self.draw_frame() {
                    error!("frame failed: {e:#}");
                    self.shutdown();
                    event_loop.exit();
                    return;
                }
                if self.frame_limit.is_some_and(|n| self.presented >= n) {
                    info!("frame limit reached");
                    self.shutdown();
                    event_loop.exit();
                }
            }
            WindowSignal::None => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        let Some(window) = &self.window else {
            return;
        };
        if window.should_exit() {
            return;
        }
        window.request_redraw();

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.fps_frames);
            self.fps_frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    let event_loop: EventLoop<()> = EventLoop::new()?;

    let mut app = App::new(cfg, args.frames);
    event_loop.run_app(&mut app)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg = parse_cfg("");
        assert_eq!(cfg.window.title, "Flex Engine");
        assert_eq!((cfg.window.width, cfg.window.height), (800, 600));
        assert!(!cfg.window.fullscreen);
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Mailbox);
        assert_eq!(cfg.render.acquire_timeout_ms, 1000);
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = parse_cfg(
            r#"
            [window]
            title = "demo"
            width = 1280

            [render]
            vsync_mode = "fifo"
            validation = false
            acquire_timeout_ms = 250
            clear_color = [1.0, 0.0, 0.0, 1.0]
            "#,
        );
        assert_eq!(cfg.window.title, "demo");
        assert_eq!((cfg.window.width, cfg.window.height), (1280, 600));
        assert_eq!(cfg.render.validation, Some(false));
        assert_eq!(cfg.render.clear_color, [1.0, 0.0, 0.0, 1.0]);

        let desc = cfg.window_desc();
        assert_eq!(desc.render_api, RenderApi::Vulkan);
        assert_eq!(desc.width, 1280);
    }

    #[test]
    fn invalid_config_falls_back() {
        let cfg = parse_cfg("[render]\nvsync_mode = 3");
        assert_eq!(cfg.render.vsync_mode, VsyncMode::Mailbox);
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = load_cfg(Path::new("definitely/not/here.toml"));
        assert_eq!(cfg.window.width, 800);
    }

    #[test]
    fn view_proj_handles_minimized_size() {
        let m = view_proj(RenderSize { width: 0, height: 0 });
        assert!(m.is_finite());
        let wide = view_proj(RenderSize { width: 1600, height: 800 });
        assert!(wide.is_finite());
        assert_ne!(m, wide);
    }
}
