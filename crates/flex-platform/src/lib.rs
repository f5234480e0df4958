// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::{Context, Result};
use flex_render::{RenderApi, RenderSize, RenderWindow};
use tracing::info;

pub use winit;

use winit::{
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::ActiveEventLoop,
    raw_window_handle::{DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle},
    window::{Fullscreen, Window, WindowId},
};

#[derive(Clone, Debug)]
pub struct WindowDesc {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub render_api: RenderApi,
}

impl Default for WindowDesc {
    fn default() -> Self {
        Self {
            title: "Flex Engine".to_owned(),
            width: 800,
            height: 600,
            fullscreen: false,
            render_api: RenderApi::Vulkan,
        }
    }
}

/// What the application loop should do about one window event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowSignal {
    None,
    Exit,
    Resized(RenderSize),
    Redraw,
}

pub struct PlatformWindow {
    window: Window,
    render_api: RenderApi,
    should_exit: bool,
}

impl PlatformWindow {
    pub fn create(event_loop: &ActiveEventLoop, desc: &WindowDesc) -> Result<Self> {
        let mut attrs = Window::default_attributes()
            .with_title(desc.title.clone())
            .with_inner_size(PhysicalSize::new(desc.width, desc.height))
            .with_resizable(true);
        if desc.fullscreen {
            attrs = attrs.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }
        let window = event_loop.create_window(attrs).context("create_window")?;
        let size = window.inner_size();
        info!(
            "window \"{}\" created ({}x{}, api {:?})",
            desc.title, size.width, size.height, desc.render_api
        );
        Ok(Self {
            window,
            render_api: desc.render_api,
            should_exit: false,
        })
    }

    pub fn id(&self) -> WindowId {
        self.window.id()
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }

    pub fn should_exit(&self) -> bool {
        self.should_exit
    }

    /// Fold one event into the window state.
    pub fn handle_event(&mut self, event: &WindowEvent) -> WindowSignal {
        let signal = signal_for(event);
        if signal == WindowSignal::Exit {
            self.should_exit = true;
        }
        signal
    }
}

fn signal_for(event: &WindowEvent) -> WindowSignal {
    match event {
        WindowEvent::CloseRequested | WindowEvent::Destroyed => WindowSignal::Exit,
        WindowEvent::Resized(size) => WindowSignal::Resized(RenderSize {
            width: size.width,
            height: size.height,
        }),
        WindowEvent::RedrawRequested => WindowSignal::Redraw,
        _ => WindowSignal::None,
    }
}

impl HasWindowHandle for PlatformWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for PlatformWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl RenderWindow for PlatformWindow {
    fn render_api(&self) -> RenderApi {
        self.render_api
    }

    fn drawable_size(&self) -> RenderSize {
        let size = self.window.inner_size();
        RenderSize {
            width: size.width,
            height: size.height,
        }
    }
}
