// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

mod mesh;

pub use mesh::{Mesh, Vertex, DEFAULT_SHADER_ID};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    /// A zero-area drawable (minimized window) cannot back a swapchain.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Graphics API a window was created for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderApi {
    OpenGl,
    Vulkan,
    DirectX11,
}

bitflags::bitflags! {
    /// Declared purpose of a GPU buffer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX   = 1 << 0;
        const INDEX    = 1 << 1;
        /// Host-written source of a copy.
        const STAGING  = 1 << 2;
        /// Destination of a copy.
        const TRANSFER = 1 << 3;
    }
}

impl BufferUsage {
    /// Usage of a buffer holding both the indices and vertices of one mesh.
    pub const MESH: Self = Self::VERTEX.union(Self::INDEX).union(Self::TRANSFER);
}

/// Window/surface collaborator consumed by renderer backends.
pub trait RenderWindow: HasWindowHandle + HasDisplayHandle {
    fn render_api(&self) -> RenderApi;
    /// Current drawable size in physical pixels.
    fn drawable_size(&self) -> RenderSize;
}

/// Frame-loop contract shared by backends.
///
/// A frame is `acquire_next_frame` → `start_draw` → `draw_mesh`* → `end_draw` → `present`.
/// When `acquire_next_frame` returns `false` the caller skips the rest of the iteration.
pub trait Renderer {
    type MeshBuffer;

    fn new(window: &dyn RenderWindow) -> Result<Self>
    where
        Self: Sized;

    /// Window resize notification; the swapchain is rebuilt on the next frame boundary.
    fn resize(&mut self, size: RenderSize);

    fn create_mesh_buffer(&mut self, mesh: &Mesh) -> Result<Self::MeshBuffer>;
    fn update_mesh_buffer(&mut self, buffer: &mut Self::MeshBuffer, mesh: &Mesh) -> Result<()>;
    /// Caller guarantees no in-flight frame still references `buffer`.
    fn destroy_mesh_buffer(&mut self, buffer: Self::MeshBuffer) -> Result<()>;

    fn acquire_next_frame(&mut self) -> Result<bool>;
    fn start_draw(&mut self) -> Result<()>;
    fn draw_mesh(&mut self, mesh: &Mesh, buffer: &Self::MeshBuffer) -> Result<()>;
    fn end_draw(&mut self) -> Result<()>;
    fn present(&mut self) -> Result<()>;

    /// Drain all queues; must precede any teardown.
    fn stop(&mut self) -> Result<()>;

    fn set_clear_color(&mut self, rgba: [f32; 4]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sizes() {
        assert!(RenderSize { width: 0, height: 600 }.is_empty());
        assert!(RenderSize { width: 800, height: 0 }.is_empty());
        assert!(!RenderSize { width: 1, height: 1 }.is_empty());
    }

    #[test]
    fn mesh_usage_covers_both_bindings() {
        assert!(BufferUsage::MESH.contains(BufferUsage::VERTEX | BufferUsage::INDEX));
        assert!(BufferUsage::MESH.contains(BufferUsage::TRANSFER));
        assert!(!BufferUsage::MESH.contains(BufferUsage::STAGING));
    }
}
