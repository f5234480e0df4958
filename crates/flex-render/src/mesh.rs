// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Shader id of a mesh that never picked one; backends fall back to their first pipeline.
pub const DEFAULT_SHADER_ID: u32 = u32::MAX;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    /// Texture or generic per-vertex coordinate.
    pub uvw: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 3], uvw: [f32; 3]) -> Self {
        Self { position, uvw }
    }
}

/// Plain mesh data. The GPU copy lives in a backend buffer created from it.
#[derive(Clone, Debug)]
pub struct Mesh {
    pub indices: Vec<u32>,
    pub vertices: Vec<Vertex>,
    pub transform: Mat4,
    pub shader_id: u32,
}

impl Mesh {
    pub fn new(indices: Vec<u32>, vertices: Vec<Vertex>) -> Self {
        Self {
            indices,
            vertices,
            transform: Mat4::IDENTITY,
            shader_id: DEFAULT_SHADER_ID,
        }
    }

    pub fn indices_size(&self) -> usize {
        std::mem::size_of_val(self.indices.as_slice())
    }

    pub fn vertices_size(&self) -> usize {
        std::mem::size_of_val(self.vertices.as_slice())
    }

    pub fn required_buffer_size(&self) -> usize {
        self.indices_size() + self.vertices_size()
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Axis-aligned unit cube centred on the origin, uvw doubling as a colour.
    pub fn cube() -> Self {
        let mut vertices = Vec::with_capacity(8);
        for i in 0..8u32 {
            let bit = |b: u32| ((i >> b) & 1) as f32;
            vertices.push(Vertex::new(
                [bit(0) - 0.5, bit(1) - 0.5, bit(2) - 0.5],
                [bit(0), bit(1), bit(2)],
            ));
        }
        #[rustfmt::skip]
        let indices = vec![
            0, 2, 1, 1, 2, 3, // -z
            4, 5, 6, 5, 7, 6, // +z
            0, 1, 4, 1, 5, 4, // -y
            2, 6, 3, 3, 6, 7, // +y
            0, 4, 2, 2, 4, 6, // -x
            1, 3, 5, 3, 7, 5, // +x
        ];
        Self::new(indices, vertices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_element_counts() {
        let mesh = Mesh::new(
            vec![0, 1, 2],
            vec![Vertex::default(), Vertex::default(), Vertex::default()],
        );
        assert_eq!(mesh.indices_size(), 3 * 4);
        assert_eq!(mesh.vertices_size(), 3 * 24);
        assert_eq!(mesh.required_buffer_size(), 12 + 72);
        assert_eq!(mesh.index_bytes().len(), mesh.indices_size());
        assert_eq!(mesh.vertex_bytes().len(), mesh.vertices_size());
    }

    #[test]
    fn cube_indices_stay_in_range() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 8);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.indices.iter().all(|&i| (i as usize) < cube.vertices.len()));
        assert_eq!(cube.shader_id, DEFAULT_SHADER_ID);
    }
}
