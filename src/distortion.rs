//! Lens distortion mesh
//!
//! A static grid per eye whose vertices carry per-channel texture
//! coordinates, so the companion window shows the eye images pre-warped for
//! the headset lenses with chromatic aberration corrected.

use std::ops::Range;

use crate::error::MeshError;
use crate::gpu::DistortionVertex;
use crate::runtime::{DistortionCoordinates, Eye};

/// Grid points per side used by the companion window.
pub const DEFAULT_GRID: usize = 43;

#[derive(Debug, Clone, PartialEq)]
pub struct DistortionMesh {
    pub vertices: Vec<DistortionVertex>,
    pub indices: Vec<u16>,
    pub grid_width: usize,
    pub grid_height: usize,
}

impl DistortionMesh {
    /// First half of the index buffer.
    pub fn left_indices(&self) -> Range<u32> {
        0..self.half_index_count()
    }

    /// Second half of the index buffer.
    pub fn right_indices(&self) -> Range<u32> {
        self.half_index_count()..self.indices.len() as u32
    }

    fn half_index_count(&self) -> u32 {
        (self.indices.len() / 2) as u32
    }
}

/// Builds both eyes' grids. `distort(eye, u, v)` is the runtime's
/// per-channel distortion function.
pub fn build_distortion_mesh<F>(
    distort: F,
    grid_width: usize,
    grid_height: usize,
) -> Result<DistortionMesh, MeshError>
where
    F: Fn(Eye, f32, f32) -> DistortionCoordinates,
{
    if grid_width < 2 || grid_height < 2 {
        return Err(MeshError::GridTooSmall {
            width: grid_width,
            height: grid_height,
        });
    }
    let per_eye = grid_width * grid_height;
    let vertex_count = 2 * per_eye;
    if vertex_count > usize::from(u16::MAX) + 1 {
        return Err(MeshError::GridTooLarge {
            width: grid_width,
            height: grid_height,
            vertices: vertex_count,
        });
    }

    let step_u = 1.0 / (grid_width - 1) as f32;
    let step_v = 1.0 / (grid_height - 1) as f32;

    let mut vertices = Vec::with_capacity(vertex_count);
    for (eye, x_offset) in [(Eye::Left, -1.0), (Eye::Right, 0.0)] {
        for y in 0..grid_height {
            for x in 0..grid_width {
                let u = x as f32 * step_u;
                let v = 1.0 - y as f32 * step_v;
                let coords = distort(eye, u, v);
                // runtime v grows upward, texture rows grow downward
                let flip = |c: [f32; 2]| [c[0], 1.0 - c[1]];
                vertices.push(DistortionVertex {
                    position: [x_offset + u, -1.0 + 2.0 * y as f32 * step_v],
                    uv_red: flip(coords.red),
                    uv_green: flip(coords.green),
                    uv_blue: flip(coords.blue),
                });
            }
        }
    }

    let mut indices = Vec::with_capacity(12 * (grid_width - 1) * (grid_height - 1));
    for offset in [0, per_eye] {
        for y in 0..grid_height - 1 {
            for x in 0..grid_width - 1 {
                let a = grid_width * y + x + offset;
                let b = grid_width * y + x + 1 + offset;
                let c = (y + 1) * grid_width + x + 1 + offset;
                let d = (y + 1) * grid_width + x + offset;
                // bounded by the vertex count check above
                indices.extend([a, b, c, a, c, d].map(|i| i as u16));
            }
        }
    }

    Ok(DistortionMesh {
        vertices,
        indices,
        grid_width,
        grid_height,
    })
}
