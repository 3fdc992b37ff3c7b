//! Scene geometry: the cube field, controller axis lines and procedural textures.

use glam::Vec3;

use crate::gpu::{AxisVertex, SceneVertex};
use crate::math::AffineTransform;
use crate::runtime::TextureMapData;

const AXIS_LENGTH: f32 = 0.05;
const RAY_START: f32 = -0.02;
const RAY_END: f32 = -39.0;
const RAY_COLOR: [f32; 3] = [0.92, 0.92, 0.71];

/// Vertices per controller: three axis lines plus the pointing ray.
pub const AXIS_VERTICES_PER_CONTROLLER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubeField {
    /// Cubes per side.
    pub volume: u32,
    pub scale: f32,
    pub spacing: f32,
}

impl Default for CubeField {
    fn default() -> Self {
        Self {
            volume: 20,
            scale: 0.3,
            spacing: 4.0,
        }
    }
}

impl CubeField {
    pub fn with_volume(volume: u32) -> Self {
        Self {
            volume,
            ..Self::default()
        }
    }

    /// 36 vertices per cube, centered on the tracking origin.
    pub fn vertices(&self) -> Vec<SceneVertex> {
        let n = self.volume as usize;
        let mut vertices = Vec::with_capacity(n * n * n * 36);
        let start = -(self.volume as f32 * self.spacing) / 2.0;

        for z in 0..self.volume {
            for y in 0..self.volume {
                for x in 0..self.volume {
                    let origin = Vec3::new(
                        start + x as f32 * self.spacing,
                        start + y as f32 * self.spacing,
                        start + z as f32 * self.spacing,
                    );
                    push_cube(&mut vertices, origin, self.scale);
                }
            }
        }
        vertices
    }
}

fn push_cube(out: &mut Vec<SceneVertex>, origin: Vec3, scale: f32) {
    let corner = |x: f32, y: f32, z: f32| ((origin + Vec3::new(x, y, z)) * scale).to_array();
    let a = corner(0.0, 0.0, 0.0);
    let b = corner(1.0, 0.0, 0.0);
    let c = corner(1.0, 1.0, 0.0);
    let d = corner(0.0, 1.0, 0.0);
    let e = corner(0.0, 0.0, 1.0);
    let f = corner(1.0, 0.0, 1.0);
    let g = corner(1.0, 1.0, 1.0);
    let h = corner(0.0, 1.0, 1.0);

    // front, back, top, bottom, left, right
    let faces = [[e, f, g, h], [b, a, d, c], [h, g, c, d], [a, b, f, e], [a, e, h, d], [f, b, c, g]];
    for [p0, p1, p2, p3] in faces {
        let quad = [
            (p0, [0.0, 1.0]),
            (p1, [1.0, 1.0]),
            (p2, [1.0, 0.0]),
            (p2, [1.0, 0.0]),
            (p3, [0.0, 0.0]),
            (p0, [0.0, 1.0]),
        ];
        out.extend(quad.map(|(position, uv)| SceneVertex { position, uv }));
    }
}

/// X/Y/Z axis lines in red/green/blue plus a pointing ray down -Z.
pub fn controller_axis_vertices(transform: &AffineTransform) -> [AxisVertex; AXIS_VERTICES_PER_CONTROLLER] {
    let center = transform.transform_point(Vec3::ZERO).to_array();
    let vertex = |position: [f32; 3], color: [f32; 3]| AxisVertex { position, color };

    let mut out = [vertex([0.0; 3], [0.0; 3]); AXIS_VERTICES_PER_CONTROLLER];
    for axis in 0..3 {
        let mut tip = Vec3::ZERO;
        tip[axis] = AXIS_LENGTH;
        let mut color = [0.0; 3];
        color[axis] = 1.0;
        out[axis * 2] = vertex(center, color);
        out[axis * 2 + 1] = vertex(transform.transform_point(tip).to_array(), color);
    }
    out[6] = vertex(transform.transform_point(Vec3::new(0.0, 0.0, RAY_START)).to_array(), RAY_COLOR);
    out[7] = vertex(transform.transform_point(Vec3::new(0.0, 0.0, RAY_END)).to_array(), RAY_COLOR);
    out
}

/// Two-tone checkerboard, used for the cube field and procedural models.
pub fn checker_texture(size: u32, cells: u32, light: [u8; 4], dark: [u8; 4]) -> TextureMapData {
    let cell = (size / cells.max(1)).max(1);
    let mut rgba = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let texel = if (x / cell + y / cell) % 2 == 0 { light } else { dark };
            rgba.extend_from_slice(&texel);
        }
    }
    TextureMapData {
        width: size,
        height: size,
        rgba,
    }
}

/// Texture for the cube field.
pub fn cube_texture() -> TextureMapData {
    checker_texture(256, 8, [214, 200, 168, 255], [92, 84, 74, 255])
}
