//! GPU surface boundary
//!
//! The frame orchestrator never touches the graphics API directly. It builds
//! [`EyePass`] draw lists and hands them to a [`GpuSurface`], which owns every
//! GPU object behind small copyable handles.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::distortion::DistortionMesh;
use crate::error::{AssetLoadError, FramebufferError};
use crate::runtime::{Eye, RenderModelData, TextureMapData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub u32);

/// Opaque texture id, also what the compositor receives on submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetHandle(pub u32);

/// One eye's multisampled color+depth target and its single-sample resolve texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EyeTarget {
    pub eye: Eye,
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub target: TargetHandle,
    pub resolved: TextureHandle,
}

/// A render model's mesh and diffuse texture as uploaded to the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuModel {
    pub mesh: MeshHandle,
    pub texture: TextureHandle,
    pub index_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AxisVertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DistortionVertex {
    pub position: [f32; 2],
    pub uv_red: [f32; 2],
    pub uv_green: [f32; 2],
    pub uv_blue: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawCall {
    /// The textured cube field.
    Scene { mvp: Mat4 },
    /// Controller axis and ray lines, already in tracking space.
    ControllerAxes { view_projection: Mat4, vertex_count: u32 },
    RenderModel { device: usize, model: GpuModel, mvp: Mat4 },
}

/// Everything needed to render one eye into its multisample target.
#[derive(Debug, Clone, PartialEq)]
pub struct EyePass {
    pub eye: Eye,
    pub target: EyeTarget,
    pub clear_color: [f64; 4],
    pub draws: Vec<DrawCall>,
}

pub trait GpuSurface {
    /// Creates one eye's targets and checks them for completeness.
    fn create_eye_target(
        &mut self,
        eye: Eye,
        width: u32,
        height: u32,
        samples: u32,
    ) -> Result<EyeTarget, FramebufferError>;

    fn upload_scene(&mut self, vertices: &[SceneVertex], texture: &TextureMapData);

    fn upload_distortion_mesh(&mut self, mesh: &DistortionMesh) -> MeshHandle;

    fn upload_render_model(
        &mut self,
        name: &str,
        model: &RenderModelData,
        texture: &TextureMapData,
    ) -> Result<GpuModel, AssetLoadError>;

    /// Replaces the controller line buffer; the returned count may be clamped.
    fn update_controller_axes(&mut self, vertices: &[AxisVertex]) -> u32;

    fn render_eye(&mut self, pass: &EyePass);

    fn resolve(&mut self, target: &EyeTarget);

    /// Draws both halves of the distortion mesh into the companion window.
    fn distort(&mut self, mesh: MeshHandle, left: &EyeTarget, right: &EyeTarget);

    fn present(&mut self, wait_idle: bool);

    fn release_render_model(&mut self, model: &GpuModel);
}
