//! VR runtime boundary
//!
//! The tracking/compositor runtime and its render-model service are external.
//! Everything the pipeline needs from them goes through [`VrRuntime`] and
//! [`RenderModelSource`].

use bytemuck::{Pod, Zeroable};

use crate::error::{CompositorError, RuntimeError};
use crate::gpu::TextureHandle;
use crate::math::{RawMatrix34, RawMatrix44};

/// Fixed size of every per-device array.
pub const MAX_TRACKED_DEVICE_COUNT: usize = 64;

/// The head-mounted display always occupies slot 0.
pub const HMD_DEVICE_INDEX: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationType {
    /// Renders a full 3D scene and owns the compositor.
    Scene,
    /// Reads tracking data only.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedDeviceClass {
    Invalid,
    Hmd,
    Controller,
    GenericTracker,
    TrackingReference,
    Other,
}

impl TrackedDeviceClass {
    /// One-character tag used in pose diagnostics.
    pub fn tag(self) -> char {
        match self {
            TrackedDeviceClass::Controller => 'C',
            TrackedDeviceClass::Hmd => 'H',
            TrackedDeviceClass::Invalid => 'I',
            TrackedDeviceClass::Other => 'O',
            TrackedDeviceClass::TrackingReference => 'T',
            TrackedDeviceClass::GenericTracker => '?',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedDeviceProperty {
    TrackingSystemName,
    SerialNumber,
    RenderModelName,
}

/// One device's entry in the per-frame pose array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedDevicePose {
    pub device_to_absolute_tracking: RawMatrix34,
    pub pose_is_valid: bool,
    pub device_is_connected: bool,
}

impl TrackedDevicePose {
    pub const INVALID: Self = Self {
        device_to_absolute_tracking: RawMatrix34::IDENTITY,
        pose_is_valid: false,
        device_is_connected: false,
    };
}

impl Default for TrackedDevicePose {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Per-channel texture coordinates returned by the lens distortion function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortionCoordinates {
    pub red: [f32; 2],
    pub green: [f32; 2],
    pub blue: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrEvent {
    TrackedDeviceActivated(usize),
    TrackedDeviceDeactivated(usize),
    TrackedDeviceUpdated(usize),
}

/// The tracking and compositor service.
pub trait VrRuntime {
    fn init(application_type: ApplicationType) -> Result<Self, RuntimeError>
    where
        Self: Sized;

    fn recommended_render_target_size(&self) -> (u32, u32);

    fn projection_matrix(&self, eye: Eye, near: f32, far: f32) -> Result<RawMatrix44, RuntimeError>;

    fn eye_to_head_transform(&self, eye: Eye) -> Result<RawMatrix34, RuntimeError>;

    /// Fills `poses` for the upcoming frame. Blocks until the runtime's
    /// predicted poses are ready, which paces the whole frame loop.
    fn wait_get_poses(
        &mut self,
        poses: &mut [TrackedDevicePose; MAX_TRACKED_DEVICE_COUNT],
    ) -> Result<(), CompositorError>;

    fn is_input_focus_captured_by_another_process(&self) -> bool;

    fn tracked_device_class(&self, index: usize) -> TrackedDeviceClass;

    fn is_tracked_device_connected(&self, index: usize) -> bool;

    fn tracked_device_string(&self, index: usize, property: TrackedDeviceProperty) -> Option<String>;

    fn compute_distortion(&self, eye: Eye, u: f32, v: f32) -> DistortionCoordinates;

    fn submit(&mut self, eye: Eye, texture: TextureHandle) -> Result<(), CompositorError>;

    fn poll_next_event(&mut self) -> Option<VrEvent>;

    /// Bitmask of pressed buttons, `None` for devices without controller state.
    fn controller_buttons_pressed(&self, index: usize) -> Option<u64>;

    /// A render-model interface that can be moved to a loader thread.
    fn render_models(&self) -> Box<dyn RenderModelSource + Send>;

    fn shutdown(&mut self);
}

/// Result of one poll of an asynchronous runtime load.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus<T> {
    Pending,
    Ready(T),
    Failed(String),
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RenderModelVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texture_coord: [f32; 2],
}

/// Geometry of a render model as handed out by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderModelData {
    pub vertices: Vec<RenderModelVertex>,
    pub indices: Vec<u16>,
    pub diffuse_texture_id: u32,
}

/// RGBA8 texture map, rows top to bottom.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureMapData {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Asynchronous render-model service; callers poll until a terminal status.
pub trait RenderModelSource {
    fn load_render_model(&mut self, name: &str) -> LoadStatus<RenderModelData>;

    fn load_texture(&mut self, texture_id: u32) -> LoadStatus<TextureMapData>;

    /// Releases the runtime's copy of a model once it has been taken, or
    /// once it is no longer wanted.
    fn free_render_model(&mut self, _name: &str) {}

    fn free_texture(&mut self, _texture_id: u32) {}
}
