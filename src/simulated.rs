//! Simulated VR runtime
//!
//! Stands in for a headset on the desktop: a seated HMD with gentle
//! breathing and look-around motion, two hand controllers sharing one model,
//! two base stations, Cardboard-style lens distortion, and render models that
//! take a few polls to "load". The second controller switches on after a
//! couple of seconds so the device-activated path gets exercised.

use std::collections::{HashMap, VecDeque};
use std::f32::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use glam::{Affine3A, EulerRot, Mat4, Quat, Vec3, Vec4};
use log::{debug, info};

use crate::error::{CompositorError, RuntimeError};
use crate::gpu::TextureHandle;
use crate::math::{RawMatrix34, RawMatrix44};
use crate::runtime::{
    ApplicationType, DistortionCoordinates, Eye, LoadStatus, RenderModelData, RenderModelSource,
    RenderModelVertex, TextureMapData, TrackedDeviceClass, TrackedDevicePose,
    TrackedDeviceProperty, VrEvent, VrRuntime, MAX_TRACKED_DEVICE_COUNT,
};
use crate::scene::checker_texture;

const REFRESH_RATE: f32 = 90.0;
const IPD: f32 = 0.063;
// Cardboard-style radial coefficients
const K1: f32 = 0.25;
const K2: f32 = 0.15;
/// Per-channel magnification; blue bends most.
const CHROMA_SCALE: [f32; 3] = [0.994, 1.0, 1.008];

pub const CONTROLLER_MODEL: &str = "sim_controller";
pub const BASE_STATION_MODEL: &str = "sim_basestation";
pub const HMD_MODEL: &str = "sim_hmd";

/// Index of the controller that switches on late.
pub const LATE_CONTROLLER: usize = 2;

#[derive(Debug, Clone)]
struct SimDevice {
    class: TrackedDeviceClass,
    model: &'static str,
    active: bool,
}

/// Field-of-view half-angle tangents, outward positive.
#[derive(Debug, Clone, Copy)]
struct Fov {
    left: f32,
    right: f32,
    up: f32,
    down: f32,
}

pub struct SimulatedRuntime {
    devices: Vec<SimDevice>,
    frame_interval: Duration,
    late_activation_frame: u64,
    frame: u64,
    last_frame_at: Option<Instant>,
    render_size: (u32, u32),
    events: VecDeque<VrEvent>,
    submitted: [Option<TextureHandle>; 2],
    shut_down: bool,
}

impl SimulatedRuntime {
    fn new() -> Self {
        let device = |class, model, active| SimDevice { class, model, active };
        Self {
            devices: vec![
                device(TrackedDeviceClass::Hmd, HMD_MODEL, true),
                device(TrackedDeviceClass::Controller, CONTROLLER_MODEL, true),
                device(TrackedDeviceClass::Controller, CONTROLLER_MODEL, false),
                device(TrackedDeviceClass::TrackingReference, BASE_STATION_MODEL, true),
                device(TrackedDeviceClass::TrackingReference, BASE_STATION_MODEL, true),
            ],
            frame_interval: Duration::from_secs_f32(1.0 / REFRESH_RATE),
            late_activation_frame: 2 * REFRESH_RATE as u64,
            frame: 0,
            last_frame_at: None,
            render_size: (1080, 1200),
            events: VecDeque::new(),
            submitted: [None; 2],
            shut_down: false,
        }
    }

    /// Frame pacing; zero runs as fast as the caller asks.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Frame on which the second controller switches on.
    pub fn with_late_activation(mut self, frame: u64) -> Self {
        self.late_activation_frame = frame;
        self
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn last_submitted(&self, eye: Eye) -> Option<TextureHandle> {
        self.submitted[eye.index()]
    }

    fn fov(eye: Eye) -> Fov {
        // the nasal side of each lens sees a little less
        let (outer, inner) = (1.19, 1.0);
        match eye {
            Eye::Left => Fov { left: outer, right: inner, up: 1.11, down: 1.11 },
            Eye::Right => Fov { left: inner, right: outer, up: 1.11, down: 1.11 },
        }
    }

    fn seconds(&self) -> f32 {
        self.frame as f32 / REFRESH_RATE
    }

    fn hmd_pose(t: f32) -> Affine3A {
        let breathing = (t * 0.5).sin() * 0.01;
        let sway = (t * 0.3).sin() * 0.005;
        let look_around = (t * TAU * 0.05).sin() * 0.35;
        let rotation = Quat::from_euler(EulerRot::YXZ, look_around, breathing, sway);
        let position = Vec3::new(0.6, 0.6 + breathing, 0.6);
        Affine3A::from_rotation_translation(rotation, position)
    }

    fn controller_pose(t: f32, side: f32) -> Affine3A {
        let phase = t * TAU * 0.2 + side;
        let orbit = Vec3::new(phase.cos() * 0.05, phase.sin() * 0.05, 0.0);
        let position = Vec3::new(0.6 + side * 0.2, 0.3, 0.2) + orbit;
        let rotation = Quat::from_euler(EulerRot::YXZ, side * 0.2, 0.3 + phase.sin() * 0.1, 0.0);
        Affine3A::from_rotation_translation(rotation, position)
    }

    fn base_station_pose(corner: f32) -> Affine3A {
        let position = Vec3::new(2.0 * corner, 2.2, -1.5 * corner);
        Affine3A::look_at_rh(position, Vec3::new(0.6, 0.6, 0.6), Vec3::Y).inverse()
    }

    fn device_pose(&self, index: usize, t: f32) -> Option<Affine3A> {
        let device = self.devices.get(index)?;
        if !device.active {
            return None;
        }
        Some(match index {
            0 => Self::hmd_pose(t),
            1 => Self::controller_pose(t, -1.0),
            2 => Self::controller_pose(t, 1.0),
            3 => Self::base_station_pose(-1.0),
            _ => Self::base_station_pose(1.0),
        })
    }

    fn pace(&mut self) {
        if let Some(last) = self.last_frame_at {
            let next = last + self.frame_interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }
}

impl VrRuntime for SimulatedRuntime {
    fn init(application_type: ApplicationType) -> Result<Self, RuntimeError> {
        if application_type != ApplicationType::Scene {
            return Err(RuntimeError::Init(format!(
                "simulated runtime cannot run {:?} applications",
                application_type
            )));
        }
        info!("Simulated VR runtime ready ({} Hz)", REFRESH_RATE);
        Ok(Self::new())
    }

    fn recommended_render_target_size(&self) -> (u32, u32) {
        self.render_size
    }

    fn projection_matrix(&self, eye: Eye, near: f32, far: f32) -> Result<RawMatrix44, RuntimeError> {
        if !(near > 0.0 && far > near) {
            return Err(RuntimeError::EyeData { eye, what: "projection" });
        }
        let fov = Self::fov(eye);
        let (left, right, top, bottom) = (-fov.left, fov.right, fov.up, -fov.down);

        let x_scale = 2.0 / (right - left);
        let y_scale = 2.0 / (top - bottom);
        let x_offset = (right + left) / (right - left);
        let y_offset = (top + bottom) / (top - bottom);
        // depth lands in [0, 1]
        let z_scale = far / (near - far);
        let z_offset = near * far / (near - far);

        let projection = Mat4::from_cols(
            Vec4::new(x_scale, 0.0, 0.0, 0.0),
            Vec4::new(0.0, y_scale, 0.0, 0.0),
            Vec4::new(x_offset, y_offset, z_scale, -1.0),
            Vec4::new(0.0, 0.0, z_offset, 0.0),
        );
        Ok(RawMatrix44::from_mat4(projection))
    }

    fn eye_to_head_transform(&self, eye: Eye) -> Result<RawMatrix34, RuntimeError> {
        let x = match eye {
            Eye::Left => -IPD / 2.0,
            Eye::Right => IPD / 2.0,
        };
        Ok(RawMatrix34::from_affine(Affine3A::from_translation(Vec3::new(x, 0.0, 0.0))))
    }

    fn wait_get_poses(
        &mut self,
        poses: &mut [TrackedDevicePose; MAX_TRACKED_DEVICE_COUNT],
    ) -> Result<(), CompositorError> {
        if self.shut_down {
            return Err(CompositorError::Unavailable);
        }
        self.pace();
        self.frame += 1;

        if self.frame == self.late_activation_frame && !self.devices[LATE_CONTROLLER].active {
            self.devices[LATE_CONTROLLER].active = true;
            self.events.push_back(VrEvent::TrackedDeviceActivated(LATE_CONTROLLER));
            debug!("Simulated controller {} switched on", LATE_CONTROLLER);
        }

        let t = self.seconds();
        for (index, pose) in poses.iter_mut().enumerate() {
            *pose = match self.device_pose(index, t) {
                Some(transform) => TrackedDevicePose {
                    device_to_absolute_tracking: RawMatrix34::from_affine(transform),
                    pose_is_valid: true,
                    device_is_connected: true,
                },
                None => TrackedDevicePose::INVALID,
            };
        }
        Ok(())
    }

    fn is_input_focus_captured_by_another_process(&self) -> bool {
        false
    }

    fn tracked_device_class(&self, index: usize) -> TrackedDeviceClass {
        match self.devices.get(index) {
            Some(device) if device.active => device.class,
            _ => TrackedDeviceClass::Invalid,
        }
    }

    fn is_tracked_device_connected(&self, index: usize) -> bool {
        self.devices.get(index).is_some_and(|device| device.active)
    }

    fn tracked_device_string(&self, index: usize, property: TrackedDeviceProperty) -> Option<String> {
        let device = self.devices.get(index).filter(|device| device.active)?;
        Some(match property {
            TrackedDeviceProperty::TrackingSystemName => "simulated".to_string(),
            TrackedDeviceProperty::SerialNumber => format!("SIM-{:04}", index),
            TrackedDeviceProperty::RenderModelName => device.model.to_string(),
        })
    }

    fn compute_distortion(&self, _eye: Eye, u: f32, v: f32) -> DistortionCoordinates {
        let d = [(u - 0.5) * 2.0, (v - 0.5) * 2.0];
        let r2 = d[0] * d[0] + d[1] * d[1];
        // normalized so the edge of the lens maps back onto the texture edge
        let barrel = (1.0 + K1 * r2 + K2 * r2 * r2) / (1.0 + K1 + K2);
        let channel = |scale: f32| {
            let factor = barrel * scale;
            [0.5 + d[0] * factor * 0.5, 0.5 + d[1] * factor * 0.5]
        };
        DistortionCoordinates {
            red: channel(CHROMA_SCALE[0]),
            green: channel(CHROMA_SCALE[1]),
            blue: channel(CHROMA_SCALE[2]),
        }
    }

    fn submit(&mut self, eye: Eye, texture: TextureHandle) -> Result<(), CompositorError> {
        if self.shut_down {
            return Err(CompositorError::Unavailable);
        }
        self.submitted[eye.index()] = Some(texture);
        Ok(())
    }

    fn poll_next_event(&mut self) -> Option<VrEvent> {
        self.events.pop_front()
    }

    fn controller_buttons_pressed(&self, index: usize) -> Option<u64> {
        let device = self.devices.get(index)?;
        if device.class != TrackedDeviceClass::Controller || !device.active {
            return None;
        }
        // the first controller holds its trigger for one second out of ten
        let held = index == 1 && self.seconds() % 10.0 >= 9.0;
        Some(if held { 1 << 33 } else { 0 })
    }

    fn render_models(&self) -> Box<dyn RenderModelSource + Send> {
        Box::new(SimulatedRenderModels::default())
    }

    fn shutdown(&mut self) {
        if !self.shut_down {
            info!("Simulated VR runtime shut down after {} frames", self.frame);
        }
        self.shut_down = true;
    }
}

/// Procedural render models. Each one reports "loading" a couple of times
/// before it is handed out.
#[derive(Debug, Default)]
pub struct SimulatedRenderModels {
    model_polls: HashMap<String, u32>,
    texture_polls: HashMap<u32, u32>,
}

impl SimulatedRenderModels {
    const MODEL_POLLS: u32 = 2;
    const TEXTURE_POLLS: u32 = 1;
}

impl RenderModelSource for SimulatedRenderModels {
    fn load_render_model(&mut self, name: &str) -> LoadStatus<RenderModelData> {
        let (half_extents, texture_id) = match name {
            CONTROLLER_MODEL => (Vec3::new(0.02, 0.015, 0.075), 1),
            BASE_STATION_MODEL => (Vec3::splat(0.04), 2),
            HMD_MODEL => (Vec3::new(0.09, 0.05, 0.05), 3),
            _ => return LoadStatus::Failed(format!("no render model named {}", name)),
        };
        let polls = self.model_polls.entry(name.to_string()).or_default();
        if *polls < Self::MODEL_POLLS {
            *polls += 1;
            return LoadStatus::Pending;
        }
        LoadStatus::Ready(box_model(half_extents, texture_id))
    }

    fn load_texture(&mut self, texture_id: u32) -> LoadStatus<TextureMapData> {
        let (light, dark) = match texture_id {
            1 => ([60, 60, 66, 255], [28, 28, 32, 255]),
            2 => ([230, 230, 230, 255], [40, 40, 40, 255]),
            3 => ([90, 90, 100, 255], [20, 20, 24, 255]),
            _ => return LoadStatus::Failed(format!("no texture with id {}", texture_id)),
        };
        let polls = self.texture_polls.entry(texture_id).or_default();
        if *polls < Self::TEXTURE_POLLS {
            *polls += 1;
            return LoadStatus::Pending;
        }
        LoadStatus::Ready(checker_texture(64, 4, light, dark))
    }

    fn free_render_model(&mut self, name: &str) {
        self.model_polls.remove(name);
    }

    fn free_texture(&mut self, texture_id: u32) {
        self.texture_polls.remove(&texture_id);
    }
}

/// Axis-aligned box centered on the device origin, four vertices per face.
pub fn box_model(half_extents: Vec3, diffuse_texture_id: u32) -> RenderModelData {
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for axis in 0..3 {
        for sign in [1.0f32, -1.0] {
            let mut normal = Vec3::ZERO;
            normal[axis] = sign;
            // two tangents spanning the face, ordered for counter-clockwise winding
            let u_axis = Vec3::from_array(std::array::from_fn(|i| if i == (axis + 1) % 3 { 1.0 } else { 0.0 }));
            let v_axis = normal.cross(u_axis);

            let base = vertices.len() as u16;
            for (s, t) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let corner = (normal + u_axis * s + v_axis * t) * half_extents;
                vertices.push(RenderModelVertex {
                    position: corner.to_array(),
                    normal: normal.to_array(),
                    texture_coord: [(s + 1.0) / 2.0, (1.0 - t) / 2.0],
                });
            }
            indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
        }
    }

    RenderModelData {
        vertices,
        indices,
        diffuse_texture_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{to_affine_matrix4x4, to_matrix4x4};

    fn fast_runtime() -> SimulatedRuntime {
        SimulatedRuntime::init(ApplicationType::Scene)
            .unwrap()
            .with_frame_interval(Duration::ZERO)
    }

    #[test]
    fn only_scene_applications_are_accepted() {
        assert!(matches!(
            SimulatedRuntime::init(ApplicationType::Background),
            Err(RuntimeError::Init(_))
        ));
    }

    #[test]
    fn projection_maps_near_and_far_to_unit_depth() {
        let runtime = fast_runtime();
        let raw = runtime.projection_matrix(Eye::Left, 0.1, 30.0).unwrap();
        let projection = to_matrix4x4(&raw).to_mat4();

        let near = projection * Vec4::new(0.0, 0.0, -0.1, 1.0);
        let far = projection * Vec4::new(0.0, 0.0, -30.0, 1.0);
        assert!((near.z / near.w).abs() < 1e-5);
        assert!((far.z / far.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn frusta_are_mirror_images() {
        let runtime = fast_runtime();
        let left = to_matrix4x4(&runtime.projection_matrix(Eye::Left, 0.1, 30.0).unwrap()).to_mat4();
        let right = to_matrix4x4(&runtime.projection_matrix(Eye::Right, 0.1, 30.0).unwrap()).to_mat4();
        assert!(left.z_axis.x < 0.0);
        assert!((left.z_axis.x + right.z_axis.x).abs() < 1e-6);
        assert_eq!(left.x_axis, right.x_axis);
    }

    #[test]
    fn eyes_are_one_ipd_apart() {
        let runtime = fast_runtime();
        let left = to_affine_matrix4x4(&runtime.eye_to_head_transform(Eye::Left).unwrap());
        let right = to_affine_matrix4x4(&runtime.eye_to_head_transform(Eye::Right).unwrap());
        assert!(((right.translation() - left.translation()).length() - IPD).abs() < 1e-6);
    }

    #[test]
    fn distortion_is_identity_at_center_and_spreads_channels_at_edge() {
        let runtime = fast_runtime();
        let center = runtime.compute_distortion(Eye::Left, 0.5, 0.5);
        assert_eq!(center.green, [0.5, 0.5]);

        let edge = runtime.compute_distortion(Eye::Left, 1.0, 0.5);
        assert!((edge.green[0] - 1.0).abs() < 1e-6);
        assert!(edge.red[0] < edge.green[0] && edge.green[0] < edge.blue[0]);
    }

    #[test]
    fn late_controller_activates_with_an_event() {
        let mut runtime = fast_runtime().with_late_activation(3);
        let mut poses = [TrackedDevicePose::INVALID; MAX_TRACKED_DEVICE_COUNT];

        runtime.wait_get_poses(&mut poses).unwrap();
        assert!(!poses[LATE_CONTROLLER].pose_is_valid);
        assert!(!runtime.is_tracked_device_connected(LATE_CONTROLLER));
        assert_eq!(runtime.poll_next_event(), None);

        runtime.wait_get_poses(&mut poses).unwrap();
        runtime.wait_get_poses(&mut poses).unwrap();
        assert!(poses[LATE_CONTROLLER].pose_is_valid);
        assert_eq!(
            runtime.poll_next_event(),
            Some(VrEvent::TrackedDeviceActivated(LATE_CONTROLLER))
        );
        assert_eq!(
            runtime.tracked_device_string(LATE_CONTROLLER, TrackedDeviceProperty::RenderModelName),
            Some(CONTROLLER_MODEL.to_string())
        );
    }

    #[test]
    fn poses_cover_hmd_controller_and_base_stations() {
        let mut runtime = fast_runtime();
        let mut poses = [TrackedDevicePose::INVALID; MAX_TRACKED_DEVICE_COUNT];
        runtime.wait_get_poses(&mut poses).unwrap();
        let valid: Vec<usize> = (0..MAX_TRACKED_DEVICE_COUNT)
            .filter(|&i| poses[i].pose_is_valid)
            .collect();
        assert_eq!(valid, vec![0, 1, 3, 4]);
        assert_eq!(runtime.tracked_device_class(3), TrackedDeviceClass::TrackingReference);
    }

    #[test]
    fn render_models_report_loading_first() {
        let mut source = SimulatedRenderModels::default();
        assert_eq!(source.load_render_model(CONTROLLER_MODEL), LoadStatus::Pending);
        assert_eq!(source.load_render_model(CONTROLLER_MODEL), LoadStatus::Pending);
        let LoadStatus::Ready(model) = source.load_render_model(CONTROLLER_MODEL) else {
            panic!("model should be ready on the third poll");
        };
        assert_eq!(model.vertices.len(), 24);
        assert_eq!(model.indices.len(), 36);

        assert_eq!(source.load_texture(model.diffuse_texture_id), LoadStatus::Pending);
        assert!(matches!(
            source.load_texture(model.diffuse_texture_id),
            LoadStatus::Ready(TextureMapData { width: 64, height: 64, .. })
        ));
        assert!(matches!(source.load_render_model("nope"), LoadStatus::Failed(_)));
    }

    #[test]
    fn box_faces_point_outward() {
        let model = box_model(Vec3::splat(1.0), 0);
        for face in model.indices.chunks(6) {
            let [a, b, c] = [face[0], face[1], face[2]].map(|i| Vec3::from_array(model.vertices[i as usize].position));
            let normal = Vec3::from_array(model.vertices[face[0] as usize].normal);
            assert!((b - a).cross(c - a).dot(normal) > 0.0);
            assert!(a.dot(normal) > 0.0);
        }
    }

    #[test]
    fn submissions_fail_after_shutdown() {
        let mut runtime = fast_runtime();
        runtime.submit(Eye::Left, TextureHandle(7)).unwrap();
        assert_eq!(runtime.last_submitted(Eye::Left), Some(TextureHandle(7)));
        runtime.shutdown();
        assert_eq!(
            runtime.submit(Eye::Right, TextureHandle(8)),
            Err(CompositorError::Unavailable)
        );
    }
}
