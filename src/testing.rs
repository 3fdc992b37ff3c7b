//! Scriptable runtime, render-model source and GPU used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use glam::{Affine3A, Mat4, Vec3};

use crate::config::AppConfig;
use crate::distortion::DistortionMesh;
use crate::error::{AssetLoadError, CompositorError, FramebufferError, RuntimeError};
use crate::gpu::{
    AxisVertex, EyePass, EyeTarget, GpuModel, GpuSurface, MeshHandle, SceneVertex, TargetHandle,
    TextureHandle,
};
use crate::math::{RawMatrix34, RawMatrix44};
use crate::render_model::LoadPolicy;
use crate::runtime::{
    ApplicationType, DistortionCoordinates, Eye, LoadStatus, RenderModelData, RenderModelSource,
    RenderModelVertex, TextureMapData, TrackedDeviceClass, TrackedDevicePose,
    TrackedDeviceProperty, VrEvent, VrRuntime, MAX_TRACKED_DEVICE_COUNT,
};

/// Config for tests: synchronous loads that never sleep.
pub fn sync_config() -> AppConfig {
    AppConfig {
        background_loading: false,
        load_policy: LoadPolicy {
            max_retries: 50,
            retry_delay: Duration::ZERO,
        },
        ..AppConfig::default()
    }
}

pub fn translation_pose(position: Vec3) -> TrackedDevicePose {
    TrackedDevicePose {
        device_to_absolute_tracking: RawMatrix34::from_affine(Affine3A::from_translation(position)),
        pose_is_valid: true,
        device_is_connected: true,
    }
}

#[derive(Default)]
struct SourceState {
    models: HashMap<String, u32>,
    model_pending: HashMap<String, u32>,
    texture_failures: HashMap<u32, String>,
    texture_pending: HashMap<u32, u32>,
    load_calls: HashMap<String, usize>,
    freed: Vec<String>,
    freed_textures: Vec<u32>,
}

/// Render-model source with per-name pending counters. Clones share state.
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<SourceState>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SourceState> {
        self.state.lock().unwrap()
    }

    pub fn add_model(&self, name: &str, texture_id: u32) {
        self.state().models.insert(name.to_string(), texture_id);
    }

    /// The next `count` loads of `name` report "still loading".
    pub fn set_model_pending(&self, name: &str, count: u32) {
        self.state().model_pending.insert(name.to_string(), count);
    }

    pub fn fail_texture(&self, texture_id: u32, reason: &str) {
        self.state().texture_failures.insert(texture_id, reason.to_string());
    }

    pub fn clear_texture_failure(&self, texture_id: u32) {
        self.state().texture_failures.remove(&texture_id);
    }

    /// The next `count` loads of `texture_id` report "still loading".
    pub fn set_texture_pending(&self, texture_id: u32, count: u32) {
        self.state().texture_pending.insert(texture_id, count);
    }

    pub fn model_load_calls(&self, name: &str) -> usize {
        self.state().load_calls.get(name).copied().unwrap_or(0)
    }

    pub fn freed(&self) -> Vec<String> {
        self.state().freed.clone()
    }

    pub fn freed_textures(&self) -> Vec<u32> {
        self.state().freed_textures.clone()
    }
}

impl RenderModelSource for MockSource {
    fn load_render_model(&mut self, name: &str) -> LoadStatus<RenderModelData> {
        let mut state = self.state();
        *state.load_calls.entry(name.to_string()).or_default() += 1;
        if let Some(pending) = state.model_pending.get_mut(name) {
            if *pending > 0 {
                *pending -= 1;
                return LoadStatus::Pending;
            }
        }
        match state.models.get(name) {
            Some(&diffuse_texture_id) => LoadStatus::Ready(RenderModelData {
                vertices: vec![
                    RenderModelVertex {
                        position: [0.0, 0.0, 0.0],
                        normal: [0.0, 0.0, 1.0],
                        texture_coord: [0.0, 0.0],
                    };
                    3
                ],
                indices: vec![0, 1, 2],
                diffuse_texture_id,
            }),
            None => LoadStatus::Failed("not found".to_string()),
        }
    }

    fn load_texture(&mut self, texture_id: u32) -> LoadStatus<TextureMapData> {
        let mut state = self.state();
        if let Some(pending) = state.texture_pending.get_mut(&texture_id) {
            if *pending > 0 {
                *pending -= 1;
                return LoadStatus::Pending;
            }
        }
        match state.texture_failures.get(&texture_id) {
            Some(reason) => LoadStatus::Failed(reason.clone()),
            None => LoadStatus::Ready(TextureMapData {
                width: 1,
                height: 1,
                rgba: vec![255; 4],
            }),
        }
    }

    fn free_render_model(&mut self, name: &str) {
        self.state().freed.push(name.to_string());
    }

    fn free_texture(&mut self, texture_id: u32) {
        self.state().freed_textures.push(texture_id);
    }
}

/// Runtime whose poses come from a queue of scripted frames. Once the queue
/// runs dry the last frame repeats.
pub struct MockRuntime {
    pub source: MockSource,
    pub submits: Vec<(Eye, TextureHandle)>,
    classes: [TrackedDeviceClass; MAX_TRACKED_DEVICE_COUNT],
    connected: [bool; MAX_TRACKED_DEVICE_COUNT],
    model_names: HashMap<usize, String>,
    buttons: HashMap<usize, u64>,
    frames: VecDeque<Vec<(usize, TrackedDevicePose)>>,
    last_frame: Vec<(usize, TrackedDevicePose)>,
    events: VecDeque<VrEvent>,
    focus_captured: bool,
    fail_pose_request: bool,
    fail_submits: bool,
    failing_eye: Option<Eye>,
    shutdown: Arc<AtomicBool>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            source: MockSource::new(),
            submits: Vec::new(),
            classes: [TrackedDeviceClass::Invalid; MAX_TRACKED_DEVICE_COUNT],
            connected: [false; MAX_TRACKED_DEVICE_COUNT],
            model_names: HashMap::new(),
            buttons: HashMap::new(),
            frames: VecDeque::new(),
            last_frame: Vec::new(),
            events: VecDeque::new(),
            focus_captured: false,
            fail_pose_request: false,
            fail_submits: false,
            failing_eye: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_class(&mut self, device: usize, class: TrackedDeviceClass) {
        self.classes[device] = class;
    }

    pub fn set_connected(&mut self, device: usize, connected: bool) {
        self.connected[device] = connected;
    }

    pub fn set_model_name(&mut self, device: usize, name: &str) {
        self.model_names.insert(device, name.to_string());
    }

    pub fn set_buttons(&mut self, device: usize, pressed: u64) {
        self.buttons.insert(device, pressed);
    }

    pub fn set_focus_captured(&mut self, captured: bool) {
        self.focus_captured = captured;
    }

    /// Devices not listed report an invalid pose for that frame.
    pub fn push_frame(&mut self, poses: Vec<(usize, TrackedDevicePose)>) {
        self.frames.push_back(poses);
    }

    pub fn push_event(&mut self, event: VrEvent) {
        self.events.push_back(event);
    }

    pub fn fail_next_pose_request(&mut self) {
        self.fail_pose_request = true;
    }

    pub fn fail_submits(&mut self, fail: bool) {
        self.fail_submits = fail;
    }

    pub fn fail_eye_data(&mut self, eye: Eye) {
        self.failing_eye = Some(eye);
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn check_eye(&self, eye: Eye, what: &'static str) -> Result<(), RuntimeError> {
        if self.failing_eye == Some(eye) {
            return Err(RuntimeError::EyeData { eye, what });
        }
        Ok(())
    }
}

impl VrRuntime for MockRuntime {
    fn init(_application_type: ApplicationType) -> Result<Self, RuntimeError> {
        Ok(Self::new())
    }

    fn recommended_render_target_size(&self) -> (u32, u32) {
        (640, 720)
    }

    fn projection_matrix(&self, eye: Eye, near: f32, far: f32) -> Result<RawMatrix44, RuntimeError> {
        self.check_eye(eye, "projection")?;
        Ok(RawMatrix44::from_mat4(Mat4::perspective_rh(
            100f32.to_radians(),
            640.0 / 720.0,
            near,
            far,
        )))
    }

    fn eye_to_head_transform(&self, eye: Eye) -> Result<RawMatrix34, RuntimeError> {
        self.check_eye(eye, "eye-to-head")?;
        let x = match eye {
            Eye::Left => -0.032,
            Eye::Right => 0.032,
        };
        Ok(RawMatrix34::from_affine(Affine3A::from_translation(Vec3::new(x, 0.0, 0.0))))
    }

    fn wait_get_poses(
        &mut self,
        poses: &mut [TrackedDevicePose; MAX_TRACKED_DEVICE_COUNT],
    ) -> Result<(), CompositorError> {
        if std::mem::take(&mut self.fail_pose_request) {
            return Err(CompositorError::PoseRequest("scripted failure".to_string()));
        }
        if let Some(frame) = self.frames.pop_front() {
            self.last_frame = frame;
        }
        *poses = [TrackedDevicePose::INVALID; MAX_TRACKED_DEVICE_COUNT];
        for &(device, pose) in &self.last_frame {
            poses[device] = pose;
        }
        Ok(())
    }

    fn is_input_focus_captured_by_another_process(&self) -> bool {
        self.focus_captured
    }

    fn tracked_device_class(&self, index: usize) -> TrackedDeviceClass {
        self.classes.get(index).copied().unwrap_or(TrackedDeviceClass::Invalid)
    }

    fn is_tracked_device_connected(&self, index: usize) -> bool {
        self.connected.get(index).copied().unwrap_or(false)
    }

    fn tracked_device_string(&self, index: usize, property: TrackedDeviceProperty) -> Option<String> {
        match property {
            TrackedDeviceProperty::TrackingSystemName => Some("mock".to_string()),
            TrackedDeviceProperty::SerialNumber => Some(format!("MOCK-{:04}", index + 1)),
            TrackedDeviceProperty::RenderModelName => self.model_names.get(&index).cloned(),
        }
    }

    fn compute_distortion(&self, _eye: Eye, u: f32, v: f32) -> DistortionCoordinates {
        DistortionCoordinates {
            red: [u, v],
            green: [u, v],
            blue: [u, v],
        }
    }

    fn submit(&mut self, eye: Eye, texture: TextureHandle) -> Result<(), CompositorError> {
        if self.fail_submits {
            return Err(CompositorError::Submit {
                eye,
                reason: "scripted failure".to_string(),
            });
        }
        self.submits.push((eye, texture));
        Ok(())
    }

    fn poll_next_event(&mut self) -> Option<VrEvent> {
        self.events.pop_front()
    }

    fn controller_buttons_pressed(&self, index: usize) -> Option<u64> {
        self.buttons.get(&index).copied()
    }

    fn render_models(&self) -> Box<dyn RenderModelSource + Send> {
        Box::new(self.source.clone())
    }

    fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Frame-time GPU calls, in the order they were made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuOp {
    UpdateAxes(u32),
    RenderEye(Eye),
    Resolve(Eye),
    Distort,
    Present(bool),
}

/// Records everything it is asked to do.
pub struct MockGpu {
    pub max_samples: u32,
    pub targets_created: Vec<(Eye, u32, u32, u32)>,
    pub distortion_mesh: Option<(usize, usize)>,
    pub scene_vertices: usize,
    pub passes: Vec<EyePass>,
    pub ops: Vec<GpuOp>,
    uploaded_models: Vec<String>,
    fail_uploads: bool,
    released: Arc<AtomicUsize>,
    next_handle: u32,
}

impl MockGpu {
    pub fn new() -> Self {
        Self {
            max_samples: 8,
            targets_created: Vec::new(),
            distortion_mesh: None,
            scene_vertices: 0,
            passes: Vec::new(),
            ops: Vec::new(),
            uploaded_models: Vec::new(),
            fail_uploads: false,
            released: Arc::new(AtomicUsize::new(0)),
            next_handle: 1,
        }
    }

    pub fn model_uploads(&self) -> usize {
        self.uploaded_models.len()
    }

    pub fn fail_model_uploads(&mut self, fail: bool) {
        self.fail_uploads = fail;
    }

    pub fn released_models(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn released_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.released)
    }

    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl GpuSurface for MockGpu {
    fn create_eye_target(
        &mut self,
        eye: Eye,
        width: u32,
        height: u32,
        samples: u32,
    ) -> Result<EyeTarget, FramebufferError> {
        if samples > self.max_samples {
            return Err(FramebufferError::UnsupportedSampleCount { samples });
        }
        self.targets_created.push((eye, width, height, samples));
        Ok(EyeTarget {
            eye,
            width,
            height,
            samples,
            target: TargetHandle(self.handle()),
            resolved: TextureHandle(u64::from(self.handle())),
        })
    }

    fn upload_scene(&mut self, vertices: &[SceneVertex], _texture: &TextureMapData) {
        self.scene_vertices = vertices.len();
    }

    fn upload_distortion_mesh(&mut self, mesh: &DistortionMesh) -> MeshHandle {
        self.distortion_mesh = Some((mesh.vertices.len(), mesh.indices.len()));
        MeshHandle(self.handle())
    }

    fn upload_render_model(
        &mut self,
        name: &str,
        model: &RenderModelData,
        _texture: &TextureMapData,
    ) -> Result<GpuModel, AssetLoadError> {
        if self.fail_uploads {
            return Err(AssetLoadError::Upload {
                name: name.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.uploaded_models.push(name.to_string());
        Ok(GpuModel {
            mesh: MeshHandle(self.handle()),
            texture: TextureHandle(u64::from(self.handle())),
            index_count: model.indices.len() as u32,
        })
    }

    fn update_controller_axes(&mut self, vertices: &[AxisVertex]) -> u32 {
        let count = vertices.len() as u32;
        self.ops.push(GpuOp::UpdateAxes(count));
        count
    }

    fn render_eye(&mut self, pass: &EyePass) {
        self.ops.push(GpuOp::RenderEye(pass.eye));
        self.passes.push(pass.clone());
    }

    fn resolve(&mut self, target: &EyeTarget) {
        self.ops.push(GpuOp::Resolve(target.eye));
    }

    fn distort(&mut self, _mesh: MeshHandle, _left: &EyeTarget, _right: &EyeTarget) {
        self.ops.push(GpuOp::Distort);
    }

    fn present(&mut self, wait_idle: bool) {
        self.ops.push(GpuOp::Present(wait_idle));
    }

    fn release_render_model(&mut self, _model: &GpuModel) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
