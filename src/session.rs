//! Stereo session
//!
//! Owns everything that lives for one VR session: the runtime connection,
//! the GPU surface, eye targets, the distortion mesh, the pose tracker and
//! the render-model cache. Per-frame work lives in `frame.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::camera::{compute_eye_views, EyeViews};
use crate::config::AppConfig;
use crate::distortion::build_distortion_mesh;
use crate::error::{AssetLoadError, SessionInitError};
use crate::frame::Diagnostics;
use crate::gpu::{EyeTarget, GpuSurface, MeshHandle};
use crate::pose::PoseTracker;
use crate::render_model::{FinishedLoad, RenderModel, RenderModelCache, RenderModelLoader};
use crate::runtime::{
    Eye, RenderModelSource, TrackedDeviceProperty, VrEvent, VrRuntime, HMD_DEVICE_INDEX,
    MAX_TRACKED_DEVICE_COUNT,
};
use crate::scene::{cube_texture, CubeField};

/// An initialized runtime that no session owns yet. Dropping it shuts the
/// runtime down, so a failed startup step never leaves it running.
pub struct RuntimeGuard<R: VrRuntime> {
    runtime: Option<R>,
}

impl<R: VrRuntime> RuntimeGuard<R> {
    pub fn new(runtime: R) -> Self {
        Self {
            runtime: Some(runtime),
        }
    }

    pub fn get(&self) -> Option<&R> {
        self.runtime.as_ref()
    }

    /// Hands the runtime on; the caller becomes responsible for shutdown.
    pub fn into_inner(mut self) -> Option<R> {
        self.runtime.take()
    }
}

impl<R: VrRuntime> Drop for RuntimeGuard<R> {
    fn drop(&mut self) {
        if let Some(runtime) = &mut self.runtime {
            warn!("Shutting down VR runtime that never got a session");
            runtime.shutdown();
        }
    }
}

/// Where render-model polling happens.
pub enum ModelLoading {
    /// On the frame thread, blocking until each model resolves.
    Synchronous(Box<dyn RenderModelSource + Send>),
    /// On a worker thread; finished loads are picked up once per frame.
    Background(RenderModelLoader),
}

pub struct StereoSession<R: VrRuntime, G: GpuSurface> {
    pub(crate) config: AppConfig,
    pub(crate) runtime: R,
    pub(crate) gpu: G,
    pub(crate) tracker: PoseTracker,
    pub(crate) eye_views: EyeViews,
    pub(crate) eye_targets: [EyeTarget; 2],
    pub(crate) distortion_mesh: MeshHandle,
    pub(crate) models: RenderModelCache,
    pub(crate) loading: ModelLoading,
    pub(crate) device_models: [Option<Arc<RenderModel>>; MAX_TRACKED_DEVICE_COUNT],
    pub(crate) show_tracked_device: [bool; MAX_TRACKED_DEVICE_COUNT],
    /// Devices waiting on a background load, by model name.
    pub(crate) waiting: HashMap<String, Vec<usize>>,
    pub(crate) show_cubes: bool,
    pub(crate) axis_vertex_count: u32,
    pub(crate) controller_count: usize,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) frame_index: u64,
}

struct Resources {
    eye_views: EyeViews,
    eye_targets: [EyeTarget; 2],
    distortion_mesh: MeshHandle,
}

fn create_resources<R: VrRuntime, G: GpuSurface>(
    runtime: &R,
    gpu: &mut G,
    config: &AppConfig,
) -> Result<Resources, SessionInitError> {
    let eye_views = compute_eye_views(runtime, config.near_clip, config.far_clip)?;

    let (width, height) = runtime.recommended_render_target_size();
    info!(
        "Eye render targets {}x{} with {}x MSAA",
        width, height, config.msaa_samples
    );
    let eye_targets = [
        gpu.create_eye_target(Eye::Left, width, height, config.msaa_samples)?,
        gpu.create_eye_target(Eye::Right, width, height, config.msaa_samples)?,
    ];

    let mesh = build_distortion_mesh(
        |eye, u, v| runtime.compute_distortion(eye, u, v),
        config.lens_grid,
        config.lens_grid,
    )?;
    debug!(
        "Distortion mesh: {} vertices, {} indices",
        mesh.vertices.len(),
        mesh.indices.len()
    );
    let distortion_mesh = gpu.upload_distortion_mesh(&mesh);

    let field = CubeField::with_volume(config.cube_volume);
    gpu.upload_scene(&field.vertices(), &cube_texture());

    Ok(Resources {
        eye_views,
        eye_targets,
        distortion_mesh,
    })
}

impl<R: VrRuntime, G: GpuSurface> StereoSession<R, G> {
    /// Runs session startup. On failure the runtime is shut down again.
    pub fn new(mut runtime: R, mut gpu: G, config: AppConfig) -> Result<Self, SessionInitError> {
        let resources = match create_resources(&runtime, &mut gpu, &config) {
            Ok(resources) => resources,
            Err(e) => {
                runtime.shutdown();
                return Err(e);
            }
        };

        let loading = if config.background_loading {
            ModelLoading::Background(RenderModelLoader::start(
                runtime.render_models(),
                config.load_policy,
            ))
        } else {
            ModelLoading::Synchronous(runtime.render_models())
        };

        let mut session = Self {
            runtime,
            gpu,
            tracker: PoseTracker::new(),
            eye_views: resources.eye_views,
            eye_targets: resources.eye_targets,
            distortion_mesh: resources.distortion_mesh,
            models: RenderModelCache::new(config.load_policy),
            loading,
            device_models: std::array::from_fn(|_| None),
            show_tracked_device: [false; MAX_TRACKED_DEVICE_COUNT],
            waiting: HashMap::new(),
            show_cubes: config.show_cubes,
            axis_vertex_count: 0,
            controller_count: 0,
            diagnostics: Diagnostics::new(config.print_diagnostics),
            frame_index: 0,
            config,
        };
        session.setup_render_models();
        Ok(session)
    }

    /// "<tracking system> <serial>" for the HMD, for window titles and logs.
    pub fn hmd_description(&self) -> String {
        let driver = self
            .runtime
            .tracked_device_string(HMD_DEVICE_INDEX, TrackedDeviceProperty::TrackingSystemName)
            .unwrap_or_else(|| "No Driver".to_string());
        let display = self
            .runtime
            .tracked_device_string(HMD_DEVICE_INDEX, TrackedDeviceProperty::SerialNumber)
            .unwrap_or_else(|| "No Display".to_string());
        format!("{} {}", driver, display)
    }

    fn setup_render_models(&mut self) {
        for device in HMD_DEVICE_INDEX + 1..MAX_TRACKED_DEVICE_COUNT {
            if self.runtime.is_tracked_device_connected(device) {
                self.setup_render_model_for_device(device);
            }
        }
    }

    /// Finds or loads the model a device reports. With background loading
    /// the device is assigned once the load lands.
    pub fn setup_render_model_for_device(&mut self, device: usize) {
        if device >= MAX_TRACKED_DEVICE_COUNT {
            return;
        }
        let Some(name) = self
            .runtime
            .tracked_device_string(device, TrackedDeviceProperty::RenderModelName)
        else {
            warn!("Tracked device {} reports no render model", device);
            return;
        };

        match &mut self.loading {
            ModelLoading::Synchronous(source) => {
                match self.models.get_or_load(&name, source.as_mut(), &mut self.gpu) {
                    Ok(model) => {
                        self.device_models[device] = Some(model);
                        self.show_tracked_device[device] = true;
                    }
                    Err(e) => log_load_failure(&self.runtime, device, &e),
                }
            }
            ModelLoading::Background(loader) => {
                if let Some(model) = self.models.get(&name) {
                    self.device_models[device] = Some(model);
                    self.show_tracked_device[device] = true;
                    return;
                }
                let waiting = self.waiting.entry(name.clone()).or_default();
                if !waiting.contains(&device) {
                    waiting.push(device);
                }
                match loader.request(&name) {
                    Ok(true) => debug!("Queued render model {} for device {}", name, device),
                    Ok(false) => debug!("Render model {} already loading", name),
                    Err(e) => {
                        self.waiting.remove(&name);
                        log_load_failure(&self.runtime, device, &e);
                    }
                }
            }
        }
    }

    /// Assigns models whose background load finished since the last call.
    pub(crate) fn drain_finished_loads(&mut self) {
        let finished = match &mut self.loading {
            ModelLoading::Background(loader) => loader.poll(),
            ModelLoading::Synchronous(_) => return,
        };
        self.apply_finished_loads(finished);
    }

    /// Blocks until background loads settle or `timeout` runs out. Returns
    /// how many loads are still outstanding.
    pub fn finish_pending_loads(&mut self, timeout: Duration) -> usize {
        let (finished, pending) = match &mut self.loading {
            ModelLoading::Background(loader) => {
                let finished = loader.wait(timeout);
                (finished, loader.pending())
            }
            ModelLoading::Synchronous(_) => return 0,
        };
        self.apply_finished_loads(finished);
        pending
    }

    fn apply_finished_loads(&mut self, finished: Vec<FinishedLoad>) {
        for FinishedLoad { name, result } in finished {
            let devices = self.waiting.remove(&name).unwrap_or_default();
            match result.and_then(|loaded| self.models.insert_loaded(loaded, &mut self.gpu)) {
                Ok(model) => {
                    for &device in &devices {
                        self.device_models[device] = Some(Arc::clone(&model));
                        self.show_tracked_device[device] = true;
                    }
                    info!("Render model {} ready for {} device(s)", name, devices.len());
                }
                Err(e) => {
                    for &device in &devices {
                        log_load_failure(&self.runtime, device, &e);
                    }
                }
            }
        }
    }

    /// Drains runtime events and applies controller button state.
    pub fn handle_vr_events(&mut self) {
        while let Some(event) = self.runtime.poll_next_event() {
            match event {
                VrEvent::TrackedDeviceActivated(device) => {
                    info!("Device {} attached. Setting up render model.", device);
                    self.setup_render_model_for_device(device);
                }
                VrEvent::TrackedDeviceDeactivated(device) => info!("Device {} detached.", device),
                VrEvent::TrackedDeviceUpdated(device) => info!("Device {} updated.", device),
            }
        }

        // a device is hidden while any of its buttons is held
        for device in 0..MAX_TRACKED_DEVICE_COUNT {
            if let Some(pressed) = self.runtime.controller_buttons_pressed(device) {
                self.show_tracked_device[device] = pressed == 0;
            }
        }
    }

    pub fn toggle_cubes(&mut self) {
        self.show_cubes = !self.show_cubes;
        info!("Cubes {}", if self.show_cubes { "shown" } else { "hidden" });
    }

    pub fn show_cubes(&self) -> bool {
        self.show_cubes
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn tracker(&self) -> &PoseTracker {
        &self.tracker
    }

    pub fn eye_views(&self) -> &EyeViews {
        &self.eye_views
    }

    pub fn eye_target(&self, eye: Eye) -> &EyeTarget {
        &self.eye_targets[eye.index()]
    }

    pub fn models(&self) -> &RenderModelCache {
        &self.models
    }

    pub fn device_model(&self, device: usize) -> Option<&Arc<RenderModel>> {
        self.device_models.get(device).and_then(Option::as_ref)
    }

    pub fn is_device_shown(&self, device: usize) -> bool {
        self.show_tracked_device.get(device).copied().unwrap_or(false)
    }

    pub fn controller_count(&self) -> usize {
        self.controller_count
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }
}

fn log_load_failure<R: VrRuntime>(runtime: &R, device: usize, err: &AssetLoadError) {
    let system = runtime
        .tracked_device_string(device, TrackedDeviceProperty::TrackingSystemName)
        .unwrap_or_default();
    let model = err.model_name().unwrap_or("?");
    error!(
        "Unable to load render model for tracked device {} ({}.{}): {}",
        device, system, model, err
    );
}

impl<R: VrRuntime, G: GpuSurface> Drop for StereoSession<R, G> {
    fn drop(&mut self) {
        if let ModelLoading::Background(loader) = &mut self.loading {
            loader.stop();
        }
        self.device_models = std::array::from_fn(|_| None);
        self.models.release_all(&mut self.gpu);
        self.runtime.shutdown();
        info!("VR session shut down after {} frames", self.frame_index);
    }
}
