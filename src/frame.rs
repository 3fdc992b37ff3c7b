//! Per-frame pipeline
//!
//! One call to [`StereoSession::render_frame`] walks the stages
//! `PoseUpdate → RenderLeft → ResolveLeft → RenderRight → ResolveRight →
//! Distort → Submit → Present`. Nothing in here fails the frame: bad poses,
//! missing models and rejected submissions are logged and skipped.

use glam::Mat4;
use log::{info, warn};

use crate::gpu::{DrawCall, EyePass, GpuSurface};
use crate::runtime::{Eye, TrackedDeviceClass, VrRuntime, HMD_DEVICE_INDEX, MAX_TRACKED_DEVICE_COUNT};
use crate::scene::{controller_axis_vertices, AXIS_VERTICES_PER_CONTROLLER};
use crate::session::StereoSession;

/// Eye targets are cleared to a dark slate rather than black.
pub const CLEAR_COLOR: [f64; 4] = [0.15, 0.15, 0.18, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    PoseUpdate,
    RenderLeft,
    ResolveLeft,
    RenderRight,
    ResolveRight,
    Distort,
    Submit,
    Present,
}

impl FrameStage {
    pub fn next(self) -> Option<FrameStage> {
        use FrameStage::*;
        match self {
            PoseUpdate => Some(RenderLeft),
            RenderLeft => Some(ResolveLeft),
            ResolveLeft => Some(RenderRight),
            RenderRight => Some(ResolveRight),
            ResolveRight => Some(Distort),
            Distort => Some(Submit),
            Submit => Some(Present),
            Present => None,
        }
    }
}

/// What one frame did, mostly for diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub valid_pose_count: usize,
    pub pose_classes: String,
    pub controller_count: usize,
    pub head_pose: Mat4,
    /// Render models drawn per eye.
    pub models_drawn: usize,
    /// Eye textures the compositor accepted.
    pub submitted: usize,
}

/// Logs pose and controller counts, only when they change.
#[derive(Debug)]
pub struct Diagnostics {
    enabled: bool,
    last: Option<(usize, usize)>,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, last: None }
    }

    /// Returns whether the counts changed since the previous frame.
    pub fn observe(&mut self, valid_pose_count: usize, pose_classes: &str, controller_count: usize) -> bool {
        let current = (valid_pose_count, controller_count);
        if self.last == Some(current) {
            return false;
        }
        self.last = Some(current);
        if self.enabled {
            info!(
                "PoseCount:{}({}) Controllers:{}",
                valid_pose_count, pose_classes, controller_count
            );
        }
        true
    }
}

impl<R: VrRuntime, G: GpuSurface> StereoSession<R, G> {
    pub fn render_frame(&mut self) -> FrameReport {
        self.drain_finished_loads();
        self.frame_index += 1;

        let mut report = FrameReport {
            frame_index: self.frame_index,
            valid_pose_count: 0,
            pose_classes: String::new(),
            controller_count: self.controller_count,
            head_pose: self.tracker.head_pose(),
            models_drawn: 0,
            submitted: 0,
        };
        let mut focus_captured = false;

        let mut stage = FrameStage::PoseUpdate;
        loop {
            match stage {
                FrameStage::PoseUpdate => {
                    let snapshot = self.tracker.update_poses(&mut self.runtime);
                    report.valid_pose_count = snapshot.valid_pose_count;
                    report.pose_classes = snapshot.pose_classes;
                    report.head_pose = snapshot.head_pose;

                    focus_captured = self.runtime.is_input_focus_captured_by_another_process();
                    self.update_controller_axes(focus_captured);
                    report.controller_count = self.controller_count;
                }
                FrameStage::RenderLeft => {
                    report.models_drawn = self.render_eye(Eye::Left, focus_captured);
                }
                FrameStage::ResolveLeft => self.gpu.resolve(&self.eye_targets[Eye::Left.index()]),
                FrameStage::RenderRight => {
                    self.render_eye(Eye::Right, focus_captured);
                }
                FrameStage::ResolveRight => self.gpu.resolve(&self.eye_targets[Eye::Right.index()]),
                FrameStage::Distort => self.gpu.distort(
                    self.distortion_mesh,
                    &self.eye_targets[Eye::Left.index()],
                    &self.eye_targets[Eye::Right.index()],
                ),
                FrameStage::Submit => {
                    for eye in Eye::BOTH {
                        let texture = self.eye_targets[eye.index()].resolved;
                        match self.runtime.submit(eye, texture) {
                            Ok(()) => report.submitted += 1,
                            Err(e) => warn!("Compositor rejected frame {}: {}", self.frame_index, e),
                        }
                    }
                }
                FrameStage::Present => {
                    self.gpu.present(self.config.vblank && self.config.finish_hack);
                }
            }

            match stage.next() {
                Some(next) => stage = next,
                None => break,
            }
        }

        self.diagnostics.observe(
            report.valid_pose_count,
            &report.pose_classes,
            report.controller_count,
        );
        report
    }

    /// Rebuilds the controller line buffer from this frame's poses. Left
    /// untouched while another process has input focus.
    fn update_controller_axes(&mut self, focus_captured: bool) {
        if focus_captured {
            return;
        }

        let mut vertices = Vec::with_capacity(4 * AXIS_VERTICES_PER_CONTROLLER);
        let mut controllers = 0;
        let devices = self.tracker.devices();
        for device in HMD_DEVICE_INDEX + 1..MAX_TRACKED_DEVICE_COUNT {
            if !self.runtime.is_tracked_device_connected(device)
                || self.runtime.tracked_device_class(device) != TrackedDeviceClass::Controller
            {
                continue;
            }
            controllers += 1;
            if !devices.is_pose_valid(device) {
                continue;
            }
            if let Some(transform) = devices.transform(device) {
                vertices.extend(controller_axis_vertices(&transform));
            }
        }

        self.controller_count = controllers;
        self.axis_vertex_count = self.gpu.update_controller_axes(&vertices);
    }

    /// Builds and renders one eye's draw list; returns the render models drawn.
    fn render_eye(&mut self, eye: Eye, focus_captured: bool) -> usize {
        let view_projection = self
            .eye_views
            .view_projection(eye, self.tracker.head_pose());
        let mut draws = Vec::new();

        if self.show_cubes {
            draws.push(DrawCall::Scene {
                mvp: view_projection,
            });
        }
        if !focus_captured && self.axis_vertex_count > 0 {
            draws.push(DrawCall::ControllerAxes {
                view_projection,
                vertex_count: self.axis_vertex_count,
            });
        }

        let devices = self.tracker.devices();
        let mut models_drawn = 0;
        for (device, model) in self.device_models.iter().enumerate() {
            let Some(model) = model else { continue };
            if !self.show_tracked_device[device] || !devices.is_pose_valid(device) {
                continue;
            }
            if focus_captured
                && self.runtime.tracked_device_class(device) == TrackedDeviceClass::Controller
            {
                continue;
            }
            let Some(transform) = devices.transform(device) else { continue };
            draws.push(DrawCall::RenderModel {
                device,
                model: model.gpu(),
                mvp: view_projection * transform.to_mat4(),
            });
            models_drawn += 1;
        }

        self.gpu.render_eye(&EyePass {
            eye,
            target: self.eye_targets[eye.index()],
            clear_color: CLEAR_COLOR,
            draws,
        });
        models_drawn
    }
}
