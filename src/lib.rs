//! Stereo VR core
//!
//! Renders a tracked scene once per eye into multisampled targets, resolves
//! them, submits both eyes to the VR compositor and mirrors a lens-corrected
//! view into a desktop companion window.

use std::sync::Arc;

use log::{error, info};
use winit::application::ApplicationHandler;
use winit::dpi::{LogicalPosition, LogicalSize};
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

pub mod camera;
pub mod config;
pub mod distortion;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod input;
pub mod math;
pub mod pose;
pub mod render_model;
pub mod renderer;
pub mod runtime;
pub mod scene;
pub mod session;
pub mod simulated;

#[cfg(test)]
mod testing;

use crate::config::AppConfig;
use crate::error::Error;
use crate::input::AppAction;
use crate::renderer::WgpuSurface;
use crate::runtime::{ApplicationType, VrRuntime};
use crate::session::{RuntimeGuard, StereoSession};
use crate::simulated::SimulatedRuntime;

const COMPANION_WINDOW_SIZE: (u32, u32) = (1280, 720);

/// Main application state
struct VrApp {
    config: AppConfig,
    /// Held until the window exists, then moved into the session. Shuts the
    /// runtime down if that never happens.
    runtime: Option<RuntimeGuard<SimulatedRuntime>>,
    window: Option<Arc<Window>>,
    session: Option<StereoSession<SimulatedRuntime, WgpuSurface>>,
    error: Option<Error>,
}

impl VrApp {
    fn new(config: AppConfig, runtime: RuntimeGuard<SimulatedRuntime>) -> Self {
        Self {
            config,
            runtime: Some(runtime),
            window: None,
            session: None,
            error: None,
        }
    }

    fn start_session(&mut self, event_loop: &ActiveEventLoop) -> Result<(), Error> {
        // every early return below drops the guard, which shuts the runtime down
        let Some(runtime) = self.runtime.take() else {
            return Ok(());
        };

        let window_attrs = Window::default_attributes()
            .with_title("hellovr")
            .with_inner_size(LogicalSize::new(COMPANION_WINDOW_SIZE.0, COMPANION_WINDOW_SIZE.1))
            .with_position(LogicalPosition::new(700, 100));
        let window = Arc::new(event_loop.create_window(window_attrs)?);
        self.window = Some(window.clone());

        let gpu = pollster::block_on(WgpuSurface::new(window.clone(), &self.config))?;
        info!("Renderer initialized");

        let Some(runtime) = runtime.into_inner() else {
            return Ok(());
        };
        let session = StereoSession::new(runtime, gpu, self.config.clone())?;
        window.set_title(&format!("hellovr - {}", session.hmd_description()));
        self.session = Some(session);

        window.request_redraw();
        Ok(())
    }
}

impl ApplicationHandler for VrApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.is_some() {
            return;
        }
        info!("App resumed - creating companion window");
        if let Err(e) = self.start_session(event_loop) {
            error!("Startup failed: {}", e);
            self.error = Some(e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                event_loop.exit();
            }

            WindowEvent::KeyboardInput { event, .. } => match input::handle_keyboard_input(&event) {
                Some(AppAction::Quit) => {
                    info!("Quit requested");
                    event_loop.exit();
                }
                Some(AppAction::ToggleCubes) => {
                    if let Some(session) = &mut self.session {
                        session.toggle_cubes();
                    }
                }
                None => {}
            },

            WindowEvent::RedrawRequested => {
                if event_loop.exiting() {
                    return;
                }
                if let Some(session) = &mut self.session {
                    session.handle_vr_events();
                    session.render_frame();
                }
                // Request next frame
                if let Some(window) = &self.window {
                    window.request_redraw();
                }
            }

            WindowEvent::Resized(size) => {
                if let Some(session) = &mut self.session {
                    session.gpu_mut().resize(size.width, size.height);
                }
            }

            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(session) = self.session.take() {
            info!("Shutting down after {} frames", session.frame_index());
        }
        self.window = None;
    }
}

/// Runs the companion window against the simulated runtime until the window
/// closes or a quit key is pressed.
pub fn run() -> Result<(), Error> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let filter = config::log_filter(config::wants_verbose(&args));
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
    let config = AppConfig::from_args(args)?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let runtime = SimulatedRuntime::init(ApplicationType::Scene).map_err(error::SessionInitError::from)?;
    let runtime = RuntimeGuard::new(runtime);

    let mut app = VrApp::new(config, runtime);
    event_loop.run_app(&mut app)?;

    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
