//! Error types for session startup, GPU targets, asset loading and configuration.

use crate::runtime::Eye;

/// Failures from the VR runtime boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("VR runtime failed to initialize: {0}")]
    Init(String),
    #[error("no head-mounted display is present")]
    HmdNotFound,
    #[error("runtime has no {what} data for the {eye:?} eye")]
    EyeData { eye: Eye, what: &'static str },
}

/// Failures reported by the compositor for a single frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompositorError {
    #[error("compositor is not available")]
    Unavailable,
    #[error("pose request failed: {0}")]
    PoseRequest(String),
    #[error("texture submission for the {eye:?} eye was rejected: {reason}")]
    Submit { eye: Eye, reason: String },
}

/// Fatal at startup: no partial session is left running.
#[derive(Debug, thiserror::Error)]
pub enum SessionInitError {
    #[error("unable to init VR runtime: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("unable to compute the {eye:?} eye view: {source}")]
    EyeView {
        eye: Eye,
        #[source]
        source: RuntimeError,
    },
    #[error("eye render targets could not be created: {0}")]
    Framebuffer(#[from] FramebufferError),
    #[error("distortion mesh could not be built: {0}")]
    Distortion(#[from] MeshError),
    #[error("GPU initialization failed: {0}")]
    Gpu(String),
}

/// An eye target failed its completeness check.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FramebufferError {
    #[error("render target size {width}x{height} is invalid (limit {max})")]
    InvalidSize { width: u32, height: u32, max: u32 },
    #[error("{samples}x multisampling is not supported for eye targets")]
    UnsupportedSampleCount { samples: u32 },
}

/// Per-device, recoverable: the device renders without a model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AssetLoadError {
    #[error("unable to load render model {name}: {reason}")]
    Model { name: String, reason: String },
    #[error("unable to load texture id {texture_id} for render model {name}: {reason}")]
    Texture {
        name: String,
        texture_id: u32,
        reason: String,
    },
    #[error("render model {name} was still loading after {retries} retries")]
    TimedOut { name: String, retries: u32 },
    #[error("unable to create GPU model from render model {name}: {reason}")]
    Upload { name: String, reason: String },
    #[error("render model loader has shut down")]
    LoaderStopped,
}

impl AssetLoadError {
    /// Name of the model the failure belongs to, when known.
    pub fn model_name(&self) -> Option<&str> {
        match self {
            AssetLoadError::Model { name, .. }
            | AssetLoadError::Texture { name, .. }
            | AssetLoadError::TimedOut { name, .. }
            | AssetLoadError::Upload { name, .. } => Some(name),
            AssetLoadError::LoaderStopped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error("distortion grid must be at least 2x2, got {width}x{height}")]
    GridTooSmall { width: usize, height: usize },
    #[error("distortion grid {width}x{height} needs {vertices} vertices, more than 16-bit indices can address")]
    GridTooLarge {
        width: usize,
        height: usize,
        vertices: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{flag} expects a value")]
    MissingValue { flag: &'static str },
    #[error("invalid value {value:?} for {flag}")]
    InvalidValue { flag: &'static str, value: String },
}

/// Everything that can end the application before or during startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionInitError),
    #[error("event loop failed: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),
    #[error("window could not be created: {0}")]
    Window(#[from] winit::error::OsError),
}
