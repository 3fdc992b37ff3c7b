//! Command-line configuration
//!
//! Single-dash hellovr flags:
//! `-gldebug -verbose -novblank -vblank -noglfinishhack -noprintf -cubevolume N -msaa N -syncload`

use log::warn;

use crate::distortion::DEFAULT_GRID;
use crate::error::ConfigError;
use crate::render_model::LoadPolicy;

/// Largest cube field per axis. 64^3 cubes stay under wgpu's default
/// 256 MiB buffer limit.
pub const MAX_CUBE_VOLUME: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Enables GPU API validation.
    pub gpu_debug: bool,
    pub verbose: bool,
    /// Presents the companion window with vsync.
    pub vblank: bool,
    /// Waits for the GPU after present. Only applies with `vblank`.
    pub finish_hack: bool,
    /// Logs pose/controller counts when they change.
    pub print_diagnostics: bool,
    pub cube_volume: u32,
    pub msaa_samples: u32,
    pub near_clip: f32,
    pub far_clip: f32,
    pub lens_grid: usize,
    pub load_policy: LoadPolicy,
    /// Loads render models on a worker thread instead of the frame thread.
    pub background_loading: bool,
    pub show_cubes: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gpu_debug: false,
            verbose: false,
            vblank: false,
            finish_hack: true,
            print_diagnostics: true,
            cube_volume: 20,
            msaa_samples: 4,
            near_clip: 0.1,
            far_clip: 30.0,
            lens_grid: DEFAULT_GRID,
            load_policy: LoadPolicy::default(),
            background_loading: true,
            show_cubes: true,
        }
    }
}

impl AppConfig {
    /// Parses arguments, not including the program name. Unknown flags are
    /// logged and ignored.
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.to_ascii_lowercase().as_str() {
                "-gldebug" => config.gpu_debug = true,
                "-verbose" => config.verbose = true,
                "-novblank" => config.vblank = false,
                "-vblank" => config.vblank = true,
                "-noglfinishhack" => config.finish_hack = false,
                "-noprintf" => config.print_diagnostics = false,
                "-syncload" => config.background_loading = false,
                "-cubevolume" => {
                    let volume: u32 = parse_value("-cubevolume", args.next())?;
                    if volume > MAX_CUBE_VOLUME {
                        return Err(ConfigError::InvalidValue {
                            flag: "-cubevolume",
                            value: volume.to_string(),
                        });
                    }
                    config.cube_volume = volume;
                }
                "-msaa" => {
                    let samples = parse_value("-msaa", args.next())?;
                    if !matches!(samples, 1 | 2 | 4 | 8 | 16) {
                        return Err(ConfigError::InvalidValue {
                            flag: "-msaa",
                            value: samples.to_string(),
                        });
                    }
                    config.msaa_samples = samples;
                }
                _ => warn!("Ignoring unknown argument {}", arg),
            }
        }
        Ok(config)
    }

    pub fn log_filter(&self) -> &'static str {
        log_filter(self.verbose)
    }
}

/// Default `env_logger` filter. Only this crate's records pass at debug, so
/// `-verbose` does not pull in the graphics stack's own debug output.
pub fn log_filter(verbose: bool) -> &'static str {
    if verbose {
        "stereo_vr=debug,warn"
    } else {
        "stereo_vr=info,warn"
    }
}

/// Checks for `-verbose` ahead of parsing, so parse warnings can be logged.
pub fn wants_verbose(args: &[String]) -> bool {
    args.iter().any(|arg| arg.eq_ignore_ascii_case("-verbose"))
}

fn parse_value<T: std::str::FromStr>(flag: &'static str, value: Option<String>) -> Result<T, ConfigError> {
    let value = value.ok_or(ConfigError::MissingValue { flag })?;
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue { flag, value })
}
