use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CoreError;

/// Environment variable that overrides the config search path.
pub const CONFIG_ENV: &str = "FIXVK_CONFIG";

/// Top-level fixvk configuration, loaded from fixvk.toml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixvkConfig {
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub frame: FrameConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Enable the Khronos validation layer when it is installed
    #[serde(default = "default_true", alias = "enableValidation")]
    pub enable_validation: bool,
    /// FIFO present mode instead of immediate
    #[serde(default, alias = "enableVSync")]
    pub enable_vsync: bool,
    /// Anisotropic filtering on the shared texture sampler
    #[serde(default = "default_true", alias = "enableAnisotropy")]
    pub enable_anisotropy: bool,
    /// Anisotropy level (1-16)
    #[serde(default = "default_anisotropy_level", alias = "anisotropyLevel")]
    pub anisotropy_level: u32,
    /// Back buffer width
    #[serde(default = "default_width")]
    pub width: u32,
    /// Back buffer height
    #[serde(default = "default_height")]
    pub height: u32,
    /// Size the swap surface to the display instead of the window
    #[serde(default)]
    pub fullscreen: bool,
    /// Create a depth-stencil image alongside the swap surface
    #[serde(default = "default_true", alias = "autoDepthStencil")]
    pub auto_depth_stencil: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Apply `lod_bias` to the texture sampler
    #[serde(default, alias = "enableLODBias")]
    pub enable_lod_bias: bool,
    /// Texture LOD bias
    #[serde(default, alias = "LODBias0")]
    pub lod_bias: f32,
    /// Treat viewport and scissor as dynamic pipeline state
    #[serde(default = "default_true", alias = "dynamicViewport")]
    pub dynamic_viewport: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Number of frame contexts the CPU may run ahead by (1-3)
    #[serde(default = "default_frames_in_flight", alias = "framesInFlight")]
    pub frames_in_flight: u32,
    /// Upper bound on the per-frame fence wait
    #[serde(default = "default_fence_timeout_ms", alias = "fenceTimeoutMs")]
    pub fence_timeout_ms: u64,
    /// Per-frame ring for DrawPrimitiveUP style draws, in bytes
    #[serde(default = "default_immediate_buffer_size", alias = "immediateBufferSize")]
    pub immediate_buffer_size: u64,
    /// Maximum number of textures that can be bound over a session
    #[serde(default = "default_max_textures", alias = "maxTextures")]
    pub max_textures: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            enable_validation: true,
            enable_vsync: false,
            enable_anisotropy: true,
            anisotropy_level: default_anisotropy_level(),
            width: default_width(),
            height: default_height(),
            fullscreen: false,
            auto_depth_stencil: true,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_lod_bias: false,
            lod_bias: 0.0,
            dynamic_viewport: true,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            fence_timeout_ms: default_fence_timeout_ms(),
            immediate_buffer_size: default_immediate_buffer_size(),
            max_textures: default_max_textures(),
        }
    }
}

impl PerformanceConfig {
    /// The bias the sampler should actually use.
    pub fn effective_lod_bias(&self) -> f32 {
        if self.enable_lod_bias {
            self.lod_bias
        } else {
            0.0
        }
    }
}

impl FixvkConfig {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: FixvkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("ignoring config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write configuration as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, CoreError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the renderer cannot honor.
    pub fn validate(&self) -> Result<(), CoreError> {
        let r = &self.renderer;
        if !(1..=16).contains(&r.anisotropy_level) {
            return Err(CoreError::ConfigError(format!(
                "anisotropy_level must be within 1-16, got {}",
                r.anisotropy_level
            )));
        }
        if r.width == 0 || r.height == 0 {
            return Err(CoreError::ConfigError(format!(
                "back buffer size must be non-zero, got {}x{}",
                r.width, r.height
            )));
        }
        let p = &self.performance;
        if !p.lod_bias.is_finite() || p.lod_bias.abs() > 16.0 {
            return Err(CoreError::ConfigError(format!(
                "lod_bias must be within -16..16, got {}",
                p.lod_bias
            )));
        }
        let f = &self.frame;
        if !(1..=3).contains(&f.frames_in_flight) {
            return Err(CoreError::ConfigError(format!(
                "frames_in_flight must be within 1-3, got {}",
                f.frames_in_flight
            )));
        }
        if f.immediate_buffer_size < MIN_IMMEDIATE_BUFFER_SIZE {
            return Err(CoreError::ConfigError(format!(
                "immediate_buffer_size must be at least {} bytes",
                MIN_IMMEDIATE_BUFFER_SIZE
            )));
        }
        if f.max_textures == 0 {
            return Err(CoreError::ConfigError("max_textures must be non-zero".into()));
        }
        Ok(())
    }
}

const MIN_IMMEDIATE_BUFFER_SIZE: u64 = 64 * 1024;

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. `FIXVK_CONFIG` environment variable
/// 2. System-wide config: `%PROGRAMDATA%\fixvk\fixvk.toml` (Windows) or `/etc/fixvk/fixvk.toml`
/// 3. Local fallback: `./fixvk.toml`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let system_path = fixvk_common::platform::system_config_dir().join("fixvk.toml");
    if system_path.exists() {
        return system_path;
    }
    PathBuf::from("fixvk.toml")
}

fn default_true() -> bool {
    true
}

fn default_anisotropy_level() -> u32 {
    16
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_frames_in_flight() -> u32 {
    1
}

fn default_fence_timeout_ms() -> u64 {
    1000
}

fn default_immediate_buffer_size() -> u64 {
    4 * 1024 * 1024
}

fn default_max_textures() -> u32 {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_renderer_settings() {
        let config = FixvkConfig::default();
        assert!(config.renderer.enable_validation);
        assert!(!config.renderer.enable_vsync);
        assert!(config.renderer.enable_anisotropy);
        assert_eq!(config.renderer.anisotropy_level, 16);
        assert_eq!((config.renderer.width, config.renderer.height), (1920, 1080));
        assert!(!config.renderer.fullscreen);
        assert_eq!(config.frame.frames_in_flight, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = FixvkConfig::from_toml_str("").expect("empty config");
        assert_eq!(config, FixvkConfig::default());
    }

    #[test]
    fn test_camel_case_aliases_are_accepted() {
        let config = FixvkConfig::from_toml_str(
            r#"
            [renderer]
            enableValidation = false
            enableVSync = true
            anisotropyLevel = 4
            width = 800
            height = 600
            "#,
        )
        .expect("aliased config");
        assert!(!config.renderer.enable_validation);
        assert!(config.renderer.enable_vsync);
        assert_eq!(config.renderer.anisotropy_level, 4);
        assert_eq!(config.renderer.width, 800);
    }

    #[test]
    fn test_out_of_range_anisotropy_is_rejected() {
        let err = FixvkConfig::from_toml_str("[renderer]\nanisotropy_level = 32\n")
            .expect_err("32x anisotropy");
        assert!(matches!(err, CoreError::ConfigError(_)));
    }

    #[test]
    fn test_frames_in_flight_bounds() {
        assert!(FixvkConfig::from_toml_str("[frame]\nframes_in_flight = 2\n").is_ok());
        assert!(FixvkConfig::from_toml_str("[frame]\nframes_in_flight = 0\n").is_err());
        assert!(FixvkConfig::from_toml_str("[frame]\nframes_in_flight = 4\n").is_err());
    }

    #[test]
    fn test_lod_bias_only_applies_when_enabled() {
        let mut perf = PerformanceConfig {
            lod_bias: -1.5,
            ..Default::default()
        };
        assert_eq!(perf.effective_lod_bias(), 0.0);
        perf.enable_lod_bias = true;
        assert_eq!(perf.effective_lod_bias(), -1.5);
    }

    #[test]
    fn test_serialized_config_parses_back() {
        let mut config = FixvkConfig::default();
        config.renderer.enable_vsync = true;
        config.frame.fence_timeout_ms = 250;
        let text = config.to_toml_string().expect("serialize");
        assert_eq!(FixvkConfig::from_toml_str(&text).expect("parse"), config);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = FixvkConfig::load_or_default("/nonexistent/fixvk.toml");
        assert_eq!(config, FixvkConfig::default());
    }
}
