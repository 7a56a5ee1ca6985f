//! Engine configuration structures
//!
//! All tunable engine settings live here, serializable to and from TOML so
//! applications can ship a config file next to the binary. The renderer
//! settings are read once at startup; in particular `frames_in_flight` is
//! fixed for the lifetime of the [`Renderer`](crate::render::Renderer) and
//! sizes every per-frame resource array in the engine.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the config file from disk failed
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file contents were not valid TOML for the expected schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value is outside its supported range
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Renderer settings, fixed at [`Renderer`](crate::render::Renderer) creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frames the CPU may record ahead of the GPU.
    ///
    /// Sizes every per-frame resource array (uniform buffer sets, descriptor
    /// pools, command buffers, release queues). Immutable after init.
    pub frames_in_flight: u32,

    /// Prefer FIFO presentation (vsync) over mailbox
    pub vsync: bool,

    /// Enable Vulkan validation layers in debug builds
    pub enable_validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            vsync: true,
            enable_validation: true,
        }
    }
}

impl RendererConfig {
    /// Validate field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.frames_in_flight > 8 {
            return Err(ConfigError::Invalid(format!(
                "frames_in_flight = {} is unreasonably large (expected 2 or 3)",
                self.frames_in_flight
            )));
        }
        Ok(())
    }
}

/// Window settings for the platform layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Initial window width in pixels
    pub width: u32,
    /// Initial window height in pixels
    pub height: u32,
    /// Whether the window may be resized by the user
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Ember Engine".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Renderer subsystem settings
    pub renderer: RendererConfig,
    /// Window settings
    pub window: WindowConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file, validating field ranges
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.renderer.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_in_flight, 3);
    }

    #[test]
    fn zero_frames_in_flight_rejected() {
        let config = RendererConfig {
            frames_in_flight: 0,
            ..RendererConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_parses_from_toml() {
        let toml = r#"
            [renderer]
            frames_in_flight = 2
            vsync = false

            [window]
            title = "demo"
            width = 800
            height = 600
        "#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.renderer.frames_in_flight, 2);
        assert!(!config.renderer.vsync);
        assert!(config.renderer.enable_validation); // defaulted
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.renderer.frames_in_flight, 3);
        assert_eq!(config.window.title, "Ember Engine");
    }
}
