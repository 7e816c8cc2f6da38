// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RenderConfig {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "cobalt-gfx".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub msaa_samples: u32,
    pub clear_color: [f32; 4],
    pub depth_test: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            msaa_samples: 1,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            depth_test: true,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
        }
    }
}

impl RenderConfig {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            RenderConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(RenderConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: RenderConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get present mode as Vulkan enum. The swapchain still falls back to
    /// FIFO when the surface does not support the requested mode.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Get the configured MSAA sample count as Vulkan flags
    pub fn sample_count(&self) -> vk::SampleCountFlags {
        match self.graphics.msaa_samples {
            1 => vk::SampleCountFlags::TYPE_1,
            2 => vk::SampleCountFlags::TYPE_2,
            4 => vk::SampleCountFlags::TYPE_4,
            8 => vk::SampleCountFlags::TYPE_8,
            16 => vk::SampleCountFlags::TYPE_16,
            other => {
                log::warn!("Unsupported msaa_samples {}, defaulting to 1", other);
                vk::SampleCountFlags::TYPE_1
            }
        }
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.graphics.clear_color
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_sections_missing() {
        let config: RenderConfig = toml::from_str("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.present_mode, "mailbox");
        assert!(config.graphics.depth_test);
        assert!(config.debug.validation_layers);
    }

    #[test]
    fn partial_sections_parse() {
        let config: RenderConfig = toml::from_str(
            r#"
            [graphics]
            present_mode = "fifo"
            msaa_samples = 4

            [debug]
            validation_layers = false
            "#,
        )
        .unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.sample_count(), vk::SampleCountFlags::TYPE_4);
        assert!(!config.debug.validation_layers);
        // untouched section keeps defaults
        assert_eq!(config.window.height, 720);
    }

    #[test]
    fn unknown_present_mode_falls_back() {
        let mut config = RenderConfig::default();
        config.graphics.present_mode = "turbo".to_string();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn unsupported_sample_count_falls_back() {
        let mut config = RenderConfig::default();
        config.graphics.msaa_samples = 3;
        assert_eq!(config.sample_count(), vk::SampleCountFlags::TYPE_1);
    }
}
