// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section has defaults, so a missing file or a missing key never stops
// the display from coming up. `[display]` is what the library itself reads;
// the other sections drive the demo binary.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::format::parse_format;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub display: DisplayConfig,
    pub debug: DebugConfig,
    pub source: SourceConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    /// Non-resizable window.
    pub fixed_size: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Video Presenter".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
            fixed_size: false,
        }
    }
}

/// Presentation, pool and GPU settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub vsync: bool,
    pub tearing_permitted: bool,
    /// Position in the name-sorted GPU list; automatic choice when unset.
    pub gpu_index: Option<usize>,
    pub shader_dir: PathBuf,
    pub frames_in_flight: usize,
    /// Transfer images created up front.
    pub initial_image_count: usize,
    pub filled_queue_depth: usize,
    /// Unbounded when unset.
    pub available_queue_capacity: Option<usize>,
    pub available_wait_ms: u64,
    pub filled_wait_ms: u64,
    /// How long a non-discardable `queue_image` may block; forever when unset.
    pub blocking_queue_timeout_ms: Option<u64>,
    pub swapchain_timeout_ms: u64,
    pub swapchain_retry_limit: u32,
    pub clear_color: [f32; 4],
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            tearing_permitted: false,
            gpu_index: None,
            shader_dir: PathBuf::from("shaders"),
            frames_in_flight: 3,
            initial_image_count: 3,
            filled_queue_depth: 1,
            available_queue_capacity: None,
            available_wait_ms: 5,
            filled_wait_ms: 50,
            blocking_queue_timeout_ms: None,
            swapchain_timeout_ms: 1000,
            swapchain_retry_limit: 3,
            clear_color: [0.01, 0.01, 0.01, 1.0],
        }
    }
}

impl DisplayConfig {
    pub fn available_wait(&self) -> Duration {
        Duration::from_millis(self.available_wait_ms)
    }

    pub fn filled_wait(&self) -> Duration {
        Duration::from_millis(self.filled_wait_ms)
    }

    pub fn blocking_queue_timeout(&self) -> Option<Duration> {
        self.blocking_queue_timeout_ms.map(Duration::from_millis)
    }

    pub fn swapchain_timeout(&self) -> Duration {
        Duration::from_millis(self.swapchain_timeout_ms)
    }

    /// Preferred present mode for the vsync/tearing pair.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match (self.vsync, self.tearing_permitted) {
            (true, false) => vk::PresentModeKHR::FIFO,
            (true, true) => vk::PresentModeKHR::FIFO_RELAXED,
            (false, false) => vk::PresentModeKHR::MAILBOX,
            (false, true) => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub fps_report_secs: u64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            fps_report_secs: 5,
        }
    }
}

/// Test-pattern source used by the demo binary
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub fps: f64,
    pub deinterlace: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: "R8G8B8A8_UNORM".to_string(),
            fps: 30.0,
            deinterlace: false,
        }
    }
}

impl SourceConfig {
    pub fn vk_format(&self) -> Result<vk::Format> {
        parse_format(&self.format).with_context(|| format!("Unknown source format '{}'", self.format))
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.display.filled_queue_depth, 1);
        assert_eq!(config.display.swapchain_retry_limit, 3);
        assert_eq!(config.display.filled_wait(), Duration::from_millis(50));
        assert_eq!(config.display.available_wait(), Duration::from_millis(5));
        assert_eq!(config.display.blocking_queue_timeout(), None);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [display]
            vsync = false
            gpu_index = 1
            blocking_queue_timeout_ms = 40

            [source]
            format = "g8b8g8r8_422_unorm"
            "#,
        )
        .unwrap();
        assert!(!config.display.vsync);
        assert_eq!(config.display.gpu_index, Some(1));
        assert_eq!(config.display.blocking_queue_timeout(), Some(Duration::from_millis(40)));
        assert_eq!(config.display.frames_in_flight, 3);
        assert_eq!(config.source.vk_format().unwrap(), vk::Format::G8B8G8R8_422_UNORM);
    }

    #[test]
    fn present_mode_mapping() {
        let mut display = DisplayConfig::default();
        let mut mode = |vsync, tearing| {
            display.vsync = vsync;
            display.tearing_permitted = tearing;
            display.present_mode()
        };
        assert_eq!(mode(true, false), vk::PresentModeKHR::FIFO);
        assert_eq!(mode(true, true), vk::PresentModeKHR::FIFO_RELAXED);
        assert_eq!(mode(false, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(mode(false, true), vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn unknown_source_format_is_an_error() {
        let config = Config::parse("[source]\nformat = \"YUYV\"").unwrap();
        assert!(config.source.vk_format().is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[display]\nvsync = \"maybe\"").is_err());
    }
}
