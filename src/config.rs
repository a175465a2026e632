//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the print endpoint,
//! including the printer target, the raster command options, capture
//! settings and the Chrome launch arguments derived from them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the print endpoint
///
/// Controls the HTTP listener, the capture viewport, the printer target and
/// the sizing of the worker and browser pools.
///
/// # Examples
///
/// ```rust
/// use print_endpoint::{Config, DriverType, PrinterTarget};
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     print_width: 576,
///     printer: PrinterTarget {
///         driver_type: DriverType::Epson,
///         queue_name: "front-counter".to_string(),
///     },
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP endpoint binds to (default: 0.0.0.0:3000)
    pub listen_addr: String,

    /// Target print width in pixels (default: 380)
    ///
    /// Used as the capture viewport width. Captured bitmaps never exceed it.
    pub print_width: u32,

    /// Capture viewport height in pixels (default: 10000)
    ///
    /// Document height is unknown before layout, so an oversized viewport is
    /// used and the screenshot is clipped to the content element.
    pub viewport_height: u32,

    /// Destination printer queue and driver
    pub printer: PrinterTarget,

    /// Extra commands wrapped around the raster image
    pub commands: PrintCommands,

    /// Directory for capture and device-buffer artifacts (default: ./temp)
    pub temp_dir: PathBuf,

    /// Number of pipeline workers (default: number of CPUs, at most 4)
    pub worker_count: usize,

    /// Pending jobs accepted before new ones are rejected (default: 64)
    pub queue_capacity: usize,

    /// Number of Chrome browser instances kept alive (default: 2)
    pub browser_pool_size: usize,

    /// Upper bound for one capture, launch to screenshot (default: 30 seconds)
    pub capture_timeout: Duration,

    /// Quiet period without in-flight requests that counts as network idle
    /// (default: 500ms)
    pub network_idle_window: Duration,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Artifacts older than this are deleted by the reaper (default: 1 hour)
    pub artifact_max_age: Duration,

    /// How often the reaper scans the temp directory (default: 10 minutes)
    pub reap_interval: Duration,

    /// Largest accepted request body in bytes (default: 50MB)
    pub max_body_bytes: usize,

    /// Number of finished jobs remembered for polling (default: 256)
    pub job_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            print_width: 380,
            viewport_height: 10_000,
            printer: PrinterTarget::default(),
            commands: PrintCommands::default(),
            temp_dir: PathBuf::from("./temp"),
            worker_count: num_cpus::get().clamp(1, 4),
            queue_capacity: 64,
            browser_pool_size: 2,
            capture_timeout: Duration::from_secs(30),
            network_idle_window: Duration::from_millis(500),
            chrome_path: None,
            artifact_max_age: Duration::from_secs(60 * 60),
            reap_interval: Duration::from_secs(10 * 60),
            max_body_bytes: 50 * 1024 * 1024,
            job_history: 256,
        }
    }
}

impl Config {
    /// Check the invariants the pipeline relies on
    pub fn validate(&self) -> Result<(), String> {
        if self.print_width < 50 {
            return Err("Print width must be at least 50 pixels".to_string());
        }

        if self.viewport_height == 0 {
            return Err("Viewport height must be greater than 0".to_string());
        }

        if self.worker_count == 0 {
            return Err("Worker count must be greater than 0".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("Queue capacity must be greater than 0".to_string());
        }

        if self.browser_pool_size == 0 {
            return Err("Browser pool size must be greater than 0".to_string());
        }

        if self.capture_timeout.is_zero() {
            return Err("Capture timeout must be greater than 0".to_string());
        }

        if self.printer.queue_name.trim().is_empty() {
            return Err("Printer queue name must not be empty".to_string());
        }

        Ok(())
    }
}

/// Printer destination supplied by the caller
///
/// The queue name is passed untouched to the OS print client; the driver
/// type selects the raster command set.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PrinterTarget {
    pub driver_type: DriverType,
    pub queue_name: String,
}

impl Default for PrinterTarget {
    fn default() -> Self {
        Self {
            driver_type: DriverType::Epson,
            queue_name: "thermal".to_string(),
        }
    }
}

/// Supported raster command sets
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverType {
    /// ESC/POS `GS v 0` raster image (default)
    #[default]
    Epson,
    /// ESC/POS `ESC *` 24-dot column images, for printers without `GS v 0`
    EpsonEscStar,
    /// StarPRNT `ESC GS S` raster image
    Star,
}

impl std::str::FromStr for DriverType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "epson" => Ok(DriverType::Epson),
            "epson_esc_star" | "esc_star" => Ok(DriverType::EpsonEscStar),
            "star" => Ok(DriverType::Star),
            other => Err(format!("unknown driver type: {other}")),
        }
    }
}

/// Commands written around the raster image
///
/// The defaults reproduce the plain job layout: the image command followed
/// by two line feeds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PrintCommands {
    /// Reset the printer before the image (ESC @)
    pub explicit_init: bool,
    /// Switch to standard mode before the image (ESC S)
    pub force_standard_mode: bool,
    /// Line feeds before the image
    pub lines_before: usize,
    /// Line feeds after the image (default: 2)
    pub lines_after: usize,
    /// Cut the paper after the trailing feeds
    pub cut: bool,
}

impl Default for PrintCommands {
    fn default() -> Self {
        Self {
            explicit_init: false,
            force_standard_mode: false,
            lines_before: 0,
            lines_after: 2,
            cut: false,
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// # Examples
///
/// ```rust
/// use print_endpoint::{Config, get_chrome_args_with_instance_id};
///
/// let config = Config::default();
/// let args = get_chrome_args_with_instance_id(&config, Some(0));
/// assert!(args.contains(&"--headless".to_string()));
/// ```
pub fn get_chrome_args_with_instance_id(
    config: &Config,
    instance_id: Option<usize>,
) -> Vec<String> {
    let unique_id = match instance_id {
        Some(id) => format!("{}-{}", std::process::id(), id),
        None => format!("{}-{}", std::process::id(), uuid::Uuid::new_v4()),
    };

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--font-render-hinting=none".to_string(),
        format!("--window-size={},{}", config.print_width, config.viewport_height),
        // Pooled instances must not share a profile
        format!("--user-data-dir=/tmp/print-endpoint-chromium-{}", unique_id),
    ]
}

pub fn create_browser_config_with_instance_id(
    config: &Config,
    instance_id: Option<usize>,
) -> Result<chromiumoxide::browser::BrowserConfig, String> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.print_width, config.viewport_height)
        .args(get_chrome_args_with_instance_id(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_plain_job_layout() {
        let commands = PrintCommands::default();
        assert_eq!(commands.lines_after, 2);
        assert_eq!(commands.lines_before, 0);
        assert!(!commands.cut);
        assert!(!commands.explicit_init);
    }

    #[test]
    fn test_validate_rejects_narrow_width() {
        let config = Config {
            print_width: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"print_width": 576, "printer": {"driver_type": "star", "queue_name": "bar"}}"#,
        )
        .unwrap();
        assert_eq!(config.print_width, 576);
        assert_eq!(config.printer.driver_type, DriverType::Star);
        assert_eq!(config.viewport_height, 10_000);
        assert_eq!(config.commands, PrintCommands::default());
    }

    #[test]
    fn test_driver_type_from_str() {
        assert_eq!("EPSON".parse::<DriverType>(), Ok(DriverType::Epson));
        assert_eq!("esc_star".parse::<DriverType>(), Ok(DriverType::EpsonEscStar));
        assert!("zebra".parse::<DriverType>().is_err());
    }

    #[test]
    fn test_chrome_args_use_print_width() {
        let config = Config::default();
        let args = get_chrome_args_with_instance_id(&config, Some(3));
        assert!(args.contains(&"--window-size=380,10000".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("--user-data-dir=") && a.ends_with("-3")));
    }
}
