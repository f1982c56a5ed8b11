//! Configuration loading.
//!
//! Configuration is merged from two sources:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `CCD_CAM_`
//!
//! # Example
//! ```no_run
//! use ccd_cam::config::CameraConfig;
//!
//! # fn main() -> Result<(), ccd_cam::CameraError> {
//! let config = CameraConfig::load_from("ccd_cam.toml")?;
//! println!("camera transport: {}", config.camera.transport);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::controller::CaptureSettings;
use crate::error::CamResult;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device attachment settings.
    pub camera: CameraSection,
    /// The capture session plan.
    pub capture: CaptureSettings,
}

/// Application-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name used in log output.
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Logging format (pretty, compact, json).
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// How to reach the camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSection {
    /// Transport kind: "sim" or "serial".
    pub transport: String,
    /// Serial device path; required for the serial transport.
    #[serde(default)]
    pub serial_path: Option<String>,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Serial read timeout.
    #[serde(with = "humantime_serde", default = "default_serial_timeout")]
    pub serial_timeout: Duration,
}

fn default_app_name() -> String {
    "ccd_cam".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_serial_timeout() -> Duration {
    Duration::from_millis(500)
}

impl CameraConfig {
    /// Load from `ccd_cam.toml` and the environment.
    ///
    /// Environment variables override file values with the `CCD_CAM_`
    /// prefix, e.g. `CCD_CAM_APPLICATION_LOG_LEVEL=debug`.
    pub fn load() -> CamResult<Self> {
        Self::load_from("ccd_cam.toml")
    }

    /// Load from a specific file path plus the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CamResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CCD_CAM_").split("_"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        match self.camera.transport.as_str() {
            "sim" => {}
            "serial" => {
                if self.camera.serial_path.is_none() {
                    return Err("serial transport requires camera.serial_path".into());
                }
            }
            other => {
                return Err(format!(
                    "Invalid transport '{other}'. Must be one of: sim, serial"
                ))
            }
        }

        if self.capture.region.bin_x == 0 || self.capture.region.bin_y == 0 {
            return Err("capture.region binning factors must be at least 1".into());
        }
        if self.capture.region.width == 0 || self.capture.region.height == 0 {
            return Err("capture.region must not be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
log_level = "debug"

[camera]
transport = "sim"

[capture]
capture_count = 5
interval = "2s"

[capture.region]
x = 0
y = 0
width = 100
height = 100
bin_x = 1
bin_y = 1

[capture.timing]
duration = "500ms"
mode = "HostTimed"
"#;

    #[test]
    fn loads_a_toml_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = CameraConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.camera.transport, "sim");
        assert_eq!(config.camera.baud_rate, 115_200);
        assert_eq!(config.capture.capture_count, Some(5));
        assert_eq!(config.capture.interval, Duration::from_secs(2));
        assert_eq!(config.capture.timing.duration, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_errors_surface_as_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[camera]\ntransport = 42\n").unwrap();

        let err = CameraConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, crate::error::CameraError::Config(_)));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let mut config = CameraConfig::load_from(file.path()).unwrap();

        config.application.log_level = "verbose".into();
        assert!(config.validate().unwrap_err().contains("log_level"));
        config.application.log_level = "info".into();

        config.camera.transport = "usb".into();
        assert!(config.validate().unwrap_err().contains("transport"));
        config.camera.transport = "serial".into();
        assert!(config.validate().unwrap_err().contains("serial_path"));

        config.camera.transport = "sim".into();
        config.capture.region.bin_x = 0;
        assert!(config.validate().unwrap_err().contains("binning"));
    }
}
