//! Runtime configuration
//!
//! A YAML config file plus environment overrides, loaded once at library
//! init. Device-name-keyed override tables let users pin formats, buffer
//! sizes, and feature toggles per endpoint; the `general` table supplies
//! process-wide defaults.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Per-device (or global, via `general`) configuration overrides
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeviceOverrides {
    /// Output sample rate in Hz
    pub frequency: Option<u32>,
    /// Number of update periods in the device buffer
    pub periods: Option<u32>,
    /// Update period size in frames
    pub period_size: Option<u32>,
    /// Total source count
    pub sources: Option<u32>,
    /// Effect slot count
    pub slots: Option<u32>,
    /// Auxiliary sends per source
    pub sends: Option<i32>,
    /// Channel layout spec ("mono", "stereo", "surround51", "ambi1"...)
    pub channels: Option<String>,
    /// Sample type spec ("int16", "float32", ...)
    pub sample_type: Option<String>,
    /// Ambisonic format spec ("fuma", "acn+sn3d", "acn+n3d")
    pub ambi_format: Option<String>,
    /// Enable output dithering
    pub dither: Option<bool>,
    /// Dither depth in bits (0 = pick from sample type)
    pub dither_depth: Option<i32>,
    /// Force the output limiter on or off
    pub output_limiter: Option<bool>,
    /// Post-mix gain adjustment in dB, clamped to +/-24
    pub volume_adjust: Option<f32>,
    /// HRTF request: "true", "false", or "auto"
    pub hrtf: Option<String>,
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend ordering directive (comma list; "-name" removes an entry,
    /// a trailing empty entry keeps the remainder of the built-in table)
    pub drivers: Option<String>,
    /// Convert every latched error into a debugger trap
    pub trap_error: Option<bool>,
    /// Name of the reverb preset used for the default effect slot
    pub default_reverb: Option<String>,
    /// Context suspend behavior: "defer" (default) or "ignore"
    pub suspend_behavior: Option<String>,
    /// Comma list of CPU extensions to disable ("sse", "neon", "all")
    pub disable_cpu_exts: Option<String>,
    /// Global defaults applied to every device
    pub general: DeviceOverrides,
    /// Per-device overrides keyed by device name
    pub device: HashMap<String, DeviceOverrides>,
}

impl Config {
    /// Load configuration from the environment
    ///
    /// Reads the YAML file named by `RESONA_CONFIG` (missing or invalid
    /// files fall back to defaults), then applies environment-variable
    /// overrides on top.
    pub fn load() -> Self {
        let mut config = match std::env::var("RESONA_CONFIG") {
            Ok(path) => Self::load_file(Path::new(&path)),
            Err(_) => Config::default(),
        };

        if let Ok(drivers) = std::env::var("RESONA_DRIVERS") {
            if !drivers.is_empty() {
                config.drivers = Some(drivers);
            }
        }
        if let Ok(v) = std::env::var("RESONA_TRAP_ERROR") {
            config.trap_error = Some(v == "1" || v.eq_ignore_ascii_case("true"));
        }
        if let Ok(v) = std::env::var("RESONA_DEFAULT_REVERB") {
            if !v.is_empty() {
                config.default_reverb = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RESONA_SUSPEND_BEHAVIOR") {
            if !v.is_empty() {
                config.suspend_behavior = Some(v);
            }
        }

        config
    }

    /// Load a YAML config file, falling back to defaults on any failure
    fn load_file(path: &Path) -> Self {
        if !path.exists() {
            log::info!("Config file {:?} not found, using defaults", path);
            return Config::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str::<Config>(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse config {:?}: {}, using defaults", path, e);
                    Config::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read config {:?}: {}, using defaults", path, e);
                Config::default()
            }
        }
    }

    /// Look up an override for a device, falling back to the global table
    ///
    /// `device` is the endpoint name when one is known; `None` (or an
    /// unknown name) resolves from `general` alone.
    pub fn for_device(&self, device: Option<&str>) -> ResolvedOverrides<'_> {
        let specific = device.and_then(|name| self.device.get(name));
        ResolvedOverrides {
            specific,
            general: &self.general,
        }
    }

    /// Whether suspend/process context calls defer updates (the default)
    /// or are ignored entirely
    pub fn suspend_defers(&self) -> bool {
        match self.suspend_behavior.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("ignore") => false,
            Some(s) if !s.eq_ignore_ascii_case("defer") => {
                log::warn!("Unhandled suspend behavior setting: {:?}", s);
                true
            }
            _ => true,
        }
    }
}

/// Device-specific overrides merged over the global table
pub struct ResolvedOverrides<'a> {
    specific: Option<&'a DeviceOverrides>,
    general: &'a DeviceOverrides,
}

macro_rules! resolved_getter {
    ($name:ident, $ty:ty) => {
        pub fn $name(&self) -> Option<$ty> {
            self.specific
                .and_then(|o| o.$name.clone())
                .or_else(|| self.general.$name.clone())
        }
    };
}

impl<'a> ResolvedOverrides<'a> {
    resolved_getter!(frequency, u32);
    resolved_getter!(periods, u32);
    resolved_getter!(period_size, u32);
    resolved_getter!(sources, u32);
    resolved_getter!(slots, u32);
    resolved_getter!(sends, i32);
    resolved_getter!(channels, String);
    resolved_getter!(sample_type, String);
    resolved_getter!(ambi_format, String);
    resolved_getter!(dither, bool);
    resolved_getter!(dither_depth, i32);
    resolved_getter!(output_limiter, bool);
    resolved_getter!(volume_adjust, f32);
    resolved_getter!(hrtf, String);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_empty() {
        let config = Config::default();
        assert!(config.drivers.is_none());
        assert!(config.device.is_empty());
        assert!(config.suspend_defers());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
drivers: "null,"
trap_error: true
general:
  frequency: 48000
  output_limiter: true
device:
  "USB Interface":
    frequency: 96000
    period_size: 256
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.drivers.as_deref(), Some("null,"));
        assert_eq!(config.trap_error, Some(true));
        assert_eq!(config.general.frequency, Some(48000));
        assert_eq!(
            config.device.get("USB Interface").unwrap().period_size,
            Some(256)
        );
    }

    #[test]
    fn test_device_override_falls_back_to_general() {
        let yaml = r#"
general:
  frequency: 48000
  periods: 4
device:
  "Card A":
    frequency: 96000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        let card = config.for_device(Some("Card A"));
        assert_eq!(card.frequency(), Some(96000));
        assert_eq!(card.periods(), Some(4));

        let other = config.for_device(Some("Card B"));
        assert_eq!(other.frequency(), Some(48000));

        let anon = config.for_device(None);
        assert_eq!(anon.frequency(), Some(48000));
    }

    #[test]
    fn test_suspend_behavior_ignore() {
        let config = Config {
            suspend_behavior: Some("ignore".into()),
            ..Default::default()
        };
        assert!(!config.suspend_defers());
    }
}
