//! Application configuration: TOML-based, platform-aware paths.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bitstream::BitstreamDescriptor;
use crate::echo::ECHO_BUF_SIZE;
use crate::packet::PacketParams;
use crate::protocol::{DEVICE_CHIPS_MAX, PKT_INPUT_CAPACITY};
use crate::usb::Timeouts;

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str =
    "# inouttraffic configuration. Saved by `inouttraffic-cli config --init`.\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bitstream type ID expected on every chip. Default: 1.
    #[serde(default = "default_bitstream_type")]
    pub bitstream_type: u16,

    /// Configuration image uploaded when a chip runs something else.
    #[serde(default = "default_bitstream_path")]
    pub bitstream_path: String,

    /// Control transfer timeout in milliseconds.
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,

    /// Bulk transfer timeout in milliseconds.
    #[serde(default = "default_bulk_timeout_ms")]
    pub bulk_timeout_ms: u64,

    /// Minimum seconds between two scans for newly attached boards.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// FPGAs per board (1..=4).
    #[serde(default = "default_chips_per_device")]
    pub chips_per_device: usize,

    /// Echo write length range in bytes, both even.
    #[serde(default = "default_echo_min_len")]
    pub echo_min_len: usize,
    #[serde(default = "default_echo_max_len")]
    pub echo_max_len: usize,

    /// Packet link sizing, `[packet]` table.
    #[serde(default)]
    pub packet: PacketParams,
}

fn default_bitstream_type() -> u16 {
    0x0001
}
fn default_bitstream_path() -> String {
    "inouttraffic.bit".into()
}
fn default_control_timeout_ms() -> u64 {
    1000
}
fn default_bulk_timeout_ms() -> u64 {
    500
}
fn default_scan_interval_secs() -> u64 {
    5
}
fn default_chips_per_device() -> usize {
    DEVICE_CHIPS_MAX
}
fn default_echo_min_len() -> usize {
    8192
}
fn default_echo_max_len() -> usize {
    PKT_INPUT_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bitstream_type: default_bitstream_type(),
            bitstream_path: default_bitstream_path(),
            control_timeout_ms: default_control_timeout_ms(),
            bulk_timeout_ms: default_bulk_timeout_ms(),
            scan_interval_secs: default_scan_interval_secs(),
            chips_per_device: default_chips_per_device(),
            echo_min_len: default_echo_min_len(),
            echo_max_len: default_echo_max_len(),
            packet: PacketParams::default(),
        }
    }
}

/// Validation failures collected by [`Config::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    ZeroBitstreamType,
    EmptyBitstreamPath,
    ZeroTimeout { field: &'static str },
    ChipsOutOfRange(usize),
    InvalidEchoLength(String),
    InvalidPacketParams(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroBitstreamType => write!(f, "bitstream_type must be non-zero"),
            Self::EmptyBitstreamPath => write!(f, "bitstream_path is empty"),
            Self::ZeroTimeout { field } => write!(f, "{field} must be greater than zero"),
            Self::ChipsOutOfRange(n) => {
                write!(f, "chips_per_device {n} out of range (1..={DEVICE_CHIPS_MAX})")
            }
            Self::InvalidEchoLength(e) => write!(f, "echo length: {e}"),
            Self::InvalidPacketParams(e) => write!(f, "packet: {e}"),
        }
    }
}

impl Config {
    /// Platform config directory, e.g. `~/.config/inouttraffic` on Linux.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("inouttraffic"))
    }

    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load from the default path, logging parse warnings.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Save config to an arbitrary path atomically (write to temp file, then rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Rename can fail across filesystems
                let result = std::fs::write(path, &contents);
                let _ = std::fs::remove_file(&tmp);
                result
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// A missing file gives `(defaults, [])`; an unparsable one gives
    /// `(defaults, [warning])`.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Check every field, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.bitstream_type == 0 {
            errors.push(ValidationError::ZeroBitstreamType);
        }
        if self.bitstream_path.trim().is_empty() {
            errors.push(ValidationError::EmptyBitstreamPath);
        }

        if self.control_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout {
                field: "control_timeout_ms",
            });
        }
        if self.bulk_timeout_ms == 0 {
            errors.push(ValidationError::ZeroTimeout {
                field: "bulk_timeout_ms",
            });
        }

        if !(1..=DEVICE_CHIPS_MAX).contains(&self.chips_per_device) {
            errors.push(ValidationError::ChipsOutOfRange(self.chips_per_device));
        }

        let (min, max) = (self.echo_min_len, self.echo_max_len);
        if min == 0 || min % 2 != 0 || max % 2 != 0 {
            errors.push(ValidationError::InvalidEchoLength(format!(
                "{min}..{max}: bounds must be even and non-zero"
            )));
        } else if min > max {
            errors.push(ValidationError::InvalidEchoLength(format!(
                "min {min} exceeds max {max}"
            )));
        }
        if max > PKT_INPUT_CAPACITY.min(ECHO_BUF_SIZE) {
            errors.push(ValidationError::InvalidEchoLength(format!(
                "max {max} exceeds input buffer ({PKT_INPUT_CAPACITY})"
            )));
        }

        let p = &self.packet;
        if p.word_width == 0 {
            errors.push(ValidationError::InvalidPacketParams(
                "word_width must be non-zero".into(),
            ));
        } else if p.input_capacity == 0 || p.output_capacity == 0 {
            errors.push(ValidationError::InvalidPacketParams(
                "capacities must be non-zero".into(),
            ));
        } else if p.output_capacity % p.word_width != 0 {
            errors.push(ValidationError::InvalidPacketParams(format!(
                "output_capacity {} is not a multiple of word_width {}",
                p.output_capacity, p.word_width
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            control: Duration::from_millis(self.control_timeout_ms),
            bulk: Duration::from_millis(self.bulk_timeout_ms),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    /// Chip count clamped to what a board can carry.
    pub fn chips_per_device(&self) -> usize {
        self.chips_per_device.clamp(1, DEVICE_CHIPS_MAX)
    }

    /// Descriptor passed to bitstream initialization. An empty path becomes `None`.
    pub fn descriptor(&self) -> BitstreamDescriptor {
        let path = self.bitstream_path.trim();
        BitstreamDescriptor {
            type_id: self.bitstream_type,
            path: (!path.is_empty()).then(|| PathBuf::from(path)),
            packet: self.packet,
        }
    }
}
