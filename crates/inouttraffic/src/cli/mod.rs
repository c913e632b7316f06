//! CLI subcommands: board discovery, bitstream check, echo traffic, config.

mod check;
mod config_cmd;
mod devices;
mod echo;

use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

pub(super) use crate::RUNNING;
pub(super) use inouttraffic_lib::TrafficError;
pub(super) use inouttraffic_lib::config::Config;
pub(super) use inouttraffic_lib::device::Device;
pub(super) use inouttraffic_lib::echo::EchoStats;
pub(super) use inouttraffic_lib::error::Result;
pub(super) use inouttraffic_lib::scan::{Discovery, UsbDiscovery};
pub(super) use inouttraffic_lib::usb::{DiscoveredUnit, Transport};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

pub(super) fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

// ── Config loading ──

/// Config from `custom_path` or the platform default; parse problems are
/// logged and defaults used.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    match custom_path {
        Some(path) => {
            let (config, warnings) = Config::load_from(path);
            for w in &warnings {
                log::warn!("{w}");
            }
            config
        }
        None => Config::load(),
    }
}

/// Config that passed validation, for commands that touch hardware.
pub(super) fn checked_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = load_config(custom_path);
    config.validate().map_err(|errors| {
        let msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        TrafficError::Config(msgs.join("; "))
    })?;
    Ok(config)
}

pub(super) fn usb_discovery(config: &Config) -> UsbDiscovery {
    UsbDiscovery::new(
        config.timeouts(),
        config.chips_per_device(),
        config.scan_interval(),
    )
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DiscoveredUnit>,
}

#[derive(Serialize)]
pub(super) struct DeviceJson {
    pub serial: String,
    pub valid: bool,
    /// Bitstream type reported by each FPGA, 0 if unknown.
    pub bitstream_types: Vec<u16>,
}

impl DeviceJson {
    pub fn from_device<L: Transport>(device: &Device<L>) -> Self {
        DeviceJson {
            serial: device.serial().to_string(),
            valid: device.is_valid(),
            bitstream_types: device.chips().iter().map(|c| c.bitstream_type).collect(),
        }
    }
}

#[derive(Serialize)]
pub(super) struct CheckOutput {
    pub bitstream_type: u16,
    pub live: usize,
    pub uploaded: usize,
    pub devices: Vec<DeviceJson>,
}

#[derive(Serialize)]
pub(super) struct EchoOutput {
    pub elapsed_secs: f64,
    pub mb_written: f64,
    pub mb_read: f64,
    pub rate_mb_s: f64,
    pub stats: EchoStats,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List attached boards
    Devices,

    /// Verify the bitstream on every FPGA, optionally uploading an image
    Check {
        /// Upload this image to boards that run something else
        #[arg(long, value_name = "PATH")]
        upload: Option<PathBuf>,
    },

    /// Bring up all boards and run raw echo traffic until Ctrl+C
    Echo {
        /// Stop after this many traffic rounds
        #[arg(long)]
        rounds: Option<u64>,
    },

    /// Show current configuration and file path
    Config {
        /// Write the configuration (defaults if no file exists) to the config path
        #[arg(long)]
        init: bool,
    },
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json, config_path),
        Command::Check { upload } => check::cmd_check(upload.as_deref(), json, config_path),
        Command::Echo { rounds } => echo::cmd_echo(rounds, json, config_path),
        Command::Config { init } => config_cmd::cmd_config(init, json, config_path),
    }
}
