//! `config` subcommand: show current configuration and file path.

use std::path::Path;

use super::{Config, ConfigOutput, Result, kv, kv_indent, kv_width, load_config};

pub(super) fn cmd_config(init: bool, json: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = load_config(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);

    if init {
        let Some(path) = &config_path else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            )
            .into());
        };
        config.save_to(path)?;
        log::info!("config written to {}", path.display());
    }

    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => vec![],
        Err(errors) => errors.iter().map(|e| e.to_string()).collect(),
    };

    if json {
        let output = ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).map_err(std::io::Error::other)?
        );
        return Ok(());
    }

    let w = kv_width(
        &["Config file:"],
        &[
            "bitstream_type:",
            "bitstream_path:",
            "control_timeout_ms:",
            "bulk_timeout_ms:",
            "scan_interval_secs:",
            "chips_per_device:",
            "echo_min_len:",
            "echo_max_len:",
            "input_capacity:",
            "output_capacity:",
        ],
    );

    match &config_path {
        Some(p) if config_exists => kv("Config file:", format_args!("{} (loaded)", p.display()), w),
        Some(p) => kv(
            "Config file:",
            format_args!("{} (not found, using defaults)", p.display()),
            w,
        ),
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv_indent("bitstream_type:", format_args!("0x{:04X}", config.bitstream_type), w);
    kv_indent("bitstream_path:", &config.bitstream_path, w);
    kv_indent("control_timeout_ms:", config.control_timeout_ms, w);
    kv_indent("bulk_timeout_ms:", config.bulk_timeout_ms, w);
    kv_indent("scan_interval_secs:", config.scan_interval_secs, w);
    kv_indent("chips_per_device:", config.chips_per_device, w);
    kv_indent("echo_min_len:", config.echo_min_len, w);
    kv_indent("echo_max_len:", config.echo_max_len, w);
    println!();

    println!("Packet:");
    kv_indent("word_width:", config.packet.word_width, w);
    kv_indent("input_capacity:", config.packet.input_capacity, w);
    kv_indent("output_capacity:", config.packet.output_capacity, w);

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}
