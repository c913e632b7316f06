//! `check` subcommand: verify (and optionally upload) the bitstream on every board.

use std::path::Path;

use inouttraffic_lib::bitstream::ensure_uploaded;
use inouttraffic_lib::device_list::DeviceList;

use super::{
    CheckOutput, DeviceJson, Discovery, Result, checked_config, kv, kv_indent, kv_width, plural,
    usb_discovery,
};

pub(super) fn cmd_check(upload: Option<&Path>, json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = checked_config(config_path)?;
    let units = usb_discovery(&config).initial_scan()?;
    let mut list = DeviceList::from_units(&units);

    let outcome = ensure_uploaded(
        &mut list,
        config.bitstream_type,
        upload,
        &mut rand::thread_rng(),
    )?;

    if json {
        let output = CheckOutput {
            bitstream_type: config.bitstream_type,
            live: outcome.live,
            uploaded: outcome.uploaded,
            devices: list.iter().map(DeviceJson::from_device).collect(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).map_err(std::io::Error::other)?
        );
        return Ok(());
    }

    if units.is_empty() {
        println!("No boards found.");
        return Ok(());
    }

    let w = kv_width(&["Bitstream type:", "Live:", "Uploaded:"], &["FPGA #0:"]);
    kv("Bitstream type:", format_args!("0x{:04X}", config.bitstream_type), w);
    kv(
        "Live:",
        format_args!("{} of {} board{}", outcome.live, units.len(), plural(units.len())),
        w,
    );
    kv("Uploaded:", outcome.uploaded, w);
    println!();

    for device in list.iter() {
        let state = if device.is_valid() { "ok" } else { "FAILED" };
        println!("SN {} ({state})", device.serial());
        for chip in device.chips() {
            let label = format!("FPGA #{}:", chip.num);
            if chip.bitstream_type == 0 {
                kv_indent(&label, "no response", w);
            } else {
                kv_indent(&label, format_args!("type 0x{:04X}", chip.bitstream_type), w);
            }
        }
    }
    Ok(())
}
