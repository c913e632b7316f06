//! `devices` subcommand: list attached boards.

use std::path::Path;

use super::{DevicesOutput, DiscoveredUnit, Discovery, Result, load_config, plural, usb_discovery};

pub(super) fn cmd_devices(json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let units = usb_discovery(&config).initial_scan()?;
    let devices: Vec<DiscoveredUnit> = units.iter().map(DiscoveredUnit::from_unit).collect();

    if json {
        let output = DevicesOutput {
            count: devices.len(),
            devices,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&output).map_err(std::io::Error::other)?
        );
        return Ok(());
    }

    if devices.is_empty() {
        println!("No boards found.");
        return Ok(());
    }

    println!("Found {} board{}:", devices.len(), plural(devices.len()));
    println!();
    for (i, dev) in devices.iter().enumerate() {
        println!("  [{}] {}", i + 1, dev.path);
        println!("      Serial: {}", dev.serial);
        println!("      FPGAs:  {}", dev.num_chips);
    }
    Ok(())
}
