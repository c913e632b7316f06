//! Configuration image verification and conditional upload.
//!
//! Every FPGA is probed with a random identity echo. Boards whose FPGAs do not
//! all answer with the expected bitstream type get the image uploaded (when a
//! path is known) and are probed again; anything that still fails is
//! invalidated without affecting the rest of the list.

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::Rng;

use crate::device::{self, Device};
use crate::device_list::DeviceList;
use crate::error::{Result, TrafficError};
use crate::packet::{PacketLinkFactory, PacketParams};
use crate::protocol::APP_MODE_PKT_COMM;
use crate::usb::Transport;

/// Outcome of an identity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Every FPGA runs the expected bitstream.
    Match,
    /// At least one FPGA is unconfigured or runs something else.
    Mismatch,
}

/// What to load and how to talk to it once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitstreamDescriptor {
    /// Type ID compiled into the bitstream; 0 is not a valid type.
    pub type_id: u16,
    pub path: Option<PathBuf>,
    pub packet: PacketParams,
}

impl BitstreamDescriptor {
    pub fn validate(&self) -> Result<&Path> {
        if self.type_id == 0 {
            return Err(TrafficError::Config("bitstream type must be non-zero".into()));
        }
        match self.path.as_deref() {
            Some(p) if !p.as_os_str().is_empty() => Ok(p),
            _ => Err(TrafficError::Config("bitstream path missing".into())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsureOutcome {
    /// Devices verified to run the expected bitstream.
    pub live: usize,
    /// Devices that received an upload during this pass.
    pub uploaded: usize,
}

/// Probe every FPGA of `device` with a random identity echo.
///
/// Stops at the first mismatching FPGA. Each probed FPGA records the type it
/// reported, or 0 if the echo was wrong.
pub fn verify_identity<L: Transport>(
    device: &mut Device<L>,
    expected_type: u16,
    rng: &mut impl Rng,
) -> device::Result<Identity> {
    let (tr, chips) = device.io_parts()?;
    for chip in chips.iter_mut() {
        chip.low_level_select(tr)?;
        let challenge = [
            rng.gen_range(0..=u16::MAX),
            rng.gen_range(0..=u16::MAX),
        ];
        let reply = chip.echo_identity(tr, challenge)?;
        let words_ok = reply.words_match(challenge);
        chip.bitstream_type = if words_ok { reply.bitstream_type } else { 0 };
        debug!(
            "identity({}): request 0x{:04X} 0x{:04X}, reply 0x{:04X} 0x{:04X}, id {}, type 0x{:04X}",
            chip.num,
            challenge[0],
            challenge[1],
            reply.data[0],
            reply.data[1],
            reply.chip_id,
            reply.bitstream_type
        );

        if !(words_ok && reply.chip_id == chip.num) || chip.bitstream_type != expected_type {
            return Ok(Identity::Mismatch);
        }
    }
    Ok(Identity::Match)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    let image = std::fs::read(path)
        .map_err(|e| TrafficError::Image(format!("{}: {e}", path.display())))?;
    if image.is_empty() {
        return Err(TrafficError::Image(format!("{}: empty file", path.display())));
    }
    Ok(image)
}

/// Make sure every valid device runs bitstream `expected_type`.
///
/// With `image_path`, mismatching devices get the image uploaded and are
/// verified again. The file is read once, on first need; failure to read it
/// is fatal. Devices that cannot be brought up are invalidated.
pub fn ensure_uploaded<L: Transport>(
    list: &mut DeviceList<L>,
    expected_type: u16,
    image_path: Option<&Path>,
    rng: &mut impl Rng,
) -> Result<EnsureOutcome> {
    let mut image: Option<Vec<u8>> = None;
    let mut outcome = EnsureOutcome::default();

    for device in list.valid_mut() {
        match verify_identity(device, expected_type, rng) {
            Ok(Identity::Match) => {
                outcome.live += 1;
                continue;
            }
            Ok(Identity::Mismatch) => {}
            Err(e) => {
                warn!(
                    "SN {}: bitstream check failed: {e} ({})",
                    device.serial(),
                    e.code()
                );
                device.invalidate();
                continue;
            }
        }

        let Some(path) = image_path else {
            warn!("SN {}: no bitstream or wrong type", device.serial());
            device.invalidate();
            continue;
        };
        if image.is_none() {
            image = Some(read_image(path)?);
        }
        let Some(data) = image.as_deref() else {
            continue;
        };

        info!(
            "SN {}: uploading bitstream {} ({} bytes)",
            device.serial(),
            path.display(),
            data.len()
        );
        if let Err(e) = device.upload_image(data) {
            warn!("SN {}: upload failed: {e}", device.serial());
            device.invalidate();
            continue;
        }
        outcome.uploaded += 1;

        match verify_identity(device, expected_type, rng) {
            Ok(Identity::Match) => outcome.live += 1,
            Ok(Identity::Mismatch) => {
                warn!(
                    "SN {}: bitstream type mismatch after upload",
                    device.serial()
                );
                device.invalidate();
            }
            Err(e) => {
                warn!("SN {}: check after upload failed: {e}", device.serial());
                device.invalidate();
            }
        }
    }
    Ok(outcome)
}

/// Bring a freshly scanned list into packet-communication mode.
///
/// Validates `desc`, uploads where needed, re-verifies if anything was
/// uploaded, attaches packet links and switches every FPGA to application
/// mode 2. Returns the number of live devices.
pub fn initialize<L: Transport>(
    list: &mut DeviceList<L>,
    desc: &BitstreamDescriptor,
    factory: &dyn PacketLinkFactory,
    rng: &mut impl Rng,
) -> Result<usize> {
    let path = desc.validate()?;

    let first = ensure_uploaded(list, desc.type_id, Some(path), rng)?;
    if first.uploaded > 0 {
        ensure_uploaded(list, desc.type_id, None, rng)?;
    }

    list.init_chips(factory, &desc.packet);
    list.set_app_mode(APP_MODE_PKT_COMM);
    Ok(list.count())
}
