//! Device registry: one claimed board and its chip table.

use std::fmt;

use log::{debug, info, warn};

use crate::chip::Chip;
use crate::device_list::UnitRecord;
use crate::packet::{PacketError, PacketLinkFactory, PacketParams};
use crate::protocol::*;
use crate::usb::{Transport, TransportError, UsbUnit};

// ── Error type ──

/// Per-device faults.
///
/// Any of these, when returned from an I/O operation, means the device should
/// be invalidated by the caller. Siblings in the same list are unaffected.
#[derive(Debug)]
pub enum DeviceError {
    /// Interface could not be claimed.
    ClaimFailed(TransportError),
    Transport(TransportError),
    /// FPGA reported not-ready on two consecutive status fetches.
    IoTimeout,
    LimitNotDone,
    SfifoNotEmpty,
    UnknownIoState(u8),
    PartialWrite { sent: usize, len: usize },
    ZeroRead { received: usize, requested: usize },
    BufferTooSmall { needed: usize, available: usize },
    PacketLink(PacketError),
    AppStatus { chip: u8, app_status: u8, pkt_comm_status: u8 },
    /// Operation on a device that is already invalidated.
    Invalid,
}

impl DeviceError {
    /// Negative numeric code, for log compatibility.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::ClaimFailed(e) | DeviceError::Transport(e) => e.code,
            DeviceError::IoTimeout => ERR_IO_STATE_TIMEOUT,
            DeviceError::LimitNotDone => ERR_IO_STATE_LIMIT_NOT_DONE,
            DeviceError::SfifoNotEmpty => ERR_IO_STATE_SFIFO_NOT_EMPTY,
            DeviceError::PartialWrite { .. } => ERR_WR_PARTIAL,
            DeviceError::ZeroRead { .. } => ERR_RD_ZEROREAD,
            _ => -1,
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::ClaimFailed(e) => write!(f, "Failed to claim device: {e}"),
            DeviceError::Transport(e) => write!(f, "{e}"),
            DeviceError::IoTimeout => write!(f, "I/O state timeout"),
            DeviceError::LimitNotDone => write!(f, "Output limit not done"),
            DeviceError::SfifoNotEmpty => write!(f, "Secondary FIFO not empty"),
            DeviceError::UnknownIoState(bits) => write!(f, "Unknown I/O state 0x{bits:02X}"),
            DeviceError::PartialWrite { sent, len } => {
                write!(f, "Partial write: {sent} of {len} bytes")
            }
            DeviceError::ZeroRead {
                received,
                requested,
            } => write!(
                f,
                "Zero-length read after {received} of {requested} bytes"
            ),
            DeviceError::BufferTooSmall { needed, available } => {
                write!(f, "Read buffer too small: need {needed}, have {available}")
            }
            DeviceError::PacketLink(e) => write!(f, "{e}"),
            DeviceError::AppStatus {
                chip,
                app_status,
                pkt_comm_status,
            } => write!(
                f,
                "FPGA #{chip} error: app_status 0x{app_status:02X}, pkt_comm_status 0x{pkt_comm_status:02X}"
            ),
            DeviceError::Invalid => write!(f, "Device is invalid"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::ClaimFailed(e) | DeviceError::Transport(e) => Some(e),
            DeviceError::PacketLink(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for DeviceError {
    fn from(e: TransportError) -> Self {
        DeviceError::Transport(e)
    }
}

impl From<PacketError> for DeviceError {
    fn from(e: PacketError) -> Self {
        DeviceError::PacketLink(e)
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

// ── Device ──

/// A claimed board.
///
/// Valid exactly while the link is held and no unrecoverable fault was seen.
pub struct Device<L: Transport> {
    serial: String,
    link: Option<L>,
    chips: Vec<Chip>,
    valid: bool,
    valid_chips: usize,
    record: UnitRecord,
}

impl<L: Transport> Device<L> {
    /// Claim `unit` and build its chip table.
    ///
    /// On failure the discovery record is marked invalid.
    pub fn create<U>(unit: &U, record: UnitRecord) -> Result<Self>
    where
        U: UsbUnit<Link = L>,
    {
        let link = match unit.claim() {
            Ok(link) => link,
            Err(e) => {
                warn!("SN {}: {e}", unit.serial());
                record.set_valid(false);
                return Err(DeviceError::ClaimFailed(e));
            }
        };

        let num_chips = unit.num_chips().min(DEVICE_CHIPS_MAX);
        let chips = (0..num_chips).map(|n| Chip::new(n as u8)).collect();
        record.set_valid(true);
        debug!("SN {}: claimed, {num_chips} FPGA(s)", unit.serial());

        Ok(Device {
            serial: unit.serial().to_string(),
            link: Some(link),
            chips,
            valid: true,
            valid_chips: 0,
            record,
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn num_chips(&self) -> usize {
        self.chips.len()
    }

    /// Chips with an attached packet link.
    pub fn valid_chips(&self) -> usize {
        self.valid_chips
    }

    pub fn chips(&self) -> &[Chip] {
        &self.chips
    }

    pub fn record(&self) -> &UnitRecord {
        &self.record
    }

    /// Borrow the link and the chip table together.
    pub fn io_parts(&mut self) -> Result<(&L, &mut [Chip])> {
        let link = self.link.as_ref().ok_or(DeviceError::Invalid)?;
        Ok((link, &mut self.chips))
    }

    /// Tear the device down. Safe to call any number of times.
    pub fn invalidate(&mut self) {
        if !self.valid {
            return;
        }
        self.valid = false;
        for chip in &mut self.chips {
            chip.detach_link();
        }
        self.valid_chips = 0;
        self.link = None;
        self.record.set_valid(false);
        info!("SN {}: device invalidated", self.serial);
    }

    /// Select and soft-reset every chip in index order, zeroing write counts.
    ///
    /// Stops at the first failure. Does not invalidate.
    pub fn reset_all_chips(&mut self) -> Result<()> {
        let (tr, chips) = self.io_parts()?;
        for chip in chips.iter_mut() {
            chip.select(tr)?;
            chip.reset(tr)?;
            chip.wr.count = 0;
        }
        Ok(())
    }

    /// Select, reset and attach a fresh packet link to every chip.
    ///
    /// All-or-nothing: any failure invalidates the whole device.
    pub fn init_chips(
        &mut self,
        factory: &dyn PacketLinkFactory,
        params: &PacketParams,
    ) -> Result<()> {
        let result = self.try_init_chips(factory, params);
        if let Err(e) = &result {
            warn!("SN {}: FPGA init failed: {e}", self.serial);
            self.invalidate();
        }
        result
    }

    fn try_init_chips(
        &mut self,
        factory: &dyn PacketLinkFactory,
        params: &PacketParams,
    ) -> Result<()> {
        let (tr, chips) = self.io_parts()?;
        for chip in chips.iter_mut() {
            chip.select(tr)?;
            chip.reset(tr)?;
            chip.wr.count = 0;
            chip.attach_link(factory.create(params, chip.num));
        }
        self.valid_chips = self.chips.len();
        Ok(())
    }

    /// Stream a configuration image into every chip. Does not invalidate.
    pub fn upload_image(&mut self, image: &[u8]) -> Result<()> {
        let num_chips = self.chips.len();
        let link = self.link.as_ref().ok_or(DeviceError::Invalid)?;
        link.upload_image(num_chips, image)?;
        for chip in &mut self.chips {
            chip.bitstream_type = 0;
        }
        Ok(())
    }

    /// Put every chip into application `mode`. Failure invalidates.
    pub fn set_app_mode(&mut self, mode: u16) -> Result<()> {
        let result = self.for_each_chip(|tr, chip| {
            chip.select(tr)?;
            chip.set_mode(tr, mode)
        });
        if let Err(e) = &result {
            warn!("SN {}: set app mode {mode} failed: {e}", self.serial);
            self.invalidate();
        }
        result
    }

    /// Switch the high-speed I/O path of every chip.
    pub fn hs_io_enable(&mut self, enable: bool) -> Result<()> {
        self.for_each_chip(|tr, chip| {
            chip.select(tr)?;
            chip.hs_io_enable(tr, enable)
        })
    }

    /// Switch output length limiting of every chip.
    pub fn output_limit_enable(&mut self, enable: bool) -> Result<()> {
        self.for_each_chip(|tr, chip| {
            chip.select(tr)?;
            chip.output_limit_enable(tr, enable)
        })
    }

    fn for_each_chip(&mut self, mut f: impl FnMut(&L, &mut Chip) -> Result<()>) -> Result<()> {
        let (tr, chips) = self.io_parts()?;
        for chip in chips.iter_mut() {
            f(tr, chip)?;
        }
        Ok(())
    }

    /// One packet-mode round over all chips: combined status fetch, then
    /// write and read through each chip's packet link.
    ///
    /// Errors are logged and returned; invalidation is up to the caller.
    pub fn pkt_rw(&mut self) -> Result<()> {
        let serial = &self.serial;
        let link = self.link.as_ref().ok_or(DeviceError::Invalid)?;
        for chip in self.chips.iter_mut() {
            let num = chip.num;
            let result = pkt_rw_chip(link, chip);
            if let Err(e) = &result {
                warn!("SN {serial} #{num}: {e} ({})", e.code());
            }
            result?;
        }
        Ok(())
    }
}

fn pkt_rw_chip(tr: &impl Transport, chip: &mut Chip) -> Result<()> {
    let status = chip.select_and_fetch_status(tr)?;
    if status.pkt_comm_status != 0 || status.app_status != 0 {
        return Err(DeviceError::AppStatus {
            chip: chip.num,
            app_status: status.app_status,
            pkt_comm_status: status.pkt_comm_status,
        });
    }
    chip.write_packet(tr)?;
    chip.read_packet(tr)?;
    Ok(())
}

impl<L: Transport> Drop for Device<L> {
    fn drop(&mut self) {
        self.invalidate();
    }
}
