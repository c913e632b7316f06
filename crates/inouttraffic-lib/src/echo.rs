//! Raw echo traffic (application mode 1).
//!
//! In mode 1 each FPGA sends back exactly what it received, bypassing the
//! packet layer. Every chip gets buffers of incrementing bytes of random even
//! length; whatever is read back must continue the same sequence.

use std::fmt;

use log::{debug, warn};
use rand::Rng;
use serde::Serialize;

use crate::device::{Device, DeviceError};
use crate::device_list::{DeviceList, UnitRecord};
use crate::protocol::PKT_INPUT_CAPACITY;
use crate::usb::Transport;

/// Per-chip buffer size; holds any single read or write.
pub const ECHO_BUF_SIZE: usize = 65536;

/// Default write length range. The input buffer signals full at 16K,
/// so no single write is larger.
pub const ECHO_MIN_LEN: usize = 8192;
pub const ECHO_MAX_LEN: usize = PKT_INPUT_CAPACITY;

// ── Buffer fill / check ──

/// Fill `buf` with incrementing bytes starting at `data`. Returns the next value.
pub fn buf_set(buf: &mut [u8], mut data: u8) -> u8 {
    for b in buf.iter_mut() {
        *b = data;
        data = data.wrapping_add(1);
    }
    data
}

/// Data read back does not continue the written sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMismatch {
    pub offset: usize,
    pub len: usize,
    pub got: u8,
    pub expected: u8,
}

impl fmt::Display for EchoMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "len:{} i:{} bad data: {}, must be: {}",
            self.len, self.offset, self.got, self.expected
        )
    }
}

/// Check that `buf` continues the sequence at `*expected`, advancing it.
pub fn buf_check(buf: &[u8], expected: &mut u8) -> Result<(), EchoMismatch> {
    for (offset, &got) in buf.iter().enumerate() {
        if got != *expected {
            return Err(EchoMismatch {
                offset,
                len: buf.len(),
                got,
                expected: *expected,
            });
        }
        *expected = expected.wrapping_add(1);
    }
    Ok(())
}

// ── Errors ──

#[derive(Debug)]
pub enum EchoError {
    Device(DeviceError),
    Mismatch { chip: u8, mismatch: EchoMismatch },
}

impl fmt::Display for EchoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoError::Device(e) => write!(f, "{e} ({})", e.code()),
            EchoError::Mismatch { chip, mismatch } => {
                write!(f, "FPGA #{chip} echo mismatch: {mismatch}")
            }
        }
    }
}

impl std::error::Error for EchoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EchoError::Device(e) => Some(e),
            EchoError::Mismatch { .. } => None,
        }
    }
}

impl From<DeviceError> for EchoError {
    fn from(e: DeviceError) -> Self {
        EchoError::Device(e)
    }
}

// ── Statistics ──

#[derive(Debug, Clone, Default, Serialize)]
pub struct EchoStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub partial_reads: u64,
    pub rounds: u64,
}

impl EchoStats {
    pub fn mb_written(&self) -> f64 {
        self.bytes_written as f64 / 1024.0 / 1024.0
    }

    pub fn mb_read(&self) -> f64 {
        self.bytes_read as f64 / 1024.0 / 1024.0
    }

    /// Combined throughput in MB/s over `secs`.
    pub fn rate(&self, secs: f64) -> f64 {
        if secs <= 0.0 {
            return 0.0;
        }
        (self.mb_written() + self.mb_read()) / secs
    }
}

// ── Per-chip traffic ──

struct ChipTraffic {
    wr_buf: Vec<u8>,
    rd_buf: Vec<u8>,
    wr_len: usize,
    data_out: u8,
    data_in: u8,
}

impl ChipTraffic {
    fn new(seed: u8) -> Self {
        ChipTraffic {
            wr_buf: vec![0; ECHO_BUF_SIZE],
            rd_buf: vec![0; ECHO_BUF_SIZE],
            wr_len: 0,
            data_out: seed,
            data_in: seed,
        }
    }
}

/// Sequences of one claimed board. A board found again after being
/// invalidated gets a new record and so starts over.
struct DeviceTraffic {
    record: UnitRecord,
    chips: Vec<ChipTraffic>,
}

/// Drives raw echo traffic over a device list and keeps per-chip sequences.
pub struct EchoSession {
    min_len: usize,
    max_len: usize,
    traffic: Vec<DeviceTraffic>,
    next_id: u32,
    stats: EchoStats,
}

impl EchoSession {
    /// Lengths are clamped to even values within the buffer size.
    pub fn new(min_len: usize, max_len: usize) -> Self {
        let max_len = max_len.min(ECHO_BUF_SIZE) & !1;
        let min_len = (min_len.min(max_len) & !1).max(2);
        EchoSession {
            min_len,
            max_len: max_len.max(min_len),
            traffic: Vec::new(),
            next_id: 0,
            stats: EchoStats::default(),
        }
    }

    pub fn stats(&self) -> &EchoStats {
        &self.stats
    }

    fn random_len(&self, rng: &mut impl Rng) -> usize {
        2 * rng.gen_range(0..=(self.max_len - self.min_len) / 2) + self.min_len
    }

    /// One write/read pass over every valid device. Devices that fail are
    /// invalidated. Returns the number of devices processed.
    pub fn round<L: Transport>(&mut self, list: &mut DeviceList<L>, rng: &mut impl Rng) -> usize {
        self.traffic.retain(|t| t.record.is_valid());
        let mut count = 0;
        for device in list.valid_mut() {
            if let Err(e) = self.device_round(device, rng) {
                warn!("SN {}: r/w error: {e}", device.serial());
                device.invalidate();
            }
            count += 1;
        }
        self.stats.rounds += 1;
        count
    }

    fn device_round<L: Transport>(
        &mut self,
        device: &mut Device<L>,
        rng: &mut impl Rng,
    ) -> Result<(), EchoError> {
        let pos = match self
            .traffic
            .iter()
            .position(|t| t.record.same_unit(device.record()))
        {
            Some(pos) => pos,
            None => {
                // Distinct starting values per chip across all devices.
                let id = self.next_id;
                self.next_id += 1;
                let chips = (0..device.num_chips())
                    .map(|n| {
                        ChipTraffic::new((id as u8).wrapping_mul(8).wrapping_add(n as u8 + 1))
                    })
                    .collect();
                self.traffic.push(DeviceTraffic {
                    record: device.record().clone(),
                    chips,
                });
                self.traffic.len() - 1
            }
        };
        let lens: Vec<usize> = (0..device.num_chips())
            .map(|_| self.random_len(rng))
            .collect();
        let traffic = &mut self.traffic[pos].chips;

        let (tr, chips) = device.io_parts()?;
        for ((chip, t), len) in chips.iter_mut().zip(traffic.iter_mut()).zip(lens) {
            chip.select_and_fetch_status(tr)?;

            if chip.wr.count == 0 || chip.wr.done {
                t.wr_len = len;
                t.data_out = buf_set(&mut t.wr_buf[..len], t.data_out);
            }
            let written = chip.write_raw(tr, &t.wr_buf[..t.wr_len])?;
            self.stats.bytes_written += written as u64;

            let read = chip.read_raw(tr, &mut t.rd_buf)?;
            if read > 0 {
                self.stats.bytes_read += read as u64;
                buf_check(&t.rd_buf[..read], &mut t.data_in).map_err(|mismatch| {
                    EchoError::Mismatch {
                        chip: chip.num,
                        mismatch,
                    }
                })?;
                self.stats.partial_reads += chip.rd.partial_count;
                chip.rd.partial_count = 0;
            }
            debug!("#{} echo: wrote {written}, read {read}", chip.num);
        }
        Ok(())
    }
}
