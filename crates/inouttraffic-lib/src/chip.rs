//! Per-FPGA I/O state machine.
//!
//! A [`Chip`] never holds a reference to its device. Every operation takes
//! the device's [`Transport`] as a parameter, so the chip table can live in
//! the device while the link is borrowed alongside it.
//!
//! Writes are gated on the FPGA's I/O state (input buffer full, output not
//! drained, secondary FIFO busy). Reads are sized by the FPGA-reported output
//! limit. Both cached values are consumed at most once: after use they go
//! [`Freshness::Stale`] and the next call fetches them again.

use log::{debug, warn};

use crate::device::{DeviceError, Result};
use crate::packet::PacketLink;
use crate::protocol::*;
use crate::usb::{Transport, TransportError};

// ── Freshness ──

/// Whether a cached status value may still be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    #[default]
    Stale,
}

impl Freshness {
    /// Consume the value: returns `true` if it was fresh and marks it stale.
    pub fn take(&mut self) -> bool {
        std::mem::replace(self, Freshness::Stale) == Freshness::Fresh
    }
}

// ── Status structures ──

/// Reply of the plain I/O state request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoState {
    pub io_state: u8,
    /// Remaining I/O timeout window; 0 means the FPGA is not ready.
    pub timeout: u8,
    pub app_status: u8,
    pub pkt_comm_status: u8,
    pub debug2: u8,
    pub debug3: u8,
}

impl IoState {
    pub fn parse(buf: &[u8; IO_STATE_LEN]) -> Self {
        IoState {
            io_state: buf[0],
            timeout: buf[1],
            app_status: buf[2],
            pkt_comm_status: buf[3],
            debug2: buf[4],
            debug3: buf[5],
        }
    }
}

/// Reply of the combined select + I/O state + output setup request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectStatus {
    pub io_state: u8,
    pub timeout: u8,
    pub app_status: u8,
    pub pkt_comm_status: u8,
    /// Pending output, in words.
    pub read_limit: u16,
}

impl SelectStatus {
    pub fn parse(buf: &[u8; SELECT_STATUS_LEN]) -> Self {
        SelectStatus {
            io_state: buf[0],
            timeout: buf[1],
            app_status: buf[2],
            pkt_comm_status: buf[3],
            read_limit: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    /// Pending output in bytes.
    pub fn read_limit_bytes(&self) -> usize {
        self.read_limit as usize * OUTPUT_WORD_WIDTH
    }

    fn as_io_state(&self) -> IoState {
        IoState {
            io_state: self.io_state,
            timeout: self.timeout,
            app_status: self.app_status,
            pkt_comm_status: self.pkt_comm_status,
            debug2: 0,
            debug3: 0,
        }
    }
}

// ── Per-direction state ──

#[derive(Debug, Default, Clone)]
pub struct WriteState {
    pub status: IoState,
    pub freshness: Freshness,
    /// Consecutive fetches that found the FPGA not ready.
    pub not_ready_count: u32,
    pub count: u64,
    /// Last write attempt transferred data.
    pub done: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ReadState {
    /// Pending output in bytes.
    pub limit: usize,
    pub freshness: Freshness,
    pub count: u64,
    pub partial_count: u64,
    pub done: bool,
    /// Bytes delivered by the last completed read.
    pub len: usize,
}

// ── Chip ──

pub struct Chip {
    pub num: u8,
    /// Bitstream type reported by the identity echo; 0 = none or unknown.
    pub bitstream_type: u16,
    pub wr: WriteState,
    pub rd: ReadState,
    pub cmd_count: u64,
    link: Option<Box<dyn PacketLink>>,
}

impl Chip {
    pub fn new(num: u8) -> Self {
        Chip {
            num,
            bitstream_type: 0,
            wr: WriteState::default(),
            rd: ReadState::default(),
            cmd_count: 0,
            link: None,
        }
    }

    pub fn attach_link(&mut self, link: Box<dyn PacketLink>) {
        self.link = Some(link);
    }

    /// Drop the packet link, if any.
    pub fn detach_link(&mut self) -> bool {
        self.link.take().is_some()
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn link_mut(&mut self) -> Option<&mut (dyn PacketLink + 'static)> {
        self.link.as_deref_mut()
    }

    fn command(&mut self, tr: &impl Transport, request: u8, value: u16) -> Result<()> {
        let result = tr.control_command(request, value, 0);
        self.cmd_count += 1;
        result.map_err(DeviceError::from)
    }

    fn request<const N: usize>(
        &mut self,
        tr: &impl Transport,
        request: u8,
        value: u16,
        index: u16,
    ) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        let result = tr.control_request(request, value, index, &mut buf);
        self.cmd_count += 1;
        let n = result?;
        if n < N {
            return Err(TransportError::new(
                USB_ERROR_IO,
                format!("request 0x{request:02X}: short reply {n} of {N}"),
            )
            .into());
        }
        Ok(buf)
    }

    // ── Selection & mode ──

    /// Select this FPGA and wait for its I/O timeout window to elapse.
    pub fn select(&mut self, tr: &impl Transport) -> Result<()> {
        let result = self.command(tr, VC_SELECT_WAIT, self.num as u16);
        debug!("select({})", self.num);
        if let Err(e) = &result {
            warn!("select({}): {e}", self.num);
        }
        result
    }

    /// Select this FPGA without waiting for I/O to settle.
    pub fn low_level_select(&mut self, tr: &impl Transport) -> Result<()> {
        self.command(tr, VC_SELECT_FPGA, self.num as u16)
    }

    /// Soft reset of the selected FPGA's application.
    pub fn reset(&mut self, tr: &impl Transport) -> Result<()> {
        self.command(tr, VC_RESET, 0)
    }

    /// Set the application mode of the selected FPGA.
    pub fn set_mode(&mut self, tr: &impl Transport, mode: u16) -> Result<()> {
        self.command(tr, VC_SET_APP_MODE, mode)
    }

    pub fn hs_io_enable(&mut self, tr: &impl Transport, enable: bool) -> Result<()> {
        self.command(tr, VC_HS_IO_ENABLE, enable as u16)
    }

    pub fn output_limit_enable(&mut self, tr: &impl Transport, enable: bool) -> Result<()> {
        self.command(tr, VC_OUTPUT_LIMIT_ENABLE, enable as u16)
    }

    /// Fetch the plain I/O state of the selected FPGA into the write cache.
    ///
    /// Does not change the write cache's freshness.
    pub fn fetch_status(&mut self, tr: &impl Transport) -> Result<IoState> {
        let buf = self.request::<IO_STATE_LEN>(tr, VR_IO_STATE, 0, 0)?;
        let status = IoState::parse(&buf);
        debug!(
            "#{} io_state: 0x{:02x} 0x{:02x} 0x{:02x} - 0x{:02x} 0x{:02x} 0x{:02x}",
            self.num,
            status.io_state,
            status.timeout,
            status.app_status,
            status.pkt_comm_status,
            status.debug2,
            status.debug3
        );
        self.wr.status = status;
        Ok(status)
    }

    /// Arm output of the selected FPGA. Returns pending output in bytes.
    pub fn setup_output(&mut self, tr: &impl Transport) -> Result<usize> {
        let buf = self.request::<2>(tr, VR_SETUP_OUTPUT, 0, 0)?;
        Ok(u16::from_le_bytes(buf) as usize * OUTPUT_WORD_WIDTH)
    }

    /// Select, fetch I/O state and arm output in one request.
    ///
    /// Both the write and read caches become fresh.
    pub fn select_and_fetch_status(&mut self, tr: &impl Transport) -> Result<SelectStatus> {
        let buf = self.request::<SELECT_STATUS_LEN>(tr, VR_SELECT_SETUP_IO, self.num as u16, 0)?;
        let status = SelectStatus::parse(&buf);
        debug!(
            "select_setup_io({}): state 0x{:02x} 0x{:02x} 0x{:02x} - 0x{:02x}, limit {}",
            self.num,
            status.io_state,
            status.timeout,
            status.app_status,
            status.pkt_comm_status,
            status.read_limit_bytes()
        );
        self.wr.status = status.as_io_state();
        self.wr.freshness = Freshness::Fresh;
        self.rd.limit = status.read_limit_bytes();
        self.rd.freshness = Freshness::Fresh;
        Ok(status)
    }

    /// Identity echo of the selected FPGA.
    pub fn echo_identity(&mut self, tr: &impl Transport, challenge: [u16; 2]) -> Result<EchoReply> {
        let buf = self.request::<ECHO_REPLY_LEN>(tr, VR_ECHO, challenge[0], challenge[1])?;
        Ok(EchoReply::parse(&buf))
    }

    // ── Write path ──

    /// Check I/O state and decide whether a write may proceed.
    fn write_gate(&mut self, tr: &impl Transport) -> Result<bool> {
        self.wr.done = false;
        if !self.wr.freshness.take() {
            self.fetch_status(tr)?;
            if self.wr.status.timeout < 1 {
                self.wr.not_ready_count += 1;
                if self.wr.not_ready_count >= 2 {
                    return Err(DeviceError::IoTimeout);
                }
                debug!("#{} io_state.timeout = 0, skipping write", self.num);
                return Ok(false);
            }
            self.wr.not_ready_count = 0;
        }

        let bits = self.wr.status.io_state;
        if bits & IO_STATE_LIMIT_NOT_DONE != 0 {
            return Err(DeviceError::LimitNotDone);
        }
        if bits & IO_STATE_SFIFO_NOT_EMPTY != 0 {
            return Err(DeviceError::SfifoNotEmpty);
        }
        if bits & !IO_STATE_INPUT_PROG_FULL != 0 {
            warn!("#{} unknown io_state=0x{bits:02X}", self.num);
            return Err(DeviceError::UnknownIoState(bits));
        }
        if bits & IO_STATE_INPUT_PROG_FULL != 0 {
            debug!("#{} input full", self.num);
            return Ok(false);
        }
        Ok(true)
    }

    fn bulk_send(&mut self, tr: &impl Transport, data: &[u8]) -> Result<usize> {
        let sent = tr.bulk_write(EP_DATA_OUT, data)?;
        debug!("#{} write: {sent}/{}", self.num, data.len());
        if sent != data.len() {
            return Err(DeviceError::PartialWrite {
                sent,
                len: data.len(),
            });
        }
        Ok(sent)
    }

    /// Flow-controlled write of `data`. Returns bytes written, 0 if the
    /// FPGA cannot accept input right now.
    pub fn write_raw(&mut self, tr: &impl Transport, data: &[u8]) -> Result<usize> {
        if !self.write_gate(tr)? {
            return Ok(0);
        }
        let sent = self.bulk_send(tr, data)?;
        self.wr.count += 1;
        self.wr.done = true;
        Ok(sent)
    }

    /// Flow-controlled write of the packet link's next outbound chunk.
    pub fn write_packet(&mut self, tr: &impl Transport) -> Result<usize> {
        if !self.write_gate(tr)? {
            return Ok(0);
        }
        let num = self.num;
        let Some(link) = self.link.as_deref_mut() else {
            return Err(DeviceError::Invalid);
        };
        let Some(chunk) = link.output_chunk() else {
            debug!("#{num} no data for transmission");
            return Ok(0);
        };

        let len = chunk.len();
        let sent = tr.bulk_write(EP_DATA_OUT, chunk)?;
        debug!("#{num} write: {sent}/{len}");
        if sent != len {
            return Err(DeviceError::PartialWrite { sent, len });
        }
        link.output_completed(len);
        self.wr.count += 1;
        self.wr.done = true;
        Ok(sent)
    }

    // ── Read path ──

    /// Determine the pending output length; 0 means nothing to read.
    fn read_gate(&mut self, tr: &impl Transport) -> Result<usize> {
        self.rd.done = false;
        if !self.rd.freshness.take() {
            let limit = self.setup_output(tr)?;
            if limit == 0 {
                debug!("#{} read_limit==0", self.num);
                return Ok(0);
            }
            self.rd.limit = limit;
        }
        Ok(self.rd.limit)
    }

    fn finish_read(&mut self, limit: usize) {
        self.rd.count += 1;
        self.rd.done = true;
        self.rd.len = limit;
    }

    /// Read all pending output into `buf`. Returns bytes read.
    pub fn read_raw(&mut self, tr: &impl Transport, buf: &mut [u8]) -> Result<usize> {
        let limit = self.read_gate(tr)?;
        if limit == 0 {
            return Ok(0);
        }
        if buf.len() < limit {
            return Err(DeviceError::BufferTooSmall {
                needed: limit,
                available: buf.len(),
            });
        }
        self.rd.partial_count += read_fully(tr, self.num, &mut buf[..limit])?;
        self.finish_read(limit);
        Ok(limit)
    }

    /// Read all pending output into the packet link's input buffer.
    pub fn read_packet(&mut self, tr: &impl Transport) -> Result<usize> {
        let limit = self.read_gate(tr)?;
        if limit == 0 {
            return Ok(0);
        }
        let num = self.num;
        let Some(link) = self.link.as_deref_mut() else {
            return Err(DeviceError::Invalid);
        };
        let Some(buf) = link.input_buffer(limit)? else {
            debug!("#{num} no input buffer available");
            return Ok(0);
        };
        if buf.len() < limit {
            return Err(DeviceError::BufferTooSmall {
                needed: limit,
                available: buf.len(),
            });
        }
        let partials = read_fully(tr, num, &mut buf[..limit])?;
        link.input_completed(limit)?;

        self.rd.partial_count += partials;
        self.finish_read(limit);
        Ok(limit)
    }
}

/// Bulk-read until `buf` is full. Returns the number of short transfers.
fn read_fully(tr: &impl Transport, num: u8, buf: &mut [u8]) -> Result<u64> {
    let requested = buf.len();
    let mut offset = 0;
    let mut partials = 0;
    while offset < requested {
        let n = tr.bulk_read(EP_DATA_IN, &mut buf[offset..])?;
        debug!("#{num} bulk read: {n} of {}", requested - offset);
        if n == 0 {
            return Err(DeviceError::ZeroRead {
                received: offset,
                requested,
            });
        }
        offset += n;
        if offset < requested {
            debug!("#{num} partial read: {offset} of {requested}");
            partials += 1;
        }
    }
    Ok(partials)
}

// ── Identity echo ──

/// Reply to the identity echo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub data: [u16; 2],
    pub chip_id: u8,
    pub bitstream_type: u16,
}

impl EchoReply {
    pub fn parse(buf: &[u8; ECHO_REPLY_LEN]) -> Self {
        EchoReply {
            data: [
                u16::from_le_bytes([buf[0], buf[1]]),
                u16::from_le_bytes([buf[2], buf[3]]),
            ],
            chip_id: buf[4],
            bitstream_type: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    /// Both words came back XORed with the magic.
    pub fn words_match(&self, challenge: [u16; 2]) -> bool {
        self.data[0] ^ ECHO_MAGIC == challenge[0] && self.data[1] ^ ECHO_MAGIC == challenge[1]
    }

    /// Words match and the reply came from chip `num`.
    pub fn answers(&self, challenge: [u16; 2], num: u8) -> bool {
        self.words_match(challenge) && self.chip_id == num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::mock::MockLink;
    use crate::usb::UsbUnit;
    use crate::usb::mock::*;

    fn setup(num_chips: usize) -> (MockUnit, MockTransport) {
        let unit = MockUnit::new("SN-TEST", num_chips);
        let link = unit.claim().unwrap();
        (unit, link)
    }

    #[test]
    fn freshness_take_consumes() {
        let mut f = Freshness::Fresh;
        assert!(f.take());
        assert_eq!(f, Freshness::Stale);
        assert!(!f.take());
    }

    #[test]
    fn new_chip_is_unvalidated_and_stale() {
        let chip = Chip::new(3);
        assert_eq!(chip.num, 3);
        assert_eq!(chip.bitstream_type, 0);
        assert_eq!(chip.wr.freshness, Freshness::Stale);
        assert_eq!(chip.rd.freshness, Freshness::Stale);
        assert!(!chip.has_link());
    }

    #[test]
    fn select_uses_waiting_select_and_counts() {
        let (unit, tr) = setup(2);
        let mut chip = Chip::new(1);
        chip.select(&tr).unwrap();
        assert_eq!(*unit.state.commands.borrow(), vec![(VC_SELECT_WAIT, 1, 0)]);
        assert_eq!(chip.cmd_count, 1);
    }

    #[test]
    fn set_mode_sends_value() {
        let (unit, tr) = setup(1);
        let mut chip = Chip::new(0);
        chip.set_mode(&tr, APP_MODE_PKT_COMM).unwrap();
        assert_eq!(
            *unit.state.commands.borrow(),
            vec![(VC_SET_APP_MODE, APP_MODE_PKT_COMM, 0)]
        );
    }

    #[test]
    fn switches_send_zero_or_one() {
        let (unit, tr) = setup(1);
        let mut chip = Chip::new(0);
        chip.hs_io_enable(&tr, false).unwrap();
        chip.output_limit_enable(&tr, true).unwrap();
        assert_eq!(
            *unit.state.commands.borrow(),
            vec![(VC_HS_IO_ENABLE, 0, 0), (VC_OUTPUT_LIMIT_ENABLE, 1, 0)]
        );
    }

    #[test]
    fn select_and_fetch_status_populates_both_caches() {
        let (unit, tr) = setup(1);
        unit.state
            .add_reply(VR_SELECT_SETUP_IO, vec![0x00, 0x07, 0x00, 0x00, 0xEE, 0xEE, 0x10, 0x00]);
        let mut chip = Chip::new(0);
        let st = chip.select_and_fetch_status(&tr).unwrap();
        assert_eq!(st.read_limit, 16);
        assert_eq!(st.timeout, 7);
        assert_eq!(chip.wr.freshness, Freshness::Fresh);
        assert_eq!(chip.rd.freshness, Freshness::Fresh);
        assert_eq!(chip.rd.limit, 32);
        assert_eq!(chip.wr.status.timeout, 7);
    }

    #[test]
    fn fetch_status_parses_all_fields() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_IO_STATE, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let mut chip = Chip::new(0);
        let st = chip.fetch_status(&tr).unwrap();
        assert_eq!(
            st,
            IoState {
                io_state: 1,
                timeout: 2,
                app_status: 3,
                pkt_comm_status: 4,
                debug2: 5,
                debug3: 6
            }
        );
        assert_eq!(chip.wr.freshness, Freshness::Stale);
    }

    #[test]
    fn short_control_reply_is_transport_error() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_IO_STATE, vec![0x00, 0x01]);
        let mut chip = Chip::new(0);
        let err = chip.fetch_status(&tr).unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
    }

    #[test]
    fn setup_output_scales_words_to_bytes() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, vec![0x00, 0x10]);
        let mut chip = Chip::new(0);
        assert_eq!(chip.setup_output(&tr).unwrap(), 0x1000 * 2);
    }

    // ── Write path ──

    #[test]
    fn write_raw_when_ready() {
        let (unit, tr) = setup(1);
        let mut chip = Chip::new(0);
        assert_eq!(chip.write_raw(&tr, &[1, 2, 3, 4]).unwrap(), 4);
        assert_eq!(chip.wr.count, 1);
        assert!(chip.wr.done);
        assert_eq!(*unit.state.written.borrow(), vec![vec![1, 2, 3, 4]]);
        assert_eq!(unit.state.request_count(VR_IO_STATE), 1);
    }

    #[test]
    fn write_uses_fresh_status_once() {
        let (unit, tr) = setup(1);
        let mut chip = Chip::new(0);
        chip.select_and_fetch_status(&tr).unwrap();
        chip.write_raw(&tr, &[0; 8]).unwrap();
        assert_eq!(unit.state.request_count(VR_IO_STATE), 0);
        chip.write_raw(&tr, &[0; 8]).unwrap();
        assert_eq!(unit.state.request_count(VR_IO_STATE), 1);
        assert_eq!(chip.wr.count, 2);
    }

    #[test]
    fn write_skipped_when_input_full() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_IO_STATE, vec![IO_STATE_INPUT_PROG_FULL, 1, 0, 0, 0, 0]);
        let mut chip = Chip::new(0);
        assert_eq!(chip.write_raw(&tr, &[0; 8]).unwrap(), 0);
        assert!(!chip.wr.done);
        assert!(unit.state.written.borrow().is_empty());
    }

    #[test]
    fn two_consecutive_not_ready_fetches_time_out() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_IO_STATE, vec![0, 0, 0, 0, 0, 0]);
        unit.state.add_reply(VR_IO_STATE, vec![0, 0, 0, 0, 0, 0]);
        let mut chip = Chip::new(0);
        assert_eq!(chip.write_raw(&tr, &[0; 8]).unwrap(), 0);
        let err = chip.write_raw(&tr, &[0; 8]).unwrap_err();
        assert!(matches!(err, DeviceError::IoTimeout));
        assert_eq!(err.code(), ERR_IO_STATE_TIMEOUT);
        assert!(unit.state.written.borrow().is_empty());
    }

    #[test]
    fn ready_fetch_resets_not_ready_counter() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_IO_STATE, vec![0, 0, 0, 0, 0, 0]);
        unit.state.add_reply(VR_IO_STATE, vec![0, 1, 0, 0, 0, 0]);
        unit.state.add_reply(VR_IO_STATE, vec![0, 0, 0, 0, 0, 0]);
        let mut chip = Chip::new(0);
        assert_eq!(chip.write_raw(&tr, &[0; 2]).unwrap(), 0);
        assert_eq!(chip.write_raw(&tr, &[0; 2]).unwrap(), 2);
        assert_eq!(chip.wr.not_ready_count, 0);
        assert_eq!(chip.write_raw(&tr, &[0; 2]).unwrap(), 0);
        assert_eq!(chip.wr.not_ready_count, 1);
    }

    #[test]
    fn status_bits_map_to_faults() {
        let cases = [
            (IO_STATE_LIMIT_NOT_DONE, ERR_IO_STATE_LIMIT_NOT_DONE),
            (IO_STATE_SFIFO_NOT_EMPTY, ERR_IO_STATE_SFIFO_NOT_EMPTY),
            (IO_STATE_OUTPUT_ERR_OVERFLOW, -1),
        ];
        for (bits, code) in cases {
            let (unit, tr) = setup(1);
            unit.state.add_reply(VR_IO_STATE, vec![bits, 1, 0, 0, 0, 0]);
            let mut chip = Chip::new(0);
            let err = chip.write_raw(&tr, &[0; 2]).unwrap_err();
            assert_eq!(err.code(), code, "bits 0x{bits:02x}");
        }
    }

    #[test]
    fn limit_not_done_wins_over_input_full() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(
            VR_IO_STATE,
            vec![IO_STATE_LIMIT_NOT_DONE | IO_STATE_INPUT_PROG_FULL, 1, 0, 0, 0, 0],
        );
        let mut chip = Chip::new(0);
        assert!(matches!(
            chip.write_raw(&tr, &[0; 2]),
            Err(DeviceError::LimitNotDone)
        ));
    }

    #[test]
    fn partial_write_leaves_counter_unchanged() {
        let (unit, tr) = setup(1);
        unit.state.write_results.borrow_mut().push_back(Ok(4096));
        let mut chip = Chip::new(0);
        let err = chip.write_raw(&tr, &[0; 8192]).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::PartialWrite {
                sent: 4096,
                len: 8192
            }
        ));
        assert_eq!(err.code(), ERR_WR_PARTIAL);
        assert_eq!(chip.wr.count, 0);
        assert!(!chip.wr.done);
    }

    #[test]
    fn write_packet_without_data_is_noop() {
        let (unit, tr) = setup(1);
        let mut chip = Chip::new(0);
        let (link, _log) = MockLink::new();
        chip.attach_link(Box::new(link));
        assert_eq!(chip.write_packet(&tr).unwrap(), 0);
        assert!(unit.state.written.borrow().is_empty());
        assert_eq!(chip.wr.count, 0);
    }

    #[test]
    fn write_packet_reports_completion() {
        let (unit, tr) = setup(1);
        let mut chip = Chip::new(0);
        let (link, log) = MockLink::new();
        log.borrow_mut().pending_out.push_back(vec![7; 100]);
        chip.attach_link(Box::new(link));
        assert_eq!(chip.write_packet(&tr).unwrap(), 100);
        assert_eq!(log.borrow().output_completed, vec![100]);
        assert_eq!(unit.state.written.borrow()[0].len(), 100);
        assert_eq!(chip.wr.count, 1);
    }

    // ── Read path ──

    #[test]
    fn read_nothing_pending() {
        let (unit, tr) = setup(1);
        let mut chip = Chip::new(0);
        let mut buf = [0u8; 16];
        assert_eq!(chip.read_raw(&tr, &mut buf).unwrap(), 0);
        assert!(unit.state.read_requests.borrow().is_empty());
        assert_eq!(chip.rd.count, 0);
    }

    #[test]
    fn short_read_is_completed_with_second_transfer() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 4096u16.to_le_bytes().to_vec());
        unit.state.read_fragments.borrow_mut().push_back(Ok(vec![0xAA; 3000]));
        unit.state.read_fragments.borrow_mut().push_back(Ok(vec![0xBB; 5192]));
        let mut chip = Chip::new(0);
        let mut buf = vec![0u8; 8192];
        assert_eq!(chip.read_raw(&tr, &mut buf).unwrap(), 8192);
        assert_eq!(*unit.state.read_requests.borrow(), vec![8192, 5192]);
        assert_eq!(chip.rd.partial_count, 1);
        assert_eq!(chip.rd.count, 1);
        assert_eq!(chip.rd.len, 8192);
        assert!(buf[..3000].iter().all(|&b| b == 0xAA));
        assert!(buf[3000..].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn zero_length_transfer_is_fault() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 8u16.to_le_bytes().to_vec());
        let mut chip = Chip::new(0);
        let mut buf = [0u8; 16];
        let err = chip.read_raw(&tr, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ZeroRead {
                received: 0,
                requested: 16
            }
        ));
        assert_eq!(err.code(), ERR_RD_ZEROREAD);
        assert_eq!(chip.rd.count, 0);
    }

    #[test]
    fn read_buffer_too_small() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 8u16.to_le_bytes().to_vec());
        let mut chip = Chip::new(0);
        let mut buf = [0u8; 4];
        assert!(matches!(
            chip.read_raw(&tr, &mut buf),
            Err(DeviceError::BufferTooSmall {
                needed: 16,
                available: 4
            })
        ));
    }

    #[test]
    fn read_uses_fresh_limit_once() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SELECT_SETUP_IO, vec![0, 1, 0, 0, 0, 0, 2, 0]);
        unit.state.read_fragments.borrow_mut().push_back(Ok(vec![1, 2, 3, 4]));
        let mut chip = Chip::new(0);
        chip.select_and_fetch_status(&tr).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(chip.read_raw(&tr, &mut buf).unwrap(), 4);
        assert_eq!(unit.state.request_count(VR_SETUP_OUTPUT), 0);
        // Limit consumed: next read asks the FPGA again.
        assert_eq!(chip.read_raw(&tr, &mut buf).unwrap(), 0);
        assert_eq!(unit.state.request_count(VR_SETUP_OUTPUT), 1);
    }

    #[test]
    fn read_packet_delivers_to_link() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 2u16.to_le_bytes().to_vec());
        unit.state.read_fragments.borrow_mut().push_back(Ok(vec![1, 2]));
        unit.state.read_fragments.borrow_mut().push_back(Ok(vec![3, 4]));
        let mut chip = Chip::new(0);
        let (link, log) = MockLink::new();
        chip.attach_link(Box::new(link));
        assert_eq!(chip.read_packet(&tr).unwrap(), 4);
        assert_eq!(log.borrow().input_requests, vec![4]);
        assert_eq!(log.borrow().input_completed, vec![4]);
        assert_eq!(log.borrow().received, vec![1, 2, 3, 4]);
        assert_eq!(chip.rd.partial_count, 1);
    }

    #[test]
    fn read_packet_is_bounded_by_limit_not_link_buffer() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 2u16.to_le_bytes().to_vec());
        unit.state.read_fragments.borrow_mut().push_back(Ok(vec![5, 6, 7, 8]));
        let mut chip = Chip::new(0);
        let (link, log) = MockLink::new();
        log.borrow_mut().buffer_len = Some(1024);
        chip.attach_link(Box::new(link));
        assert_eq!(chip.read_packet(&tr).unwrap(), 4);
        assert_eq!(*unit.state.read_requests.borrow(), vec![4]);
        assert_eq!(log.borrow().input_completed, vec![4]);
        assert_eq!(log.borrow().received, vec![5, 6, 7, 8]);
        assert_eq!(chip.rd.partial_count, 0);
    }

    #[test]
    fn read_packet_rejects_short_link_buffer() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 4u16.to_le_bytes().to_vec());
        let mut chip = Chip::new(0);
        let (link, log) = MockLink::new();
        log.borrow_mut().buffer_len = Some(6);
        chip.attach_link(Box::new(link));
        assert!(matches!(
            chip.read_packet(&tr),
            Err(DeviceError::BufferTooSmall {
                needed: 8,
                available: 6
            })
        ));
        assert!(unit.state.read_requests.borrow().is_empty());
        assert_eq!(chip.rd.count, 0);
    }

    #[test]
    fn read_packet_link_fault() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 2u16.to_le_bytes().to_vec());
        let mut chip = Chip::new(0);
        let (link, log) = MockLink::new();
        log.borrow_mut().fail_input = true;
        chip.attach_link(Box::new(link));
        let err = chip.read_packet(&tr).unwrap_err();
        assert!(matches!(err, DeviceError::PacketLink(_)));
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn read_packet_without_space_is_noop() {
        let (unit, tr) = setup(1);
        unit.state.add_reply(VR_SETUP_OUTPUT, 2u16.to_le_bytes().to_vec());
        let mut chip = Chip::new(0);
        let (link, log) = MockLink::new();
        log.borrow_mut().no_space = true;
        chip.attach_link(Box::new(link));
        assert_eq!(chip.read_packet(&tr).unwrap(), 0);
        assert!(unit.state.read_requests.borrow().is_empty());
    }

    // ── Echo ──

    #[test]
    fn echo_reply_answers_challenge() {
        let reply = EchoReply {
            data: [0x1234 ^ ECHO_MAGIC, 0xFFFF ^ ECHO_MAGIC],
            chip_id: 2,
            bitstream_type: 1,
        };
        assert!(reply.answers([0x1234, 0xFFFF], 2));
        assert!(!reply.answers([0x1234, 0xFFFF], 1));
        assert!(!reply.answers([0x1235, 0xFFFF], 2));
    }

    #[test]
    fn echo_identity_round_trip_through_mock() {
        let (unit, tr) = setup(2);
        unit.state.load_all(0x0001);
        let mut chip = Chip::new(1);
        chip.low_level_select(&tr).unwrap();
        let reply = chip.echo_identity(&tr, [0x0102, 0x0304]).unwrap();
        assert!(reply.answers([0x0102, 0x0304], 1));
        assert_eq!(reply.bitstream_type, 0x0001);
    }
}
