//! USB transport primitives and the in-memory mock board.
//!
//! [`Transport`] is the thin request/response layer every other module calls
//! into: vendor control requests and commands on EP0, and bulk transfers with
//! a fixed per-call timeout. [`UsbUnit`] is an enumerated, not yet claimed
//! board; claiming it yields the transport link, and dropping the link
//! releases the interface.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::protocol::*;

// ── Error type ──

/// A failed control or bulk transfer, carrying a libusb-style signed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: i32,
    pub context: String,
}

impl TransportError {
    pub fn new(code: i32, context: impl Into<String>) -> Self {
        TransportError {
            code,
            context: context.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({})",
            self.context,
            usb_strerror(self.code),
            self.code
        )
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

// ── Timeouts ──

/// Fixed per-transfer timeouts. Not adjustable per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub control: Duration,
    pub bulk: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            control: Duration::from_millis(1000),
            bulk: Duration::from_millis(500),
        }
    }
}

// ── Traits ──

/// Blocking transfer primitives against one claimed board.
pub trait Transport {
    /// Vendor request (device-to-host). Returns the number of reply bytes.
    fn control_request(&self, request: u8, value: u16, index: u16, buf: &mut [u8])
    -> Result<usize>;

    /// Vendor command (host-to-device) without payload.
    fn control_command(&self, request: u8, value: u16, index: u16) -> Result<()>;

    /// Bulk OUT. Returns bytes actually sent, which may be short.
    fn bulk_write(&self, endpoint: u8, data: &[u8]) -> Result<usize>;

    /// Bulk IN into `buf`. Returns bytes actually received, which may be short.
    fn bulk_read(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize>;

    /// Stream a raw configuration image into every FPGA on the board.
    fn upload_image(&self, num_chips: usize, image: &[u8]) -> Result<()>;
}

/// An enumerated board that can be claimed for exclusive use.
pub trait UsbUnit {
    type Link: Transport;

    /// Stable serial-number string.
    fn serial(&self) -> &str;

    /// Number of FPGAs on the board (at most [`DEVICE_CHIPS_MAX`]).
    fn num_chips(&self) -> usize;

    /// Bus location, for display.
    fn path(&self) -> String {
        String::new()
    }

    /// Claim the board's interface. Dropping the returned link releases it.
    fn claim(&self) -> Result<Self::Link>;
}

/// A discovered board (not claimed), for listing.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredUnit {
    pub path: String,
    pub serial: String,
    pub num_chips: usize,
}

impl DiscoveredUnit {
    pub fn from_unit(unit: &impl UsbUnit) -> Self {
        DiscoveredUnit {
            path: unit.path(),
            serial: unit.serial().to_string(),
            num_chips: unit.num_chips(),
        }
    }
}

// ── Linux implementation ──

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::future::Future;

    use async_io::Timer;
    use futures_lite::future::{self, block_on};
    use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer, TransferError};

    /// Run `fut` to completion unless `timeout` elapses first.
    pub(super) fn block_on_timeout<F: Future>(fut: F, timeout: Duration) -> Option<F::Output> {
        block_on(future::or(async { Some(fut.await) }, async {
            Timer::after(timeout).await;
            None
        }))
    }

    fn transfer_code(e: TransferError) -> i32 {
        #[allow(unreachable_patterns)]
        match e {
            TransferError::Cancelled => USB_ERROR_TIMEOUT,
            TransferError::Stall => USB_ERROR_PIPE,
            TransferError::Disconnected => USB_ERROR_NO_DEVICE,
            TransferError::Fault => USB_ERROR_IO,
            _ => USB_ERROR_OTHER,
        }
    }

    fn io_code(e: &std::io::Error, fallback: i32) -> i32 {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => USB_ERROR_ACCESS,
            std::io::ErrorKind::NotFound => USB_ERROR_NO_DEVICE,
            _ => fallback,
        }
    }

    pub struct LinuxUnit {
        info: nusb::DeviceInfo,
        serial: String,
        num_chips: usize,
        timeouts: Timeouts,
    }

    pub struct LinuxLink {
        interface: nusb::Interface,
        timeouts: Timeouts,
    }

    impl LinuxLink {
        fn vendor(request: u8, value: u16, index: u16) -> Control {
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request,
                value,
                index,
            }
        }

        fn control_out(&self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
            self.interface
                .control_out_blocking(
                    Self::vendor(request, value, index),
                    data,
                    self.timeouts.control,
                )
                .map_err(|e| {
                    TransportError::new(transfer_code(e), format!("control_out(0x{request:02X})"))
                })?;
            Ok(())
        }
    }

    impl Transport for LinuxLink {
        fn control_request(
            &self,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
        ) -> Result<usize> {
            self.interface
                .control_in_blocking(
                    Self::vendor(request, value, index),
                    buf,
                    self.timeouts.control,
                )
                .map_err(|e| {
                    TransportError::new(transfer_code(e), format!("control_in(0x{request:02X})"))
                })
        }

        fn control_command(&self, request: u8, value: u16, index: u16) -> Result<()> {
            self.control_out(request, value, index, &[])
        }

        fn bulk_write(&self, endpoint: u8, data: &[u8]) -> Result<usize> {
            let mut queue = self.interface.bulk_out_queue(endpoint);
            queue.submit(data.to_vec());

            let completion = match block_on_timeout(queue.next_complete(), self.timeouts.bulk) {
                Some(c) => c,
                None => {
                    queue.cancel_all();
                    block_on(queue.next_complete())
                }
            };

            completion.status.map_err(|e| {
                TransportError::new(transfer_code(e), format!("bulk_out(0x{endpoint:02X})"))
            })?;
            Ok(completion.data.actual_length())
        }

        fn bulk_read(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize> {
            let mut queue = self.interface.bulk_in_queue(endpoint);
            queue.submit(RequestBuffer::new(buf.len()));

            let completion = match block_on_timeout(queue.next_complete(), self.timeouts.bulk) {
                Some(c) => c,
                None => {
                    queue.cancel_all();
                    block_on(queue.next_complete())
                }
            };

            completion.status.map_err(|e| {
                TransportError::new(transfer_code(e), format!("bulk_in(0x{endpoint:02X})"))
            })?;
            let n = completion.data.len().min(buf.len());
            buf[..n].copy_from_slice(&completion.data[..n]);
            Ok(n)
        }

        fn upload_image(&self, num_chips: usize, image: &[u8]) -> Result<()> {
            for num in 0..num_chips {
                self.control_command(VC_SELECT_FPGA, num as u16, 0)?;
                self.control_command(VC_FPGA_RESET_CONFIG, 0, 0)?;
                for chunk in image.chunks(UPLOAD_CHUNK_SIZE) {
                    self.control_out(VC_FPGA_SEND_DATA, 0, 0, chunk)?;
                }
                let mut state = [0u8; FPGA_STATE_LEN];
                let n = self.control_request(VR_FPGA_STATE, 0, 0, &mut state)?;
                if n == 0 || state[0] != 0 {
                    return Err(TransportError::new(
                        USB_ERROR_IO,
                        format!("FPGA #{num} not configured after upload"),
                    ));
                }
            }
            Ok(())
        }
    }

    impl UsbUnit for LinuxUnit {
        type Link = LinuxLink;

        fn serial(&self) -> &str {
            &self.serial
        }

        fn num_chips(&self) -> usize {
            self.num_chips
        }

        fn path(&self) -> String {
            format!(
                "usb:{:03}/{:03} [{:04x}:{:04x}]",
                self.info.bus_number(),
                self.info.device_address(),
                self.info.vendor_id(),
                self.info.product_id(),
            )
        }

        fn claim(&self) -> Result<LinuxLink> {
            let device = self.info.open().map_err(|e| {
                TransportError::new(io_code(&e, USB_ERROR_IO), format!("USB open: {e}"))
            })?;
            let interface = device.detach_and_claim_interface(USB_INTERFACE).map_err(|e| {
                TransportError::new(
                    io_code(&e, USB_ERROR_BUSY),
                    format!("claim interface {USB_INTERFACE}: {e}"),
                )
            })?;
            Ok(LinuxLink {
                interface,
                timeouts: self.timeouts,
            })
        }
    }

    pub fn enumerate_units_linux(timeouts: Timeouts, chips_per_device: usize) -> Result<Vec<LinuxUnit>> {
        let devices = nusb::list_devices().map_err(|e| {
            TransportError::new(io_code(&e, USB_ERROR_IO), format!("USB enumeration: {e}"))
        })?;

        Ok(devices
            .filter(|dev| dev.vendor_id() == ZTEX_VID && dev.product_id() == ZTEX_PID)
            .filter_map(|dev| {
                let Some(serial) = dev.serial_number().map(|s| s.to_string()) else {
                    log::warn!(
                        "usb:{:03}/{:03}: board without serial number skipped",
                        dev.bus_number(),
                        dev.device_address()
                    );
                    return None;
                };
                Some(LinuxUnit {
                    info: dev,
                    serial,
                    num_chips: chips_per_device.clamp(1, DEVICE_CHIPS_MAX),
                    timeouts,
                })
            })
            .collect())
    }
}

#[cfg(target_os = "linux")]
pub use linux_impl::{LinuxLink, LinuxUnit};

// ── Stub unit for unsupported platforms ──

/// Placeholder that is never enumerated.
/// Enables compilation and `cargo test` on unsupported hosts.
#[cfg(not(target_os = "linux"))]
pub struct StubUnit;

#[cfg(not(target_os = "linux"))]
pub struct StubLink;

#[cfg(not(target_os = "linux"))]
impl Transport for StubLink {
    fn control_request(&self, _: u8, _: u16, _: u16, _: &mut [u8]) -> Result<usize> {
        unreachable!()
    }
    fn control_command(&self, _: u8, _: u16, _: u16) -> Result<()> {
        unreachable!()
    }
    fn bulk_write(&self, _: u8, _: &[u8]) -> Result<usize> {
        unreachable!()
    }
    fn bulk_read(&self, _: u8, _: &mut [u8]) -> Result<usize> {
        unreachable!()
    }
    fn upload_image(&self, _: usize, _: &[u8]) -> Result<()> {
        unreachable!()
    }
}

#[cfg(not(target_os = "linux"))]
impl UsbUnit for StubUnit {
    type Link = StubLink;
    fn serial(&self) -> &str {
        unreachable!()
    }
    fn num_chips(&self) -> usize {
        unreachable!()
    }
    fn claim(&self) -> Result<StubLink> {
        Err(TransportError::new(USB_ERROR_NO_DEVICE, "USB not supported"))
    }
}

/// Concrete unit type for the current platform.
#[cfg(target_os = "linux")]
pub type PlatformUnit = LinuxUnit;
#[cfg(not(target_os = "linux"))]
pub type PlatformUnit = StubUnit;

/// Enumerate all ZTEX boards with a serial number.
///
/// On unsupported platforms, always returns an empty list.
pub fn enumerate_units(timeouts: Timeouts, chips_per_device: usize) -> Result<Vec<PlatformUnit>> {
    #[cfg(target_os = "linux")]
    {
        linux_impl::enumerate_units_linux(timeouts, chips_per_device)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (timeouts, chips_per_device);
        Ok(Vec::new())
    }
}

// ── Mock transport for testing ──

/// In-memory boards for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;

    /// Shared state of one mock board. Links claimed from a [`MockUnit`]
    /// all point here, so tests can script replies before the device is
    /// created and inspect traffic afterwards.
    pub struct MockState {
        /// Currently selected FPGA (tracked from select commands/requests).
        pub selected: Cell<u16>,
        /// Bitstream type loaded on each FPGA; `None` = unconfigured.
        pub loaded_types: RefCell<Vec<Option<u16>>>,
        /// Bitstream type each FPGA reports after `upload_image`.
        pub image_types: RefCell<Vec<Option<u16>>>,
        /// Scripted replies per request code, consumed front-first.
        /// `Err(code)` simulates a transport failure.
        pub control_replies: RefCell<HashMap<u8, VecDeque<std::result::Result<Vec<u8>, i32>>>>,
        /// Commands that fail with the given code.
        pub fail_commands: RefCell<HashMap<u8, i32>>,
        /// Recorded vendor commands: (request, value, index).
        pub commands: RefCell<Vec<(u8, u16, u16)>>,
        /// Recorded vendor requests: (request, value, index).
        pub requests: RefCell<Vec<(u8, u16, u16)>>,
        /// Scripted bulk OUT results; `Ok(n)` sends `n` bytes. Default: all.
        pub write_results: RefCell<VecDeque<std::result::Result<usize, i32>>>,
        /// Bytes sent by each bulk OUT.
        pub written: RefCell<Vec<Vec<u8>>>,
        /// Scripted bulk IN fragments. When empty, loopback data (if enabled)
        /// or a zero-length transfer is returned.
        pub read_fragments: RefCell<VecDeque<std::result::Result<Vec<u8>, i32>>>,
        /// Requested length of each bulk IN.
        pub read_requests: RefCell<Vec<usize>>,
        /// Echo written bytes back on reads of the same FPGA, like
        /// application mode 1.
        pub loopback: Cell<bool>,
        pub loopback_bufs: RefCell<Vec<VecDeque<u8>>>,
        /// Image lengths passed to `upload_image`.
        pub uploads: RefCell<Vec<usize>>,
        pub fail_upload: Cell<bool>,
        pub claims: Cell<u32>,
        pub releases: Cell<u32>,
    }

    impl MockState {
        pub fn new(num_chips: usize) -> Rc<Self> {
            Rc::new(MockState {
                selected: Cell::new(0),
                loaded_types: RefCell::new(vec![None; num_chips]),
                image_types: RefCell::new(vec![None; num_chips]),
                control_replies: RefCell::new(HashMap::new()),
                fail_commands: RefCell::new(HashMap::new()),
                commands: RefCell::new(Vec::new()),
                requests: RefCell::new(Vec::new()),
                write_results: RefCell::new(VecDeque::new()),
                written: RefCell::new(Vec::new()),
                read_fragments: RefCell::new(VecDeque::new()),
                read_requests: RefCell::new(Vec::new()),
                loopback: Cell::new(false),
                loopback_bufs: RefCell::new(vec![VecDeque::new(); num_chips]),
                uploads: RefCell::new(Vec::new()),
                fail_upload: Cell::new(false),
                claims: Cell::new(0),
                releases: Cell::new(0),
            })
        }

        /// Mark every FPGA as configured with `bitstream_type`.
        pub fn load_all(&self, bitstream_type: u16) {
            for t in self.loaded_types.borrow_mut().iter_mut() {
                *t = Some(bitstream_type);
            }
        }

        /// Queue a reply for the next vendor request `request`.
        pub fn add_reply(&self, request: u8, reply: Vec<u8>) {
            self.control_replies
                .borrow_mut()
                .entry(request)
                .or_default()
                .push_back(Ok(reply));
        }

        /// Queue a transport failure for the next vendor request `request`.
        pub fn add_reply_error(&self, request: u8, code: i32) {
            self.control_replies
                .borrow_mut()
                .entry(request)
                .or_default()
                .push_back(Err(code));
        }

        /// Number of recorded vendor commands with code `request`.
        pub fn command_count(&self, request: u8) -> usize {
            self.commands
                .borrow()
                .iter()
                .filter(|(r, _, _)| *r == request)
                .count()
        }

        /// Number of recorded vendor requests with code `request`.
        pub fn request_count(&self, request: u8) -> usize {
            self.requests
                .borrow()
                .iter()
                .filter(|(r, _, _)| *r == request)
                .count()
        }

        fn pending_words(&self) -> u16 {
            if !self.loopback.get() {
                return 0;
            }
            let sel = self.selected.get() as usize;
            let pending = self
                .loopback_bufs
                .borrow()
                .get(sel)
                .map_or(0, |b| b.len().min(PKT_OUTPUT_CAPACITY));
            (pending / OUTPUT_WORD_WIDTH) as u16
        }

        fn default_reply(&self, request: u8, value: u16, index: u16) -> Option<Vec<u8>> {
            match request {
                VR_IO_STATE => Some(vec![0, 1, 0, 0, 0, 0]),
                VR_SETUP_OUTPUT => Some(self.pending_words().to_le_bytes().to_vec()),
                VR_SELECT_SETUP_IO => {
                    let limit = self.pending_words().to_le_bytes();
                    Some(vec![0, 1, 0, 0, 0, 0, limit[0], limit[1]])
                }
                VR_ECHO => {
                    let sel = self.selected.get();
                    let loaded = self.loaded_types.borrow().get(sel as usize).copied().flatten();
                    let mut reply = vec![0u8; ECHO_REPLY_LEN];
                    if let Some(t) = loaded {
                        reply[0..2].copy_from_slice(&(value ^ ECHO_MAGIC).to_le_bytes());
                        reply[2..4].copy_from_slice(&(index ^ ECHO_MAGIC).to_le_bytes());
                        reply[4] = sel as u8;
                        reply[6..8].copy_from_slice(&t.to_le_bytes());
                    }
                    Some(reply)
                }
                _ => None,
            }
        }
    }

    /// A mock board ready to be claimed.
    pub struct MockUnit {
        pub serial: String,
        pub num_chips: usize,
        pub state: Rc<MockState>,
        pub fail_claim: Cell<bool>,
    }

    impl MockUnit {
        pub fn new(serial: &str, num_chips: usize) -> Self {
            MockUnit {
                serial: serial.into(),
                num_chips,
                state: MockState::new(num_chips),
                fail_claim: Cell::new(false),
            }
        }
    }

    impl UsbUnit for MockUnit {
        type Link = MockTransport;

        fn serial(&self) -> &str {
            &self.serial
        }

        fn num_chips(&self) -> usize {
            self.num_chips
        }

        fn path(&self) -> String {
            format!("mock://{}", self.serial)
        }

        fn claim(&self) -> Result<MockTransport> {
            if self.fail_claim.get() {
                return Err(TransportError::new(USB_ERROR_BUSY, "mock: claim refused"));
            }
            self.state.claims.set(self.state.claims.get() + 1);
            Ok(MockTransport {
                state: Rc::clone(&self.state),
            })
        }
    }

    /// Claimed mock link. Dropping it counts as an interface release.
    pub struct MockTransport {
        pub state: Rc<MockState>,
    }

    impl Drop for MockTransport {
        fn drop(&mut self) {
            self.state.releases.set(self.state.releases.get() + 1);
        }
    }

    impl Transport for MockTransport {
        fn control_request(
            &self,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
        ) -> Result<usize> {
            let s = &self.state;
            s.requests.borrow_mut().push((request, value, index));
            if request == VR_SELECT_SETUP_IO {
                s.selected.set(value);
            }
            let scripted = s
                .control_replies
                .borrow_mut()
                .get_mut(&request)
                .and_then(|q| q.pop_front());
            let reply = match scripted {
                Some(Ok(r)) => r,
                Some(Err(code)) => {
                    return Err(TransportError::new(code, format!("mock: request 0x{request:02X}")));
                }
                None => s.default_reply(request, value, index).ok_or_else(|| {
                    TransportError::new(USB_ERROR_PIPE, format!("mock: no handler for 0x{request:02X}"))
                })?,
            };
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(n)
        }

        fn control_command(&self, request: u8, value: u16, index: u16) -> Result<()> {
            let s = &self.state;
            s.commands.borrow_mut().push((request, value, index));
            if let Some(&code) = s.fail_commands.borrow().get(&request) {
                return Err(TransportError::new(code, format!("mock: command 0x{request:02X}")));
            }
            if request == VC_SELECT_FPGA || request == VC_SELECT_WAIT {
                s.selected.set(value);
            }
            Ok(())
        }

        fn bulk_write(&self, _endpoint: u8, data: &[u8]) -> Result<usize> {
            let s = &self.state;
            let sent = match s.write_results.borrow_mut().pop_front() {
                Some(Ok(n)) => n.min(data.len()),
                Some(Err(code)) => return Err(TransportError::new(code, "mock: bulk_out")),
                None => data.len(),
            };
            s.written.borrow_mut().push(data[..sent].to_vec());
            if s.loopback.get() {
                if let Some(b) = s.loopback_bufs.borrow_mut().get_mut(s.selected.get() as usize) {
                    b.extend(&data[..sent]);
                }
            }
            Ok(sent)
        }

        fn bulk_read(&self, _endpoint: u8, buf: &mut [u8]) -> Result<usize> {
            let s = &self.state;
            s.read_requests.borrow_mut().push(buf.len());
            match s.read_fragments.borrow_mut().pop_front() {
                Some(Ok(fragment)) => {
                    let n = fragment.len().min(buf.len());
                    buf[..n].copy_from_slice(&fragment[..n]);
                    Ok(n)
                }
                Some(Err(code)) => Err(TransportError::new(code, "mock: bulk_in")),
                None => {
                    let mut bufs = s.loopback_bufs.borrow_mut();
                    let Some(lb) = bufs.get_mut(s.selected.get() as usize) else {
                        return Ok(0);
                    };
                    let n = lb.len().min(buf.len());
                    for (dst, src) in buf.iter_mut().zip(lb.drain(..n)) {
                        *dst = src;
                    }
                    Ok(n)
                }
            }
        }

        fn upload_image(&self, num_chips: usize, image: &[u8]) -> Result<()> {
            let s = &self.state;
            s.uploads.borrow_mut().push(image.len());
            if s.fail_upload.get() {
                return Err(TransportError::new(USB_ERROR_IO, "mock: upload failure injected"));
            }
            let image_types = s.image_types.borrow();
            let mut loaded = s.loaded_types.borrow_mut();
            for num in 0..num_chips.min(loaded.len()) {
                loaded[num] = image_types[num];
            }
            Ok(())
        }
    }
}
