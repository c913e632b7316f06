//! Protocol constants for ZTEX 1.15y multi-FPGA boards running the
//! inouttraffic firmware and bitstream.
//!
//! Vendor request (VR, device-to-host) and vendor command (VC, host-to-device)
//! codes are issued on the default control endpoint; payload data moves over
//! two bulk endpoints.

// ── USB identity ──

/// ZTEX vendor ID.
pub const ZTEX_VID: u16 = 0x221A;

/// ZTEX FX2-based board product ID.
pub const ZTEX_PID: u16 = 0x0100;

/// Interface claimed for exclusive use of the board.
pub const USB_INTERFACE: u8 = 0;

/// Bulk OUT endpoint (host → selected FPGA input buffer).
pub const EP_DATA_OUT: u8 = 0x06;

/// Bulk IN endpoint (selected FPGA output buffer → host).
pub const EP_DATA_IN: u8 = 0x82;

/// Maximum number of FPGAs on one board.
pub const DEVICE_CHIPS_MAX: usize = 4;

// ── Vendor requests / commands (inouttraffic firmware) ──

/// VC: enable/disable the high-speed I/O path (value = 0/1).
pub const VC_HS_IO_ENABLE: u8 = 0x80;

/// VC: set application mode (value = mode).
pub const VC_SET_APP_MODE: u8 = 0x82;

/// VR: read I/O state of the selected FPGA (6 bytes, see [`IO_STATE_LEN`]).
pub const VR_IO_STATE: u8 = 0x84;

/// VR: arm output; returns the pending output length in words (u16 LE).
pub const VR_SETUP_OUTPUT: u8 = 0x85;

/// VC: enable/disable output length limiting (value = 0/1). Enabled by default.
pub const VC_OUTPUT_LIMIT_ENABLE: u8 = 0x86;

/// VR: identity echo. value/index carry the two challenge words.
pub const VR_ECHO: u8 = 0x88;

/// VC: soft reset (Global Set Reset) of the selected FPGA's application.
pub const VC_RESET: u8 = 0x8B;

/// VR: select FPGA (value = index), fetch I/O state and arm output in one request.
pub const VR_SELECT_SETUP_IO: u8 = 0x8C;

/// VC: select FPGA (value = index) and wait for its I/O timeout to elapse.
pub const VC_SELECT_WAIT: u8 = 0x8E;

// ── ZTEX SDK requests (configuration and low-level FPGA selection) ──

/// VR: FPGA configuration state. Byte 0 is zero once the FPGA is configured.
pub const VR_FPGA_STATE: u8 = 0x30;

/// VC: reset FPGA configuration logic, preparing for a bitstream upload.
pub const VC_FPGA_RESET_CONFIG: u8 = 0x31;

/// VC: send a chunk of bitstream data over EP0.
pub const VC_FPGA_SEND_DATA: u8 = 0x32;

/// VC: select FPGA (value = index) without waiting for I/O to settle.
pub const VC_SELECT_FPGA: u8 = 0x51;

/// Maximum bitstream chunk size per [`VC_FPGA_SEND_DATA`] transfer.
pub const UPLOAD_CHUNK_SIZE: usize = 2048;

/// Length of the [`VR_FPGA_STATE`] reply.
pub const FPGA_STATE_LEN: usize = 9;

// ── Application modes ──

/// Test mode 1: FPGA echoes back exactly what it received, bypassing packet framing.
pub const APP_MODE_ECHO: u16 = 1;

/// Mode 2: high-speed packet communication. The primary mode of operation.
pub const APP_MODE_PKT_COMM: u16 = 2;

// ── Status layout ──

/// Length of the [`VR_IO_STATE`] reply:
/// `[io_state, timeout, app_status, pkt_comm_status, debug2, debug3]`.
pub const IO_STATE_LEN: usize = 6;

/// Length of the [`VR_SELECT_SETUP_IO`] reply:
/// `[io_state, timeout, app_status, pkt_comm_status, -, -, read_limit:u16]`.
pub const SELECT_STATUS_LEN: usize = 8;

/// FPGA input buffer is above its programmable-full mark; do not write.
pub const IO_STATE_INPUT_PROG_FULL: u8 = 0x01;

/// Previous output limit was not fully read out.
pub const IO_STATE_LIMIT_NOT_DONE: u8 = 0x02;

/// Output overflow (currently not checked by the host).
pub const IO_STATE_OUTPUT_ERR_OVERFLOW: u8 = 0x04;

/// Secondary FIFO still holds data.
pub const IO_STATE_SFIFO_NOT_EMPTY: u8 = 0x08;

/// Bytes per output word; read limits are reported in words.
pub const OUTPUT_WORD_WIDTH: usize = 2;

// ── Identity echo ──

/// Each echoed challenge word comes back XORed with this value.
pub const ECHO_MAGIC: u16 = 0x5A5A;

/// Length of the [`VR_ECHO`] reply:
/// `[data0:u16, data1:u16, fpga_id:u8, reserved:u8, bitstream_type:u16]`.
pub const ECHO_REPLY_LEN: usize = 8;

// ── Packet communication defaults ──

/// FPGA input buffer accepts this many bytes while `INPUT_PROG_FULL` is deasserted.
pub const PKT_INPUT_CAPACITY: usize = 16384;

/// Size of the FPGA output buffer; at most this many bytes per read.
pub const PKT_OUTPUT_CAPACITY: usize = 32766;

// ── Protocol fault codes ──

pub const ERR_IO_STATE_TIMEOUT: i32 = -3001;
pub const ERR_IO_STATE_OVERFLOW: i32 = -3002;
pub const ERR_IO_STATE_LIMIT_NOT_DONE: i32 = -3003;
pub const ERR_IO_STATE_SFIFO_NOT_EMPTY: i32 = -3004;
pub const ERR_WR_PARTIAL: i32 = -3101;
pub const ERR_RD_ZEROREAD: i32 = -3201;

// ── Transport error codes (libusb numbering) ──

pub const USB_ERROR_IO: i32 = -1;
pub const USB_ERROR_ACCESS: i32 = -3;
pub const USB_ERROR_NO_DEVICE: i32 = -4;
pub const USB_ERROR_BUSY: i32 = -6;
pub const USB_ERROR_TIMEOUT: i32 = -7;
pub const USB_ERROR_PIPE: i32 = -9;
pub const USB_ERROR_OTHER: i32 = -99;

/// Short name for a libusb-style error code, for log messages.
pub fn usb_strerror(code: i32) -> &'static str {
    match code {
        USB_ERROR_IO => "Input/Output Error",
        USB_ERROR_ACCESS => "Access denied",
        USB_ERROR_NO_DEVICE => "No such device",
        USB_ERROR_BUSY => "Resource busy",
        USB_ERROR_TIMEOUT => "Operation timed out",
        USB_ERROR_PIPE => "Pipe error",
        ERR_IO_STATE_TIMEOUT => "I/O state timeout",
        ERR_IO_STATE_OVERFLOW => "Output overflow",
        ERR_IO_STATE_LIMIT_NOT_DONE => "Output limit not done",
        ERR_IO_STATE_SFIFO_NOT_EMPTY => "Secondary FIFO not empty",
        ERR_WR_PARTIAL => "Partial write",
        ERR_RD_ZEROREAD => "Zero-length read",
        _ => "Other error",
    }
}
