//! inouttraffic: host-side transport for multi-FPGA USB accelerator boards.

pub mod bitstream;
pub mod chip;
pub mod config;
pub mod device;
pub mod device_list;
pub mod echo;
pub mod error;
pub mod packet;
pub mod protocol;
pub mod scan;
pub mod usb;

pub use error::TrafficError;
