//! Packet-mode integration points.
//!
//! The framing and queueing of packets is not done here. A chip in
//! application mode 2 moves opaque bytes between the bulk endpoints and a
//! [`PacketLink`], which owns the outbound and inbound buffers.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{OUTPUT_WORD_WIDTH, PKT_INPUT_CAPACITY, PKT_OUTPUT_CAPACITY};

// ── Error type ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The link is in an error state and accepts no more input.
    Fault(String),
    /// Inbound data not a whole number of transfer words.
    Misaligned { len: usize, word_width: usize },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Fault(e) => write!(f, "packet link fault: {e}"),
            PacketError::Misaligned { len, word_width } => {
                write!(f, "inbound length {len} is not a multiple of {word_width}")
            }
        }
    }
}

impl std::error::Error for PacketError {}

// ── Parameters ──

/// Sizing parameters handed to each packet link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketParams {
    /// Bytes per transfer word.
    pub word_width: usize,
    /// Largest outbound chunk the chip accepts in one write.
    pub input_capacity: usize,
    /// Largest inbound block the chip produces in one read.
    pub output_capacity: usize,
}

impl Default for PacketParams {
    fn default() -> Self {
        PacketParams {
            word_width: OUTPUT_WORD_WIDTH,
            input_capacity: PKT_INPUT_CAPACITY,
            output_capacity: PKT_OUTPUT_CAPACITY,
        }
    }
}

// ── Traits ──

/// Per-chip packet layer endpoint.
pub trait PacketLink {
    /// Next chunk to transmit, or `None` if nothing is pending.
    fn output_chunk(&mut self) -> Option<&[u8]>;

    /// The first `n` bytes of the last chunk were transmitted.
    fn output_completed(&mut self, n: usize);

    /// A writable region of at least `n` bytes for inbound data; only the
    /// first `n` are filled. `Ok(None)` means no space is available right now.
    fn input_buffer(&mut self, n: usize) -> Result<Option<&mut [u8]>, PacketError>;

    /// `n` bytes were written into the region from [`input_buffer`](Self::input_buffer).
    fn input_completed(&mut self, n: usize) -> Result<(), PacketError>;
}

/// Builds one link per chip.
pub trait PacketLinkFactory {
    fn create(&self, params: &PacketParams, chip: u8) -> Box<dyn PacketLink>;
}

impl<F> PacketLinkFactory for F
where
    F: Fn(&PacketParams, u8) -> Box<dyn PacketLink>,
{
    fn create(&self, params: &PacketParams, chip: u8) -> Box<dyn PacketLink> {
        self(params, chip)
    }
}

// ── Byte-stream link ──

/// Minimal link treating both directions as plain byte streams.
///
/// Outbound data queued with [`send`](Self::send) goes out in chunks of at
/// most `input_capacity`; inbound blocks accumulate until taken with
/// [`take_received`](Self::take_received).
pub struct StreamLink {
    params: PacketParams,
    outbound: VecDeque<u8>,
    chunk: Vec<u8>,
    scratch: Vec<u8>,
    received: Vec<u8>,
    fault: Option<String>,
}

impl StreamLink {
    pub fn new(params: PacketParams) -> Self {
        StreamLink {
            params,
            outbound: VecDeque::new(),
            chunk: Vec::new(),
            scratch: Vec::new(),
            received: Vec::new(),
            fault: None,
        }
    }

    pub fn send(&mut self, data: &[u8]) {
        self.outbound.extend(data);
    }

    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    pub fn pending_output(&self) -> usize {
        self.outbound.len() + self.chunk.len()
    }
}

impl PacketLink for StreamLink {
    fn output_chunk(&mut self) -> Option<&[u8]> {
        if self.chunk.is_empty() {
            let n = self.outbound.len().min(self.params.input_capacity);
            self.chunk.extend(self.outbound.drain(..n));
        }
        if self.chunk.is_empty() {
            None
        } else {
            Some(&self.chunk)
        }
    }

    fn output_completed(&mut self, n: usize) {
        let n = n.min(self.chunk.len());
        self.chunk.drain(..n);
    }

    fn input_buffer(&mut self, n: usize) -> Result<Option<&mut [u8]>, PacketError> {
        if let Some(e) = &self.fault {
            return Err(PacketError::Fault(e.clone()));
        }
        self.scratch.resize(n, 0);
        Ok(Some(&mut self.scratch[..n]))
    }

    fn input_completed(&mut self, n: usize) -> Result<(), PacketError> {
        if n % self.params.word_width != 0 {
            let e = PacketError::Misaligned {
                len: n,
                word_width: self.params.word_width,
            };
            self.fault = Some(e.to_string());
            return Err(e);
        }
        self.received.extend_from_slice(&self.scratch[..n.min(self.scratch.len())]);
        Ok(())
    }
}

/// Factory producing a [`StreamLink`] per chip.
pub struct StreamLinkFactory;

impl PacketLinkFactory for StreamLinkFactory {
    fn create(&self, params: &PacketParams, _chip: u8) -> Box<dyn PacketLink> {
        Box::new(StreamLink::new(*params))
    }
}

// ── Mock link for testing ──

/// Scripted links whose activity is observable after they are moved into a chip.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    pub struct LinkLog {
        /// Chunks handed out by `output_chunk`, front first.
        pub pending_out: VecDeque<Vec<u8>>,
        pub output_completed: Vec<usize>,
        pub input_requests: Vec<usize>,
        pub input_completed: Vec<usize>,
        pub received: Vec<u8>,
        /// `input_buffer` fails.
        pub fail_input: bool,
        /// `input_buffer` reports no space.
        pub no_space: bool,
        /// Size of the region `input_buffer` hands out instead of the
        /// requested length.
        pub buffer_len: Option<usize>,
        /// Set when the link is dropped (detached from its chip).
        pub detached: bool,
    }

    pub struct MockLink {
        pub log: Rc<RefCell<LinkLog>>,
        current: Vec<u8>,
        scratch: Vec<u8>,
    }

    impl MockLink {
        pub fn new() -> (Self, Rc<RefCell<LinkLog>>) {
            let log = Rc::new(RefCell::new(LinkLog::default()));
            (
                MockLink {
                    log: Rc::clone(&log),
                    current: Vec::new(),
                    scratch: Vec::new(),
                },
                log,
            )
        }
    }

    impl Drop for MockLink {
        fn drop(&mut self) {
            self.log.borrow_mut().detached = true;
        }
    }

    impl PacketLink for MockLink {
        fn output_chunk(&mut self) -> Option<&[u8]> {
            if self.current.is_empty() {
                self.current = self.log.borrow_mut().pending_out.pop_front()?;
            }
            Some(&self.current)
        }

        fn output_completed(&mut self, n: usize) {
            self.log.borrow_mut().output_completed.push(n);
            self.current.clear();
        }

        fn input_buffer(&mut self, n: usize) -> Result<Option<&mut [u8]>, PacketError> {
            let mut log = self.log.borrow_mut();
            log.input_requests.push(n);
            if log.fail_input {
                return Err(PacketError::Fault("mock: input failure".into()));
            }
            if log.no_space {
                return Ok(None);
            }
            self.scratch.resize(log.buffer_len.unwrap_or(n), 0);
            Ok(Some(&mut self.scratch[..]))
        }

        fn input_completed(&mut self, n: usize) -> Result<(), PacketError> {
            let mut log = self.log.borrow_mut();
            log.input_completed.push(n);
            log.received.extend_from_slice(&self.scratch[..n.min(self.scratch.len())]);
            Ok(())
        }
    }

    /// Factory handing out [`MockLink`]s and keeping their logs by chip index.
    #[derive(Default)]
    pub struct MockLinkFactory {
        pub logs: RefCell<Vec<(u8, Rc<RefCell<LinkLog>>)>>,
    }

    impl PacketLinkFactory for MockLinkFactory {
        fn create(&self, _params: &PacketParams, chip: u8) -> Box<dyn PacketLink> {
            let (link, log) = MockLink::new();
            self.logs.borrow_mut().push((chip, log));
            Box::new(link)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params() {
        let p = PacketParams::default();
        assert_eq!(p.word_width, 2);
        assert_eq!(p.input_capacity, 16384);
        assert_eq!(p.output_capacity, 32766);
    }

    #[test]
    fn stream_link_chunks_by_input_capacity() {
        let params = PacketParams {
            input_capacity: 4,
            ..Default::default()
        };
        let mut link = StreamLink::new(params);
        assert!(link.output_chunk().is_none());

        link.send(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(link.output_chunk(), Some(&[1u8, 2, 3, 4][..]));
        link.output_completed(4);
        assert_eq!(link.output_chunk(), Some(&[5u8, 6][..]));
        link.output_completed(2);
        assert!(link.output_chunk().is_none());
        assert_eq!(link.pending_output(), 0);
    }

    #[test]
    fn stream_link_keeps_unsent_tail() {
        let mut link = StreamLink::new(PacketParams::default());
        link.send(&[9, 8, 7]);
        link.output_chunk();
        link.output_completed(1);
        assert_eq!(link.output_chunk(), Some(&[8u8, 7][..]));
    }

    #[test]
    fn stream_link_accumulates_input() {
        let mut link = StreamLink::new(PacketParams::default());
        let buf = link.input_buffer(4).unwrap().unwrap();
        buf.copy_from_slice(&[1, 2, 3, 4]);
        link.input_completed(4).unwrap();
        assert_eq!(link.take_received(), vec![1, 2, 3, 4]);
        assert!(link.take_received().is_empty());
    }

    #[test]
    fn stream_link_misaligned_input_faults() {
        let mut link = StreamLink::new(PacketParams::default());
        link.input_buffer(3).unwrap();
        let err = link.input_completed(3).unwrap_err();
        assert_eq!(
            err,
            PacketError::Misaligned {
                len: 3,
                word_width: 2
            }
        );
        // Faulted link refuses further input.
        assert!(matches!(link.input_buffer(2), Err(PacketError::Fault(_))));
    }

    #[test]
    fn closure_factory() {
        let factory = |p: &PacketParams, _chip: u8| -> Box<dyn PacketLink> {
            Box::new(StreamLink::new(*p))
        };
        let mut link = factory.create(&PacketParams::default(), 0);
        assert!(link.output_chunk().is_none());
    }

    #[test]
    fn mock_link_records_detach() {
        let (link, log) = mock::MockLink::new();
        assert!(!log.borrow().detached);
        drop(link);
        assert!(log.borrow().detached);
    }
}
