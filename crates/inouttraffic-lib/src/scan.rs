//! Discovery front end: initial scan, rate-limited timely scans.
//!
//! A timely scan only returns boards whose serial is not already known, so
//! the resulting list can be merged into the running one with
//! [`DeviceList::merge`].

use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;

use crate::bitstream::{BitstreamDescriptor, initialize};
use crate::device_list::{DeviceList, UnitRecords};
use crate::error::Result;
use crate::packet::PacketLinkFactory;
use crate::usb::{self, PlatformUnit, Timeouts, UsbUnit, enumerate_units};

/// Source of boards.
pub trait Discovery {
    type Unit: UsbUnit;

    /// Every board currently attached.
    fn initial_scan(&mut self) -> usb::Result<Vec<Self::Unit>>;

    /// Boards not among `known`. May return nothing if called too often.
    fn timely_scan(&mut self, known: &UnitRecords) -> usb::Result<Vec<Self::Unit>>;
}

// ── Throttle ──

/// Limits timely scans to one per interval.
#[derive(Debug)]
pub struct ScanThrottle {
    interval: Duration,
    last_scan: Option<Instant>,
    scans: u32,
}

impl ScanThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_scan: None,
            scans: 0,
        }
    }

    /// `true` if no scan happened yet or the interval has elapsed.
    pub fn should_scan(&self) -> bool {
        match self.last_scan {
            None => true,
            Some(last) => last.elapsed() >= self.interval,
        }
    }

    pub fn record_scan(&mut self) {
        self.scans += 1;
        self.last_scan = Some(Instant::now());
    }

    /// Number of scans performed.
    pub fn scans(&self) -> u32 {
        self.scans
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ── USB discovery ──

pub struct UsbDiscovery {
    timeouts: Timeouts,
    chips_per_device: usize,
    throttle: ScanThrottle,
}

impl UsbDiscovery {
    pub fn new(timeouts: Timeouts, chips_per_device: usize, scan_interval: Duration) -> Self {
        UsbDiscovery {
            timeouts,
            chips_per_device,
            throttle: ScanThrottle::new(scan_interval),
        }
    }
}

impl Discovery for UsbDiscovery {
    type Unit = PlatformUnit;

    fn initial_scan(&mut self) -> usb::Result<Vec<PlatformUnit>> {
        self.throttle.record_scan();
        enumerate_units(self.timeouts, self.chips_per_device)
    }

    fn timely_scan(&mut self, known: &UnitRecords) -> usb::Result<Vec<PlatformUnit>> {
        if !self.throttle.should_scan() {
            return Ok(Vec::new());
        }
        self.throttle.record_scan();
        let units = enumerate_units(self.timeouts, self.chips_per_device)?;
        Ok(units
            .into_iter()
            .filter(|u| !known.contains(u.serial()))
            .collect())
    }
}

// ── Scan + initialize ──

type LinkOf<D> = <<D as Discovery>::Unit as UsbUnit>::Link;

/// Discover all boards and bring them up.
pub fn init_scan<D: Discovery>(
    discovery: &mut D,
    desc: &BitstreamDescriptor,
    factory: &dyn PacketLinkFactory,
    rng: &mut impl Rng,
) -> Result<DeviceList<LinkOf<D>>> {
    let units = discovery.initial_scan()?;
    let mut list = DeviceList::from_units(&units);
    let live = initialize(&mut list, desc, factory, rng)?;
    info!("{live} device(s) ready");
    Ok(list)
}

/// Discover and bring up boards not yet in `current`.
///
/// The returned list is meant to be merged into `current`.
pub fn timely_scan<D: Discovery>(
    discovery: &mut D,
    current: &DeviceList<LinkOf<D>>,
    desc: &BitstreamDescriptor,
    factory: &dyn PacketLinkFactory,
    rng: &mut impl Rng,
) -> Result<DeviceList<LinkOf<D>>> {
    let units = discovery.timely_scan(current.records())?;
    if units.is_empty() {
        return Ok(DeviceList::new());
    }
    debug!("timely scan: {} new board(s)", units.len());
    let mut list = DeviceList::from_units(&units);
    let live = initialize(&mut list, desc, factory, rng)?;
    if live > 0 {
        info!("found {live} new device(s)");
    }
    Ok(list)
}

// ── Mock discovery for testing ──

#[doc(hidden)]
pub mod mock {
    use super::*;
    use crate::usb::mock::MockUnit;
    use std::collections::VecDeque;

    /// Hands out prepared units: `initial` once, then one batch of `later`
    /// per timely scan.
    #[derive(Default)]
    pub struct MockDiscovery {
        pub initial: Vec<MockUnit>,
        pub later: VecDeque<Vec<MockUnit>>,
    }

    impl Discovery for MockDiscovery {
        type Unit = MockUnit;

        fn initial_scan(&mut self) -> usb::Result<Vec<MockUnit>> {
            Ok(std::mem::take(&mut self.initial))
        }

        fn timely_scan(&mut self, known: &UnitRecords) -> usb::Result<Vec<MockUnit>> {
            let batch = self.later.pop_front().unwrap_or_default();
            Ok(batch
                .into_iter()
                .filter(|u| !known.contains(u.serial()))
                .collect())
        }
    }
}
