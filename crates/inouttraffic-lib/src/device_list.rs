//! Device list and discovery records.
//!
//! A [`DeviceList`] owns claimed devices plus the [`UnitRecords`] they were
//! built from. Each record shares its validity flag with its device, so a
//! device invalidated anywhere shows up as an invalid record here too.

use std::cell::Cell;
use std::rc::Rc;

use log::{debug, warn};

use crate::device::Device;
use crate::packet::{PacketLinkFactory, PacketParams};
use crate::usb::{Transport, UsbUnit};

// ── Records ──

/// Discovery record of one board: serial plus a shared validity flag.
#[derive(Debug, Clone)]
pub struct UnitRecord {
    serial: String,
    valid: Rc<Cell<bool>>,
}

impl UnitRecord {
    pub fn new(serial: impl Into<String>) -> Self {
        UnitRecord {
            serial: serial.into(),
            valid: Rc::new(Cell::new(true)),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.set(valid);
    }

    /// Whether both records track the same claimed board, not merely the
    /// same serial.
    pub fn same_unit(&self, other: &UnitRecord) -> bool {
        Rc::ptr_eq(&self.valid, &other.valid)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnitRecords {
    records: Vec<UnitRecord>,
}

impl UnitRecords {
    pub fn push(&mut self, record: UnitRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitRecord> {
        self.records.iter()
    }

    /// Whether a valid record with `serial` exists.
    pub fn contains(&self, serial: &str) -> bool {
        self.records
            .iter()
            .any(|r| r.is_valid() && r.serial == serial)
    }

    /// Drop invalid records.
    pub fn retain_valid(&mut self) {
        self.records.retain(|r| r.is_valid());
    }

    /// Move valid records from `other`, discarding invalid ones.
    /// Returns the number moved.
    pub fn merge(&mut self, other: UnitRecords) -> usize {
        let before = self.records.len();
        self.records
            .extend(other.records.into_iter().filter(|r| r.is_valid()));
        self.records.len() - before
    }
}

// ── Device list ──

pub struct DeviceList<L: Transport> {
    devices: Vec<Device<L>>,
    records: UnitRecords,
}

impl<L: Transport> Default for DeviceList<L> {
    fn default() -> Self {
        DeviceList {
            devices: Vec::new(),
            records: UnitRecords::default(),
        }
    }
}

impl<L: Transport> DeviceList<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim every unit. Units that cannot be claimed keep an invalid record.
    pub fn from_units<U>(units: &[U]) -> Self
    where
        U: UsbUnit<Link = L>,
    {
        let mut list = Self::new();
        for unit in units {
            let record = UnitRecord::new(unit.serial());
            list.records.push(record.clone());
            if let Ok(device) = Device::create(unit, record) {
                list.add(device);
            }
        }
        list
    }

    /// Insert at the head of the list.
    pub fn add(&mut self, device: Device<L>) {
        self.devices.insert(0, device);
    }

    /// Move valid devices (and records) from `added`; tear down the rest.
    /// Returns the number of devices moved.
    pub fn merge(&mut self, added: DeviceList<L>) -> usize {
        let DeviceList { devices, records } = added;
        let mut count = 0;
        for device in devices {
            debug!(
                "merge: SN {}, valid {}",
                device.serial(),
                device.is_valid()
            );
            if !device.is_valid() {
                continue;
            }
            self.add(device);
            count += 1;
        }

        let record_count = self.records.merge(records);
        if record_count != count {
            warn!("merge: record count {record_count}, device count {count}");
        }
        count
    }

    /// Number of valid devices.
    pub fn count(&self) -> usize {
        self.devices.iter().filter(|d| d.is_valid()).count()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device<L>> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device<L>> {
        self.devices.iter_mut()
    }

    /// Valid devices only.
    pub fn valid_mut(&mut self) -> impl Iterator<Item = &mut Device<L>> {
        self.devices.iter_mut().filter(|d| d.is_valid())
    }

    pub fn records(&self) -> &UnitRecords {
        &self.records
    }

    /// Soft-reset all chips of every valid device. Failing devices are
    /// invalidated. Returns the number reset.
    pub fn reset_all(&mut self) -> usize {
        let mut count = 0;
        for device in self.valid_mut() {
            match device.reset_all_chips() {
                Ok(()) => count += 1,
                Err(e) => {
                    warn!("SN {}: FPGA reset failed: {e}", device.serial());
                    device.invalidate();
                }
            }
        }
        count
    }

    /// Attach packet links on every valid device. Returns the number initialized.
    pub fn init_chips(&mut self, factory: &dyn PacketLinkFactory, params: &PacketParams) -> usize {
        self.valid_mut()
            .map(|d| d.init_chips(factory, params))
            .filter(|r| r.is_ok())
            .count()
    }

    /// Set application mode on every valid device. Returns the number set.
    pub fn set_app_mode(&mut self, mode: u16) -> usize {
        self.valid_mut()
            .map(|d| d.set_app_mode(mode))
            .filter(|r| r.is_ok())
            .count()
    }

    /// Drop invalidated devices and their records.
    pub fn prune(&mut self) {
        self.devices.retain(|d| d.is_valid());
        self.records.retain_valid();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;
    use crate::usb::mock::*;

    #[test]
    fn record_clones_share_validity() {
        let a = UnitRecord::new("SN1");
        let b = a.clone();
        b.set_valid(false);
        assert!(!a.is_valid());
    }

    #[test]
    fn records_contains_only_valid() {
        let mut records = UnitRecords::default();
        let r = UnitRecord::new("SN1");
        records.push(r.clone());
        assert!(records.contains("SN1"));
        r.set_valid(false);
        assert!(!records.contains("SN1"));
    }

    #[test]
    fn from_units_inserts_at_head() {
        let units = vec![MockUnit::new("A", 1), MockUnit::new("B", 1)];
        let list = DeviceList::from_units(&units);
        let serials: Vec<&str> = list.iter().map(|d| d.serial()).collect();
        assert_eq!(serials, vec!["B", "A"]);
        assert_eq!(list.count(), 2);
        assert_eq!(list.records().len(), 2);
    }

    #[test]
    fn from_units_skips_unclaimable() {
        let units = vec![MockUnit::new("A", 1), MockUnit::new("B", 1)];
        units[0].fail_claim.set(true);
        let list = DeviceList::from_units(&units);
        assert_eq!(list.count(), 1);
        assert!(!list.records().contains("A"));
        assert!(list.records().contains("B"));
    }

    #[test]
    fn merge_moves_valid_and_tears_down_invalid() {
        let base_units = vec![MockUnit::new("A", 1)];
        let mut list = DeviceList::from_units(&base_units);

        let new_units = vec![
            MockUnit::new("X", 1),
            MockUnit::new("Y", 1),
            MockUnit::new("Z", 1),
        ];
        let mut added = DeviceList::from_units(&new_units);
        added.iter_mut().find(|d| d.serial() == "Y").unwrap().invalidate();

        assert_eq!(list.merge(added), 2);
        assert_eq!(list.count(), 3);
        assert_eq!(list.len(), 3);
        assert!(list.records().contains("X"));
        assert!(!list.records().contains("Y"));
        assert!(list.records().contains("Z"));
        assert_eq!(new_units[1].state.releases.get(), 1);
    }

    #[test]
    fn reset_all_invalidates_failures_only() {
        let units = vec![MockUnit::new("A", 2), MockUnit::new("B", 2)];
        units[0]
            .state
            .fail_commands
            .borrow_mut()
            .insert(VC_RESET, USB_ERROR_IO);
        let mut list = DeviceList::from_units(&units);
        assert_eq!(list.reset_all(), 1);
        assert_eq!(list.count(), 1);
        assert!(list.records().contains("B"));
    }

    #[test]
    fn set_app_mode_counts_devices() {
        let units = vec![MockUnit::new("A", 1), MockUnit::new("B", 1)];
        let mut list = DeviceList::from_units(&units);
        assert_eq!(list.set_app_mode(APP_MODE_ECHO), 2);
        assert_eq!(units[0].state.command_count(VC_SET_APP_MODE), 1);
    }

    #[test]
    fn same_unit_tells_reconnects_apart() {
        let a = UnitRecord::new("SN1");
        assert!(a.same_unit(&a.clone()));
        assert!(!a.same_unit(&UnitRecord::new("SN1")));
    }

    #[test]
    fn merge_into_empty_list_keeps_two_of_three() {
        let mut list: DeviceList<MockTransport> = DeviceList::new();
        let units = vec![
            MockUnit::new("X", 1),
            MockUnit::new("Y", 1),
            MockUnit::new("Z", 1),
        ];
        let mut added = DeviceList::from_units(&units);
        added.iter_mut().find(|d| d.serial() == "Z").unwrap().invalidate();

        assert_eq!(list.merge(added), 2);
        assert_eq!(list.count(), 2);
        assert_eq!(list.len(), 2);
        assert_eq!(list.records().len(), 2);
    }

    #[test]
    fn prune_drops_invalid() {
        let units = vec![MockUnit::new("A", 1), MockUnit::new("B", 1)];
        let mut list = DeviceList::from_units(&units);
        list.iter_mut().next().unwrap().invalidate();
        list.prune();
        assert_eq!(list.len(), 1);
        assert_eq!(list.records().len(), 1);
    }

    #[test]
    fn reconnecting_board_does_not_grow_records() {
        let first = vec![MockUnit::new("SN1", 1)];
        let mut list = DeviceList::from_units(&first);
        for _ in 0..5 {
            list.iter_mut().next().unwrap().invalidate();
            list.prune();
            assert!(!list.records().contains("SN1"));

            let again = vec![MockUnit::new("SN1", 1)];
            assert_eq!(list.merge(DeviceList::from_units(&again)), 1);
            assert_eq!(list.count(), 1);
            assert_eq!(list.records().len(), 1);
        }
    }
}
