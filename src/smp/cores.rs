//! Per-core records, shared by the boot core and every core it starts.
//!
//! Slot 0 is always the boot core. Slots above it are claimed one at a time
//! while a core is being started; a slot only counts once its core has come
//! online, and a slot whose core never answered is reused by the next
//! candidate.

use crate::config::MAX_CORES;
use crate::sync::Locked;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRecord {
    pub index: usize,
    pub apic_id: u8,
    pub online: bool,
    /// Top of the stack handed to the core, 0 for the boot core.
    pub kernel_stack: u64,
}

impl CoreRecord {
    const fn empty(index: usize) -> Self {
        Self {
            index,
            apic_id: 0,
            online: false,
            kernel_stack: 0,
        }
    }
}

struct Slots {
    records: [CoreRecord; MAX_CORES],
    /// Slots below this index belong to cores that came online.
    committed: usize,
    /// Claimed for a core that has not been committed or abandoned yet.
    pending: [bool; MAX_CORES],
}

pub struct CoreTable {
    slots: Locked<Slots>,
}

impl CoreTable {
    pub const fn new() -> Self {
        let mut records = [CoreRecord::empty(0); MAX_CORES];
        let mut index = 0;
        while index < MAX_CORES {
            records[index].index = index;
            index += 1;
        }
        Self {
            slots: Locked::new(Slots {
                records,
                committed: 0,
                pending: [false; MAX_CORES],
            }),
        }
    }

    /// Record the boot core in slot 0, online.
    pub fn register_boot_core(&self, apic_id: u8) {
        let mut slots = self.slots.lock();
        slots.records[0] = CoreRecord {
            index: 0,
            apic_id,
            online: true,
            kernel_stack: 0,
        };
        slots.committed = 1;
    }

    /// Index the next [`claim_next`](Self::claim_next) will hand out.
    pub fn next_free(&self) -> Option<usize> {
        let committed = self.slots.lock().committed;
        (committed < MAX_CORES).then_some(committed)
    }

    /// Reserve the next free slot for a core about to be started.
    pub fn claim_next(&self, apic_id: u8, kernel_stack: u64) -> Option<usize> {
        let mut slots = self.slots.lock();
        let index = slots.committed;
        if index >= MAX_CORES {
            return None;
        }
        slots.records[index] = CoreRecord {
            index,
            apic_id,
            online: false,
            kernel_stack,
        };
        slots.pending[index] = true;
        Some(index)
    }

    /// Called by a started core. Ignored unless the slot still belongs to it.
    pub fn mark_online(&self, index: usize, apic_id: u8) -> bool {
        let mut slots = self.slots.lock();
        let claimed = index >= slots.committed && slots.pending.get(index) == Some(&true);
        match slots.records.get_mut(index) {
            Some(record) if claimed && record.apic_id == apic_id => {
                record.online = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, index: usize) -> bool {
        self.slots
            .lock()
            .records
            .get(index)
            .is_some_and(|record| record.online)
    }

    /// Count a claimed slot whose core reported online.
    pub fn commit(&self, index: usize) -> bool {
        let mut slots = self.slots.lock();
        if index != slots.committed || index >= MAX_CORES || !slots.records[index].online {
            return false;
        }
        slots.pending[index] = false;
        slots.committed += 1;
        true
    }

    /// Forget a claimed slot whose core never answered.
    pub fn abandon(&self, index: usize) {
        let mut slots = self.slots.lock();
        if index >= slots.committed && index < MAX_CORES {
            slots.records[index] = CoreRecord::empty(index);
            slots.pending[index] = false;
        }
    }

    pub fn online_count(&self) -> usize {
        let slots = self.slots.lock();
        slots.records[..slots.committed]
            .iter()
            .filter(|record| record.online)
            .count()
    }

    /// Snapshot of a record; `None` at or beyond capacity.
    pub fn record(&self, index: usize) -> Option<CoreRecord> {
        self.slots.lock().records.get(index).copied()
    }

    /// Logical index of the committed core with `apic_id`.
    pub fn index_of(&self, apic_id: u8) -> Option<usize> {
        let slots = self.slots.lock();
        slots.records[..slots.committed]
            .iter()
            .find(|record| record.apic_id == apic_id)
            .map(|record| record.index)
    }
}

impl Default for CoreTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_core_is_slot_zero() {
        let table = CoreTable::new();
        table.register_boot_core(4);

        let boot = table.record(0).unwrap();
        assert_eq!(boot.apic_id, 4);
        assert!(boot.online);
        assert_eq!(table.online_count(), 1);
        assert_eq!(table.index_of(4), Some(0));
    }

    #[test]
    fn started_core_is_counted_after_commit() {
        let table = CoreTable::new();
        table.register_boot_core(0);

        let slot = table.claim_next(1, 0x1000).unwrap();
        assert_eq!(slot, 1);
        assert!(!table.commit(slot));
        assert!(table.mark_online(slot, 1));
        assert_eq!(table.online_count(), 1);
        assert!(table.commit(slot));
        assert_eq!(table.online_count(), 2);
        assert_eq!(table.record(1).unwrap().kernel_stack, 0x1000);
    }

    #[test]
    fn abandoned_slot_is_reused() {
        let table = CoreTable::new();
        table.register_boot_core(0);

        let first = table.claim_next(1, 0).unwrap();
        table.abandon(first);
        let second = table.claim_next(2, 0).unwrap();
        assert_eq!(first, second);

        // the silent core waking up late must not steal the slot
        assert!(!table.mark_online(second, 1));
        assert!(table.mark_online(second, 2));
    }

    #[test]
    fn abandoned_slot_rejects_late_core() {
        let table = CoreTable::new();
        table.register_boot_core(2);

        let slot = table.claim_next(0, 0x1000).unwrap();
        table.abandon(slot);

        // the emptied record also carries id 0
        assert!(!table.mark_online(slot, 0));
        assert!(!table.record(slot).unwrap().online);
        assert!(!table.is_online(slot));
        assert_eq!(table.online_count(), 1);
    }

    #[test]
    fn unclaimed_slot_rejects_online() {
        let table = CoreTable::new();
        table.register_boot_core(3);
        assert!(!table.mark_online(1, 0));
        assert!(!table.record(1).unwrap().online);
    }

    #[test]
    fn committed_records_cannot_be_remarked() {
        let table = CoreTable::new();
        table.register_boot_core(0);
        assert!(!table.mark_online(0, 0));
    }

    #[test]
    fn capacity_is_bounded() {
        let table = CoreTable::new();
        table.register_boot_core(0);
        for id in 1..MAX_CORES as u8 {
            let slot = table.claim_next(id, 0).unwrap();
            table.mark_online(slot, id);
            assert!(table.commit(slot));
        }
        assert_eq!(table.claim_next(99, 0), None);
        assert_eq!(table.online_count(), MAX_CORES);
        assert!(table.record(MAX_CORES).is_none());
        assert_eq!(table.record(MAX_CORES - 1).unwrap().index, MAX_CORES - 1);
    }
}
