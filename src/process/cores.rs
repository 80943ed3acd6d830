// Per-core occupancy table for the OS Emulator
use log::error;
use spin::Mutex;

use crate::process::pcb::CoreId;

/// State of one emulated core
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreSlot {
    pub busy: bool,
    /// Name of the process on the core, empty when idle
    pub occupant: String,
}

/// Which core runs what.
///
/// Written by the worker that owns a core, read by anyone. One lock guards
/// the whole table and every hold is O(1) (apart from the copy made by
/// `snapshot`).
#[derive(Debug, Default)]
pub struct CoreRegistry {
    slots: Mutex<Vec<CoreSlot>>,
}

impl CoreRegistry {
    pub fn new(core_count: usize) -> Self {
        let registry = Self::default();
        registry.initialize(core_count);
        registry
    }

    /// Reset the table to `core_count` idle cores (ids `1..=core_count`)
    pub fn initialize(&self, core_count: usize) {
        let mut slots = self.slots.lock();
        slots.clear();
        slots.resize(core_count, CoreSlot::default());
    }

    pub fn core_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Set one entry. An out-of-range id is reported and ignored.
    pub fn set_state(&self, core: CoreId, busy: bool, occupant: &str) {
        let mut slots = self.slots.lock();
        let count = slots.len();
        match slot_index(core, count).and_then(|index| slots.get_mut(index)) {
            Some(slot) => {
                slot.busy = busy;
                slot.occupant.clear();
                if busy {
                    slot.occupant.push_str(occupant);
                }
            }
            None => error!("core id {} outside 1..={}, state not updated", core, count),
        }
    }

    /// Mark a core busy with `occupant`
    pub fn occupy(&self, core: CoreId, occupant: &str) {
        self.set_state(core, true, occupant);
    }

    /// Mark a core idle
    pub fn vacate(&self, core: CoreId) {
        self.set_state(core, false, "");
    }

    pub fn get_state(&self, core: CoreId) -> Option<CoreSlot> {
        let slots = self.slots.lock();
        slot_index(core, slots.len()).map(|index| slots[index].clone())
    }

    /// Consistent copy of every slot, index 0 is core 1
    pub fn snapshot(&self) -> Vec<CoreSlot> {
        self.slots.lock().clone()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.busy).count()
    }

    pub fn any_busy(&self) -> bool {
        self.slots.lock().iter().any(|slot| slot.busy)
    }

    /// Find the lowest idle core and mark it busy in one step
    pub fn claim_first_idle(&self, occupant: &str) -> Option<CoreId> {
        let mut slots = self.slots.lock();
        let index = slots.iter().position(|slot| !slot.busy)?;
        let slot = &mut slots[index];
        slot.busy = true;
        slot.occupant.clear();
        slot.occupant.push_str(occupant);
        Some(index + 1)
    }
}

fn slot_index(core: CoreId, count: usize) -> Option<usize> {
    if core >= 1 && core <= count {
        Some(core - 1)
    } else {
        None
    }
}
