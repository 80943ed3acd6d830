// Resident-set bookkeeping shared by both allocators
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};

use super::{Admission, Eviction, MemoryHandle, ResidentProcess};
use crate::process::pcb::{Process, ProcessId, ProcessState};

/// Raw free-space management of one allocator
pub(crate) trait Placement: Send {
    /// Reserve room for `size` bytes
    fn place(&mut self, pid: ProcessId, size: usize) -> Option<MemoryHandle>;

    /// Give back everything described by `handle`
    fn reclaim(&mut self, handle: &MemoryHandle);

    fn free_space(&self) -> usize;

    /// Bytes a handle actually occupies
    fn reserved(&self, handle: &MemoryHandle) -> usize;
}

struct Resident {
    process: Arc<Process>,
    handle: MemoryHandle,
    stamp: u64,
}

/// Free space, the set of processes holding memory and the processes
/// waiting for some.
///
/// Waiters are served in the order they first failed to get memory. Only the
/// head of the line may allocate fresh memory or evict, and a resident
/// process coming back for another turn hands its memory over while anyone
/// else is waiting. Kept behind a single lock by the owning allocator.
pub(crate) struct Arena<P> {
    pub(crate) placement: P,
    residents: BTreeMap<ProcessId, Resident>,
    next_stamp: u64,
    waiters: VecDeque<ProcessId>,
}

impl<P: Placement> Arena<P> {
    pub(crate) fn new(placement: P) -> Self {
        Self {
            placement,
            residents: BTreeMap::new(),
            next_stamp: 1,
            waiters: VecDeque::new(),
        }
    }

    pub(crate) fn is_resident(&self, pid: ProcessId) -> bool {
        self.residents.contains_key(&pid)
    }

    pub(crate) fn allocate(&mut self, process: &Arc<Process>) -> Option<MemoryHandle> {
        if let Some(resident) = self.residents.get(&process.pid()) {
            return Some(resident.handle.clone());
        }

        let handle = self
            .placement
            .place(process.pid(), process.memory_required())?;
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        process.set_memory_handle(Some(handle.clone()));
        process.set_alloc_stamp(stamp);
        self.residents.insert(
            process.pid(),
            Resident {
                process: Arc::clone(process),
                handle: handle.clone(),
                stamp,
            },
        );
        trace!(
            "allocated {} bytes for '{}' (stamp {})",
            process.memory_required(),
            process.name(),
            stamp
        );
        Some(handle)
    }

    pub(crate) fn release(&mut self, pid: ProcessId) -> Option<Arc<Process>> {
        let resident = self.residents.remove(&pid)?;
        self.placement.reclaim(&resident.handle);
        resident.process.set_memory_handle(None);
        trace!("released memory of '{}'", resident.process.name());
        Some(resident.process)
    }

    pub(crate) fn admit(&mut self, process: &Arc<Process>) -> Admission {
        let pid = process.pid();
        if self.is_resident(pid) {
            if self.waiters.iter().any(|&waiter| waiter != pid) {
                self.release(pid);
                self.enlist(pid);
                debug!(
                    "'{}' handed its memory to {} waiting process(es)",
                    process.name(),
                    self.waiters.len() - 1
                );
                return Admission::Yielded;
            }
            process.set_state(ProcessState::Running);
            return Admission::Resident;
        }

        if !self.is_first_in_line(pid) {
            self.enlist(pid);
            return Admission::NoSpace;
        }
        match self.allocate(process) {
            Some(handle) => {
                self.withdraw(pid);
                process.set_state(ProcessState::Running);
                Admission::Allocated(handle)
            }
            None => {
                self.enlist(pid);
                Admission::NoSpace
            }
        }
    }

    /// Stop waiting for memory
    pub(crate) fn withdraw(&mut self, pid: ProcessId) {
        self.waiters.retain(|&waiter| waiter != pid);
    }

    pub(crate) fn waiting_count(&self) -> usize {
        self.waiters.len()
    }

    fn enlist(&mut self, pid: ProcessId) {
        if !self.waiters.contains(&pid) {
            self.waiters.push_back(pid);
        }
    }

    fn is_first_in_line(&self, pid: ProcessId) -> bool {
        self.waiters.front().map_or(true, |&head| head == pid)
    }

    pub(crate) fn evict_oldest(&mut self, requester: ProcessId) -> Eviction {
        if !self.is_first_in_line(requester) {
            return Eviction::Busy;
        }

        let mut saw_running = false;
        let mut victim: Option<(u64, ProcessId)> = None;

        for (pid, resident) in &self.residents {
            if *pid == requester {
                continue;
            }
            if resident.process.state() == ProcessState::Running {
                saw_running = true;
                continue;
            }
            if victim.map_or(true, |(stamp, _)| resident.stamp < stamp) {
                victim = Some((resident.stamp, *pid));
            }
        }

        match victim {
            Some((stamp, pid)) => match self.release(pid) {
                Some(process) => {
                    debug!(
                        "evicted '{}' (pid {}, stamp {}) for pid {}",
                        process.name(),
                        pid,
                        stamp,
                        requester
                    );
                    Eviction::Evicted(process)
                }
                None => Eviction::Empty,
            },
            None if saw_running => Eviction::Busy,
            None => Eviction::Empty,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<ResidentProcess> {
        let mut residents: Vec<ResidentProcess> = self
            .residents
            .values()
            .map(|resident| ResidentProcess {
                pid: resident.process.pid(),
                name: resident.process.name().to_string(),
                size: resident.process.memory_required(),
                reserved: self.placement.reserved(&resident.handle),
                stamp: resident.stamp,
                handle: resident.handle.clone(),
            })
            .collect();
        residents.sort_by_key(|resident| resident.stamp);
        residents
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.residents.len()
    }
}
