// Memory Management for the OS Emulator
//
// Two allocators share one interface: a contiguous first-fit arena and a
// frame-based pager. The scheduler picks one at startup from the config and
// never switches afterwards.
use std::sync::Arc;

use crate::config::{AllocatorKind, Config};
use crate::process::pcb::{Process, ProcessId};

pub mod flat;
pub mod paging;
mod residency;

pub use flat::FlatAllocator;
pub use paging::PagingAllocator;

/// Opaque reference to the memory a process holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryHandle {
    /// Byte range `offset..offset + len` of the flat arena
    Block { offset: usize, len: usize },
    /// Frame ids held in the paged arena, in no particular order
    Frames(Vec<usize>),
}

/// Result of trying to get a process onto a core memory-wise
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The process already held memory; it is now RUNNING
    Resident,
    /// Fresh memory was allocated; the process is now RUNNING
    Allocated(MemoryHandle),
    /// Not enough memory, or others are first in line; the process state is
    /// unchanged and it now waits its turn
    NoSpace,
    /// The process held memory but gave it up to a process waiting before
    /// it; it now waits its turn
    Yielded,
}

/// Outcome of one eviction attempt
#[derive(Debug, Clone)]
pub enum Eviction {
    /// The memory of this process was reclaimed
    Evicted(Arc<Process>),
    /// Every candidate is RUNNING; try again once one leaves
    Busy,
    /// Nothing besides the requester holds memory
    Empty,
}

/// A process holding memory, as seen by the allocator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentProcess {
    pub pid: ProcessId,
    pub name: String,
    /// Bytes the process asked for
    pub size: usize,
    /// Bytes actually reserved (frame rounding included)
    pub reserved: usize,
    pub stamp: u64,
    pub handle: MemoryHandle,
}

/// Memory allocator interface.
///
/// Every method runs under the allocator's own lock. `admit` and
/// `evict_oldest` share that lock so a process cannot be evicted between
/// being given memory and being marked RUNNING.
pub trait MemoryAllocator: Send + Sync {
    /// Allocate memory for `process` and record the handle on it
    fn allocate(&self, process: &Arc<Process>) -> Option<MemoryHandle>;

    /// Return all memory held by `process`. Returns `false` if it held none.
    fn release(&self, process: &Process) -> bool;

    /// Make sure `process` holds memory and mark it RUNNING
    fn admit(&self, process: &Arc<Process>) -> Admission;

    /// Reclaim the memory of the oldest allocation that is not `requester`
    /// and not RUNNING. A requester behind another waiter gets `Busy`.
    fn evict_oldest(&self, requester: ProcessId) -> Eviction;

    /// Drop `requester` from the line of processes waiting for memory
    fn withdraw(&self, requester: ProcessId);

    /// Processes currently waiting for memory
    fn waiting_count(&self) -> usize;

    /// Every process currently holding memory, oldest allocation first
    fn process_snapshot(&self) -> Vec<ResidentProcess>;

    fn total_capacity(&self) -> usize;

    fn free_space(&self) -> usize;

    /// Free memory as the allocator measures fragmentation
    fn fragmentation(&self) -> usize;

    fn page_in_count(&self) -> usize;

    fn page_out_count(&self) -> usize;

    fn used_space(&self) -> usize {
        self.total_capacity() - self.free_space()
    }

    fn resident_count(&self) -> usize {
        self.process_snapshot().len()
    }
}

/// Build the allocator a configuration selects
pub fn build_allocator(config: &Config) -> Arc<dyn MemoryAllocator> {
    match config.allocator_kind() {
        AllocatorKind::Flat => Arc::new(FlatAllocator::new(config.max_overall_mem)),
        AllocatorKind::Paging { frame_size } => {
            Arc::new(PagingAllocator::new(config.max_overall_mem, frame_size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_selects_the_allocator() {
        let flat = build_allocator(&Config::default());
        assert_eq!(flat.total_capacity(), 16384);
        assert_eq!(flat.page_in_count(), 0);

        let paged = build_allocator(&Config {
            max_overall_mem: 1024,
            mem_per_frame: 256,
            min_mem_per_proc: 256,
            max_mem_per_proc: 512,
            ..Config::default()
        });
        assert_eq!(paged.total_capacity(), 1024);

        let process = Arc::new(Process::with_print_program(1, "p", 0, 1, 300));
        assert_eq!(
            paged.allocate(&process).map(|h| matches!(h, MemoryHandle::Frames(_))),
            Some(true)
        );
        assert_eq!(paged.used_space(), 512);
    }
}
