// Contiguous First-Fit Allocator for the OS Emulator
//
// The arena is a single byte range. Free space is a list of `(offset, len)`
// blocks kept sorted by offset and fully coalesced: after every release no
// two free blocks touch. A request succeeds only if one block is large
// enough on its own, so external fragmentation is expected and is what
// eviction exists for.

use std::sync::Arc;

use spin::Mutex;

use super::residency::{Arena, Placement};
use super::{Admission, Eviction, MemoryAllocator, MemoryHandle, ResidentProcess};
use crate::process::pcb::{Process, ProcessId};

/// A free byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub offset: usize,
    pub len: usize,
}

impl FreeBlock {
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Sorted, coalesced free list
pub(crate) struct FreeList {
    blocks: Vec<FreeBlock>,
}

impl FreeList {
    fn new(capacity: usize) -> Self {
        Self {
            blocks: vec![FreeBlock {
                offset: 0,
                len: capacity,
            }],
        }
    }

    fn insert(&mut self, offset: usize, len: usize) {
        let index = self.blocks.partition_point(|block| block.offset < offset);
        self.blocks.insert(index, FreeBlock { offset, len });

        // Merge with the following block
        if index + 1 < self.blocks.len()
            && self.blocks[index].end() == self.blocks[index + 1].offset
        {
            self.blocks[index].len += self.blocks[index + 1].len;
            self.blocks.remove(index + 1);
        }
        // Merge with the preceding block
        if index > 0 && self.blocks[index - 1].end() == self.blocks[index].offset {
            self.blocks[index - 1].len += self.blocks[index].len;
            self.blocks.remove(index);
        }
    }
}

impl Placement for FreeList {
    fn place(&mut self, _pid: ProcessId, size: usize) -> Option<MemoryHandle> {
        if size == 0 {
            return Some(MemoryHandle::Block { offset: 0, len: 0 });
        }

        let index = self.blocks.iter().position(|block| block.len >= size)?;
        let FreeBlock { offset, len } = self.blocks[index];
        if len == size {
            self.blocks.remove(index);
        } else {
            self.blocks[index] = FreeBlock {
                offset: offset + size,
                len: len - size,
            };
        }
        Some(MemoryHandle::Block { offset, len: size })
    }

    fn reclaim(&mut self, handle: &MemoryHandle) {
        if let MemoryHandle::Block { offset, len } = *handle {
            if len > 0 {
                self.insert(offset, len);
            }
        }
    }

    fn free_space(&self) -> usize {
        self.blocks.iter().map(|block| block.len).sum()
    }

    fn reserved(&self, handle: &MemoryHandle) -> usize {
        match handle {
            MemoryHandle::Block { len, .. } => *len,
            MemoryHandle::Frames(_) => 0,
        }
    }
}

/// First-fit allocator over one contiguous arena
pub struct FlatAllocator {
    capacity: usize,
    arena: Mutex<Arena<FreeList>>,
}

impl FlatAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            arena: Mutex::new(Arena::new(FreeList::new(capacity))),
        }
    }

    /// Copy of the free list, in ascending offset order
    pub fn free_blocks(&self) -> Vec<FreeBlock> {
        self.arena.lock().placement.blocks.clone()
    }
}

impl MemoryAllocator for FlatAllocator {
    fn allocate(&self, process: &Arc<Process>) -> Option<MemoryHandle> {
        self.arena.lock().allocate(process)
    }

    fn release(&self, process: &Process) -> bool {
        self.arena.lock().release(process.pid()).is_some()
    }

    fn admit(&self, process: &Arc<Process>) -> Admission {
        self.arena.lock().admit(process)
    }

    fn evict_oldest(&self, requester: ProcessId) -> Eviction {
        self.arena.lock().evict_oldest(requester)
    }

    fn withdraw(&self, requester: ProcessId) {
        self.arena.lock().withdraw(requester)
    }

    fn waiting_count(&self) -> usize {
        self.arena.lock().waiting_count()
    }

    fn process_snapshot(&self) -> Vec<ResidentProcess> {
        self.arena.lock().snapshot()
    }

    fn total_capacity(&self) -> usize {
        self.capacity
    }

    fn free_space(&self) -> usize {
        self.arena.lock().placement.free_space()
    }

    fn fragmentation(&self) -> usize {
        self.free_space()
    }

    fn page_in_count(&self) -> usize {
        0
    }

    fn page_out_count(&self) -> usize {
        0
    }

    fn resident_count(&self) -> usize {
        self.arena.lock().resident_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::ProcessState;

    fn process(pid: ProcessId, size: usize) -> Arc<Process> {
        Arc::new(Process::with_print_program(pid, format!("p{}", pid), 0, 1, size))
    }

    fn assert_coalesced(allocator: &FlatAllocator) {
        let blocks = allocator.free_blocks();
        for pair in blocks.windows(2) {
            assert!(pair[0].end() < pair[1].offset, "touching blocks {:?}", pair);
        }
    }

    #[test]
    fn first_fit_splits_the_first_large_enough_block() {
        let allocator = FlatAllocator::new(1000);
        let a = process(1, 100);
        let b = process(2, 200);

        assert_eq!(
            allocator.allocate(&a),
            Some(MemoryHandle::Block { offset: 0, len: 100 })
        );
        assert_eq!(
            allocator.allocate(&b),
            Some(MemoryHandle::Block { offset: 100, len: 200 })
        );
        assert_eq!(
            allocator.free_blocks(),
            vec![FreeBlock { offset: 300, len: 700 }]
        );
        assert_eq!(a.memory_handle(), Some(MemoryHandle::Block { offset: 0, len: 100 }));
    }

    #[test]
    fn freed_hole_is_reused_first() {
        let allocator = FlatAllocator::new(1000);
        let a = process(1, 100);
        let b = process(2, 100);
        let c = process(3, 50);
        allocator.allocate(&a);
        allocator.allocate(&b);

        assert!(allocator.release(&a));
        assert_eq!(
            allocator.allocate(&c),
            Some(MemoryHandle::Block { offset: 0, len: 50 })
        );
        assert_coalesced(&allocator);
    }

    #[test]
    fn release_coalesces_both_neighbours() {
        let allocator = FlatAllocator::new(300);
        let a = process(1, 100);
        let b = process(2, 100);
        let c = process(3, 100);
        allocator.allocate(&a);
        allocator.allocate(&b);
        allocator.allocate(&c);
        assert_eq!(allocator.free_space(), 0);

        allocator.release(&a);
        allocator.release(&c);
        assert_eq!(allocator.free_blocks().len(), 2);
        assert_coalesced(&allocator);

        allocator.release(&b);
        assert_eq!(
            allocator.free_blocks(),
            vec![FreeBlock { offset: 0, len: 300 }]
        );
        assert!(!allocator.release(&b));
        assert_eq!(b.memory_handle(), None);
    }

    #[test]
    fn fails_without_a_single_large_block() {
        let allocator = FlatAllocator::new(300);
        let a = process(1, 100);
        let b = process(2, 100);
        let c = process(3, 100);
        allocator.allocate(&a);
        allocator.allocate(&b);
        allocator.allocate(&c);
        allocator.release(&a);
        allocator.release(&c);

        // 200 bytes free, but split in two
        assert_eq!(allocator.fragmentation(), 200);
        assert_eq!(allocator.allocate(&process(4, 150)), None);
    }

    #[test]
    fn capacity_is_conserved() {
        let allocator = FlatAllocator::new(4096);
        let processes: Vec<_> = (1..=8).map(|pid| process(pid, 100 * pid as usize)).collect();
        for p in &processes {
            allocator.allocate(p);
        }
        for p in processes.iter().step_by(3) {
            allocator.release(p);
        }

        let allocated: usize = allocator
            .process_snapshot()
            .iter()
            .map(|resident| resident.reserved)
            .sum();
        assert_eq!(allocator.free_space() + allocated, allocator.total_capacity());
        assert_coalesced(&allocator);
    }

    #[test]
    fn eviction_picks_the_oldest_idle_allocation() {
        let allocator = FlatAllocator::new(300);
        let a = process(1, 100);
        let b = process(2, 100);
        let c = process(3, 100);
        allocator.allocate(&a);
        allocator.allocate(&b);
        allocator.allocate(&c);
        a.set_state(ProcessState::Running);

        match allocator.evict_oldest(3) {
            Eviction::Evicted(victim) => assert_eq!(victim.pid(), 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(b.memory_handle(), None);
        assert_eq!(allocator.resident_count(), 2);

        // Only the running process and the requester are left
        assert!(matches!(allocator.evict_oldest(3), Eviction::Busy));
        a.set_state(ProcessState::Ready);
        assert!(matches!(allocator.evict_oldest(1), Eviction::Evicted(_)));
        assert!(matches!(allocator.evict_oldest(1), Eviction::Empty));
    }

    #[test]
    fn admit_marks_running_and_reuses_residency() {
        let allocator = FlatAllocator::new(200);
        let a = process(1, 150);

        assert!(matches!(allocator.admit(&a), Admission::Allocated(_)));
        assert_eq!(a.state(), ProcessState::Running);

        a.set_state(ProcessState::Ready);
        assert_eq!(allocator.admit(&a), Admission::Resident);
        assert_eq!(allocator.free_space(), 50);
        assert_eq!(allocator.waiting_count(), 0);
    }

    #[test]
    fn returning_resident_hands_memory_to_a_waiter() {
        let allocator = FlatAllocator::new(200);
        let a = process(1, 150);
        let b = process(2, 100);

        assert!(matches!(allocator.admit(&a), Admission::Allocated(_)));
        assert_eq!(allocator.admit(&b), Admission::NoSpace);
        assert_eq!(b.state(), ProcessState::Ready);
        assert_eq!(allocator.waiting_count(), 1);

        // `a` comes back after its turn while `b` is waiting
        a.set_state(ProcessState::Ready);
        assert_eq!(allocator.admit(&a), Admission::Yielded);
        assert_eq!(a.memory_handle(), None);
        assert_eq!(allocator.free_space(), 200);

        // `b` is first in line, so `a` can neither allocate nor evict
        assert_eq!(allocator.admit(&a), Admission::NoSpace);
        assert!(matches!(allocator.evict_oldest(a.pid()), Eviction::Busy));
        assert!(matches!(allocator.admit(&b), Admission::Allocated(_)));
        assert_eq!(allocator.waiting_count(), 1);

        b.set_state(ProcessState::Ready);
        assert_eq!(allocator.admit(&b), Admission::Yielded);
        assert!(matches!(allocator.admit(&a), Admission::Allocated(_)));
    }

    #[test]
    fn withdrawn_waiter_no_longer_blocks_the_line() {
        let allocator = FlatAllocator::new(200);
        let a = process(1, 150);
        let b = process(2, 100);
        let c = process(3, 50);

        allocator.admit(&a);
        assert_eq!(allocator.admit(&b), Admission::NoSpace);
        assert_eq!(allocator.admit(&c), Admission::NoSpace);

        allocator.withdraw(b.pid());
        assert!(matches!(allocator.admit(&c), Admission::Allocated(_)));
        a.set_state(ProcessState::Ready);
        assert_eq!(allocator.admit(&a), Admission::Resident);
    }
}
