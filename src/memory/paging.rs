// Frame-Based Allocator for the OS Emulator
//
// The arena is cut into `ceil(capacity / frame_size)` frames. A process gets
// `ceil(size / frame_size)` frames from a LIFO free list; they need not be
// contiguous, so there is no external fragmentation and nothing to coalesce.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::Mutex;

use super::residency::{Arena, Placement};
use super::{Admission, Eviction, MemoryAllocator, MemoryHandle, ResidentProcess};
use crate::process::pcb::{Process, ProcessId};

pub(crate) struct FramePool {
    frame_size: usize,
    free_frames: Vec<usize>,
    frame_owner: BTreeMap<usize, ProcessId>,
    paged_in: usize,
    paged_out: usize,
}

impl FramePool {
    fn new(frame_count: usize, frame_size: usize) -> Self {
        Self {
            frame_size,
            // Reversed so frames are handed out in ascending order at first
            free_frames: (0..frame_count).rev().collect(),
            frame_owner: BTreeMap::new(),
            paged_in: 0,
            paged_out: 0,
        }
    }
}

impl Placement for FramePool {
    fn place(&mut self, pid: ProcessId, size: usize) -> Option<MemoryHandle> {
        let needed = size.div_ceil(self.frame_size);
        if needed > self.free_frames.len() {
            return None;
        }

        let split = self.free_frames.len() - needed;
        let frames: Vec<usize> = self.free_frames.drain(split..).rev().collect();
        for &frame in &frames {
            self.frame_owner.insert(frame, pid);
        }
        self.paged_in += frames.len();
        Some(MemoryHandle::Frames(frames))
    }

    fn reclaim(&mut self, handle: &MemoryHandle) {
        if let MemoryHandle::Frames(frames) = handle {
            for &frame in frames {
                if self.frame_owner.remove(&frame).is_some() {
                    self.free_frames.push(frame);
                    self.paged_out += 1;
                }
            }
        }
    }

    fn free_space(&self) -> usize {
        self.free_frames.len() * self.frame_size
    }

    fn reserved(&self, handle: &MemoryHandle) -> usize {
        match handle {
            MemoryHandle::Frames(frames) => frames.len() * self.frame_size,
            MemoryHandle::Block { .. } => 0,
        }
    }
}

/// Allocator handing out fixed-size frames
pub struct PagingAllocator {
    frame_size: usize,
    frame_count: usize,
    arena: Mutex<Arena<FramePool>>,
}

impl PagingAllocator {
    /// `frame_size` must be non-zero
    pub fn new(capacity: usize, frame_size: usize) -> Self {
        let frame_count = capacity.div_ceil(frame_size);
        Self {
            frame_size,
            frame_count,
            arena: Mutex::new(Arena::new(FramePool::new(frame_count, frame_size))),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn free_frame_count(&self) -> usize {
        self.arena.lock().placement.free_frames.len()
    }

    /// Owner of every allocated frame
    pub fn frame_table(&self) -> BTreeMap<usize, ProcessId> {
        self.arena.lock().placement.frame_owner.clone()
    }
}

impl MemoryAllocator for PagingAllocator {
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

    /// Frame count times frame size
    fn total_capacity(&self) -> usize {
        self.frame_count * self.frame_size
    }

    fn free_space(&self) -> usize {
        self.arena.lock().placement.free_space()
    }

    fn fragmentation(&self) -> usize {
        self.free_space()
    }

    fn page_in_count(&self) -> usize {
        self.arena.lock().placement.paged_in
    }

    fn page_out_count(&self) -> usize {
        self.arena.lock().placement.paged_out
    }

    fn resident_count(&self) -> usize {
        self.arena.lock().resident_count()
    }
}
