// Ready queue for the OS Emulator
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crossbeam_queue::SegQueue;

use crate::process::pcb::Process;

/// FIFO of processes waiting for a core.
///
/// The queue itself is lock-free. Idle workers park on `available`; pushes
/// notify while holding `gate`, so a worker that found the queue empty is
/// always parked before the notification arrives.
pub struct ReadyQueue {
    queue: SegQueue<Arc<Process>>,
    gate: Mutex<()>,
    available: Condvar,
    closed: AtomicBool,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            gate: Mutex::new(()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Append to the tail and wake one worker
    pub fn push(&self, process: Arc<Process>) {
        self.queue.push(process);
        let _gate = self.lock_gate();
        self.available.notify_one();
    }

    /// Block until a process is available or the queue is closed
    pub fn pop(&self) -> Option<Arc<Process>> {
        let mut gate = self.lock_gate();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(process) = self.queue.pop() {
                return Some(process);
            }
            gate = match self.available.wait(gate) {
                Ok(gate) => gate,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Wake every waiter; `pop` returns `None` from now on
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _gate = self.lock_gate();
        self.available.notify_all();
    }

    /// Accept waiters again after a `close`
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        match self.gate.lock() {
            Ok(gate) => gate,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn process(pid: u64) -> Arc<Process> {
        Arc::new(Process::with_print_program(pid, format!("p{}", pid), 0, 1, 0))
    }

    #[test]
    fn preserves_arrival_order() {
        let queue = ReadyQueue::new();
        for pid in 1..=4 {
            queue.push(process(pid));
        }
        assert_eq!(queue.len(), 4);
        let order: Vec<u64> = (0..4).map(|_| queue.pop().unwrap().pid()).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_blocks_until_push() {
        let queue = Arc::new(ReadyQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop().map(|p| p.pid()))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(process(7));
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn close_wakes_every_waiter() {
        let queue = Arc::new(ReadyQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop().is_none())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.close();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert!(queue.is_closed());
    }
}
