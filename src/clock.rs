// Global Tick Source for the OS Emulator
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

/// Wall-clock interval between two ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Free-running tick generator shared by every worker.
///
/// The counter only ever grows. Waiters block on a condition variable that
/// is signalled on every increment and once more when the clock stops, so a
/// stopped clock never leaves a thread parked.
pub struct Clock {
    tick: AtomicU64,
    active_ticks: AtomicU64,
    running: AtomicBool,
    interval: Duration,
    gate: Mutex<()>,
    ticked: Condvar,
    thread: spin::Mutex<Option<JoinHandle<()>>>,
}

impl Clock {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_TICK_INTERVAL)
    }

    /// Create a clock that ticks every `interval`
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            tick: AtomicU64::new(0),
            active_ticks: AtomicU64::new(0),
            running: AtomicBool::new(false),
            interval,
            gate: Mutex::new(()),
            ticked: Condvar::new(),
            thread: spin::Mutex::new(None),
        }
    }

    /// Start the tick thread. Calling this on a running clock does nothing.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let clock = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("cpu-clock".into())
            .spawn(move || clock.run());
        match spawned {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        info!("CPU clock started ({:?} per tick)", self.interval);
        Ok(())
    }

    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(self.interval);
            {
                // Incremented under the gate so a waiter cannot miss it
                let _gate = self.lock_gate();
                self.tick.fetch_add(1, Ordering::SeqCst);
            }
            self.ticked.notify_all();
        }
    }

    /// Stop the tick thread and wait for it to exit. Every waiter is released.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        {
            let _gate = self.lock_gate();
            self.ticked.notify_all();
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        info!("CPU clock stopped at tick {}", self.current_tick());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current tick count
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Block until the counter is past `last_observed`.
    ///
    /// Returns the tick that was observed, or `None` once the clock is
    /// stopped (or was never started) and no newer tick is available.
    pub fn wait_for_next_tick(&self, last_observed: u64) -> Option<u64> {
        let mut gate = self.lock_gate();
        loop {
            let now = self.tick.load(Ordering::SeqCst);
            if now > last_observed {
                return Some(now);
            }
            if !self.running.load(Ordering::SeqCst) {
                debug!("clock stopped while waiting past tick {}", last_observed);
                return None;
            }
            gate = match self.ticked.wait(gate) {
                Ok(gate) => gate,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Record `count` ticks during which at least one core was busy
    pub fn record_active_ticks(&self, count: u64) {
        self.active_ticks.fetch_add(count, Ordering::Relaxed);
    }

    /// Ticks during which at least one core was busy
    pub fn active_tick_count(&self) -> u64 {
        self.active_ticks.load(Ordering::Relaxed)
    }

    /// Ticks during which every core was idle
    pub fn idle_tick_count(&self) -> u64 {
        self.current_tick().saturating_sub(self.active_tick_count())
    }

    fn lock_gate(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.gate.lock() {
            Ok(gate) => gate,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
