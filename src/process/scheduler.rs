// Process Scheduler for the OS Emulator
//
// One worker thread per core pulls processes from a shared FIFO, gets them
// memory (evicting the oldest idle allocation when the arena is full), and
// runs their instructions paced by the global clock. FCFS runs a process to
// completion on any idle core; RR runs at most one quantum on the worker's
// own core and puts the process back at the tail.
use core::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::Backoff;
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::clock::Clock;
use crate::config::{Config, SchedulingAlgorithm};
use crate::memory::{Admission, Eviction, MemoryAllocator};
use crate::process::cores::CoreRegistry;
use crate::process::pcb::{CoreId, Process, ProcessId, ProcessState};
use crate::process::queue::ReadyQueue;

/// Scheduler errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    NoCores,
    ZeroQuantum,
    AlreadyRunning,
    /// The process is already queued or on a core
    AlreadyScheduled(ProcessId),
    /// The process has no instructions left to run
    AlreadyFinished(ProcessId),
    /// The process can never fit in memory and is not scheduled
    ProcessTooLarge {
        pid: ProcessId,
        required: usize,
        capacity: usize,
    },
    /// A worker thread could not be created
    Spawn(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCores => write!(f, "scheduler needs at least one core"),
            Self::ZeroQuantum => write!(f, "round robin needs a quantum of at least one cycle"),
            Self::AlreadyRunning => write!(f, "scheduler already started"),
            Self::AlreadyScheduled(pid) => write!(f, "process {} is already scheduled", pid),
            Self::AlreadyFinished(pid) => write!(f, "process {} has already finished", pid),
            Self::ProcessTooLarge {
                pid,
                required,
                capacity,
            } => write!(
                f,
                "process {} needs {} bytes but memory holds only {}",
                pid, required, capacity
            ),
            Self::Spawn(reason) => write!(f, "failed to spawn scheduler thread: {}", reason),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Scheduler statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub algorithm: SchedulingAlgorithm,
    pub cores: usize,
    pub active_cores: usize,
    pub ready_len: usize,
    /// Times a process was put on a core
    pub dispatches: u64,
    /// RR quantum expiries that sent a process back to the queue
    pub preemptions: u64,
    pub finished: u64,
    pub evictions: u64,
}

/// Counter of workers currently holding a process. Never exceeds the core count.
struct ActiveCores {
    active: AtomicUsize,
    limit: usize,
}

impl ActiveCores {
    fn new(limit: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            limit,
        }
    }

    fn try_enter(&self) -> bool {
        let limit = self.limit;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < limit {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn get(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Counters {
    dispatches: AtomicU64,
    preemptions: AtomicU64,
    finished: AtomicU64,
    evictions: AtomicU64,
}

/// How a visit on a core ended
enum VisitEnd {
    Finished,
    QuantumExpired,
    Interrupted,
}

/// State shared between the scheduler handle and its threads
struct Shared {
    algorithm: SchedulingAlgorithm,
    core_count: usize,
    quantum: u64,
    delay_per_exec: u64,
    queue: ReadyQueue,
    clock: Arc<Clock>,
    cores: Arc<CoreRegistry>,
    memory: Arc<dyn MemoryAllocator>,
    running: AtomicBool,
    active: ActiveCores,
    counters: Counters,
}

/// Multi-core process scheduler
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        clock: Arc<Clock>,
        cores: Arc<CoreRegistry>,
        memory: Arc<dyn MemoryAllocator>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                algorithm: config.scheduler,
                core_count: config.num_cpu,
                quantum: config.quantum_cycles,
                delay_per_exec: config.delay_per_exec,
                queue: ReadyQueue::new(),
                clock,
                cores,
                memory,
                running: AtomicBool::new(false),
                active: ActiveCores::new(config.num_cpu),
                counters: Counters::default(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Queue a process for execution.
    ///
    /// A process that needs more memory than the whole arena is reported
    /// and never queued. A process is owned by the scheduler from here until
    /// it finishes, so submitting it again in between is refused.
    pub fn submit(&self, process: Arc<Process>) -> Result<(), SchedulerError> {
        if !process.has_remaining_instructions() {
            return Err(SchedulerError::AlreadyFinished(process.pid()));
        }
        let capacity = self.shared.memory.total_capacity();
        if process.memory_required() > capacity {
            error!(
                "process '{}' needs {} bytes, more than the {} available; not scheduled",
                process.name(),
                process.memory_required(),
                capacity
            );
            return Err(SchedulerError::ProcessTooLarge {
                pid: process.pid(),
                required: process.memory_required(),
                capacity,
            });
        }

        if !process.claim_scheduling() {
            warn!("process '{}' submitted twice, ignored", process.name());
            return Err(SchedulerError::AlreadyScheduled(process.pid()));
        }

        trace!("queued '{}' (pid {})", process.name(), process.pid());
        process.set_state(ProcessState::Ready);
        self.shared.queue.push(process);
        Ok(())
    }

    /// Spawn one worker per core plus the CPU monitor
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.shared.core_count == 0 {
            return Err(SchedulerError::NoCores);
        }
        if self.shared.algorithm == SchedulingAlgorithm::RoundRobin && self.shared.quantum == 0 {
            return Err(SchedulerError::ZeroQuantum);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.shared.queue.reopen();
        self.shared.cores.initialize(self.shared.core_count);

        let mut threads = self.threads.lock();
        for core in 1..=self.shared.core_count {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("core-{}", core))
                .spawn(move || shared.run_worker(core));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    drop(threads);
                    self.stop();
                    return Err(SchedulerError::Spawn(e.to_string()));
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("cpu-monitor".into())
            .spawn(move || shared.run_monitor())
        {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                drop(threads);
                self.stop();
                return Err(SchedulerError::Spawn(e.to_string()));
            }
        }

        info!(
            "scheduler started: {} on {} core(s), quantum {}, delay {}",
            self.shared.algorithm,
            self.shared.core_count,
            self.shared.quantum,
            self.shared.delay_per_exec
        );
        Ok(())
    }

    /// Signal shutdown, wake every waiter and join every thread.
    ///
    /// A process running at that moment is left as it is.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.shared.queue.close();

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
        if was_running && !self.shared.queue.is_empty() {
            info!(
                "scheduler stopped, {} process(es) still queued",
                self.shared.queue.len()
            );
        } else if was_running {
            info!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.shared.algorithm
    }

    pub fn core_count(&self) -> usize {
        self.shared.core_count
    }

    pub fn ready_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn finished_count(&self) -> u64 {
        self.shared.counters.finished.load(Ordering::SeqCst)
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.shared.clock
    }

    pub fn cores(&self) -> &Arc<CoreRegistry> {
        &self.shared.cores
    }

    pub fn memory(&self) -> &Arc<dyn MemoryAllocator> {
        &self.shared.memory
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.shared.counters;
        SchedulerStats {
            algorithm: self.shared.algorithm,
            cores: self.shared.core_count,
            active_cores: self.shared.active.get(),
            ready_len: self.shared.queue.len(),
            dispatches: counters.dispatches.load(Ordering::SeqCst),
            preemptions: counters.preemptions.load(Ordering::SeqCst),
            finished: counters.finished.load(Ordering::SeqCst),
            evictions: counters.evictions.load(Ordering::SeqCst),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn run_worker(&self, core: CoreId) {
        debug!("worker for core {} started", core);
        let quantum = match self.algorithm {
            SchedulingAlgorithm::FirstComeFirstServed => None,
            SchedulingAlgorithm::RoundRobin => Some(self.quantum),
        };
        while let Some(process) = self.queue.pop() {
            self.visit(core, process, quantum);
            if !self.clock.is_running() {
                warn!("clock stopped under a running scheduler, core {} idles", core);
                break;
            }
        }
        debug!("worker for core {} exiting", core);
    }

    /// Accumulate ticks during which any core was busy
    fn run_monitor(&self) {
        let mut last = self.clock.current_tick();
        while self.is_running() {
            let tick = match self.clock.wait_for_next_tick(last) {
                Some(tick) => tick,
                None => break,
            };
            if self.cores.any_busy() {
                self.clock.record_active_ticks(tick - last);
            }
            last = tick;
        }
    }

    /// Pick the core for a process that already holds memory.
    ///
    /// FCFS takes the first idle core, so any worker may serve any core. RR
    /// workers serve their own core.
    fn claim_core(&self, own_core: CoreId, process: &Process) -> Option<CoreId> {
        match self.algorithm {
            SchedulingAlgorithm::FirstComeFirstServed => {
                self.cores.claim_first_idle(process.name())
            }
            SchedulingAlgorithm::RoundRobin => {
                self.cores.occupy(own_core, process.name());
                Some(own_core)
            }
        }
    }

    fn visit(&self, own_core: CoreId, process: Arc<Process>, quantum: Option<u64>) {
        if !self.active.try_enter() {
            error!(
                "active workers would exceed {} cores, '{}' not admitted",
                self.core_count,
                process.name()
            );
            self.queue.push(process);
            return;
        }

        if !self.acquire_memory(&process) {
            // Shutting down, or the clock stopped, while waiting for memory
            self.memory.withdraw(process.pid());
            self.active.leave();
            self.queue.push(process);
            return;
        }

        let core = match self.claim_core(own_core, &process) {
            Some(core) => core,
            None => {
                trace!("no idle core for '{}', requeueing", process.name());
                process.set_state(ProcessState::Ready);
                self.active.leave();
                self.queue.push(process);
                self.clock.wait_for_next_tick(self.clock.current_tick());
                return;
            }
        };

        process.set_core_id(Some(core));
        self.counters.dispatches.fetch_add(1, Ordering::SeqCst);
        trace!("core {}: running '{}'", core, process.name());

        match self.execute(&process, quantum) {
            VisitEnd::Finished => {
                self.memory.release(&process);
                process.set_core_id(None);
                process.set_state(ProcessState::Finished);
                process.release_scheduling();
                self.counters.finished.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "core {}: '{}' finished {} instruction(s)",
                    core,
                    process.name(),
                    process.instruction_count()
                );
                self.cores.vacate(core);
            }
            VisitEnd::QuantumExpired => {
                // Memory is kept across requeues
                process.set_state(ProcessState::Ready);
                process.set_core_id(None);
                self.counters.preemptions.fetch_add(1, Ordering::SeqCst);
                trace!(
                    "core {}: '{}' preempted, {} instruction(s) left",
                    core,
                    process.name(),
                    process.remaining_instructions()
                );
                self.cores.vacate(core);
                self.queue.push(process);
            }
            VisitEnd::Interrupted => {
                trace!("core {}: '{}' left as is on shutdown", core, process.name());
                self.cores.vacate(core);
            }
        }
        self.active.leave();
    }

    /// Get memory for `process` and mark it RUNNING, evicting as needed.
    ///
    /// Returns `false` if the scheduler or the clock stops while waiting.
    fn acquire_memory(&self, process: &Arc<Process>) -> bool {
        let backoff = Backoff::new();
        loop {
            match self.memory.admit(process) {
                Admission::Resident => return true,
                Admission::Allocated(handle) => {
                    trace!("'{}' allocated {:?}", process.name(), handle);
                    return true;
                }
                Admission::Yielded => {
                    self.counters.evictions.fetch_add(1, Ordering::SeqCst);
                }
                Admission::NoSpace => {}
            }
            if !self.is_running() {
                return false;
            }

            match self.memory.evict_oldest(process.pid()) {
                Eviction::Evicted(victim) => {
                    self.counters.evictions.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "evicted '{}' to make room for '{}'",
                        victim.name(),
                        process.name()
                    );
                    backoff.reset();
                }
                Eviction::Busy | Eviction::Empty => {
                    // Wait for a running process to leave RUNNING or free memory
                    if !backoff.is_completed() {
                        backoff.snooze();
                    } else if self
                        .clock
                        .wait_for_next_tick(self.clock.current_tick())
                        .is_none()
                    {
                        return false;
                    }
                }
            }
        }
    }

    /// Run instructions until the program ends, the quantum is used up or
    /// the scheduler stops.
    fn execute(&self, process: &Process, quantum: Option<u64>) -> VisitEnd {
        let mut last = self.clock.current_tick();
        let mut executed = 0u64;

        while process.has_remaining_instructions() {
            if quantum.map_or(false, |quantum| executed >= quantum) {
                return VisitEnd::QuantumExpired;
            }

            // The first instruction of a visit runs on the next tick
            let target = if executed == 0 {
                last
            } else {
                last + self.delay_per_exec
            };
            let tick = match self.clock.wait_for_next_tick(target) {
                Some(tick) => tick,
                None => {
                    warn!("clock stopped under running process '{}'", process.name());
                    return VisitEnd::Interrupted;
                }
            };
            if !self.is_running() {
                return VisitEnd::Interrupted;
            }

            process.execute_next(tick);
            executed += 1;
            last = tick;
        }
        VisitEnd::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatAllocator;

    fn scheduler(algorithm: SchedulingAlgorithm, cores: usize) -> Scheduler {
        let config = Config {
            num_cpu: cores,
            scheduler: algorithm,
            quantum_cycles: 2,
            max_overall_mem: 1024,
            mem_per_frame: 1024,
            min_mem_per_proc: 64,
            max_mem_per_proc: 1024,
            ..Config::default()
        };
        Scheduler::new(
            &config,
            Arc::new(Clock::new()),
            Arc::new(CoreRegistry::default()),
            Arc::new(FlatAllocator::new(config.max_overall_mem)),
        )
    }

    #[test]
    fn active_cores_never_exceed_the_limit() {
        let active = ActiveCores::new(2);
        assert!(active.try_enter());
        assert!(active.try_enter());
        assert!(!active.try_enter());
        active.leave();
        assert!(active.try_enter());
        assert_eq!(active.get(), 2);
    }

    #[test]
    fn oversized_process_is_rejected() {
        let scheduler = scheduler(SchedulingAlgorithm::FirstComeFirstServed, 1);
        let process = Arc::new(Process::with_print_program(1, "huge", 0, 1, 4096));
        assert_eq!(
            scheduler.submit(process),
            Err(SchedulerError::ProcessTooLarge {
                pid: 1,
                required: 4096,
                capacity: 1024
            })
        );
        assert_eq!(scheduler.ready_len(), 0);
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
        while std::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn queued_process_cannot_be_submitted_again() {
        let scheduler = scheduler(SchedulingAlgorithm::FirstComeFirstServed, 1);
        let process = Arc::new(Process::with_print_program(1, "once", 0, 2, 64));
        assert_eq!(scheduler.submit(Arc::clone(&process)), Ok(()));
        assert_eq!(
            scheduler.submit(Arc::clone(&process)),
            Err(SchedulerError::AlreadyScheduled(1))
        );
        assert_eq!(scheduler.ready_len(), 1);
        assert!(process.is_scheduled());
    }

    #[test]
    fn workers_go_idle_when_the_clock_stops_under_a_memory_wait() {
        let scheduler = scheduler(SchedulingAlgorithm::FirstComeFirstServed, 2);
        let holder = Arc::new(Process::with_print_program(1, "holder", 0, 100_000, 1024));
        let waiter = Arc::new(Process::with_print_program(2, "waiter", 0, 5, 1024));
        scheduler.submit(Arc::clone(&holder)).unwrap();
        scheduler.clock().start().unwrap();
        scheduler.start().unwrap();
        assert!(wait_until(|| holder.command_counter() > 0));
        scheduler.submit(Arc::clone(&waiter)).unwrap();
        assert!(wait_until(|| scheduler.memory().waiting_count() == 1));

        scheduler.clock().stop();
        assert!(wait_until(|| scheduler.stats().active_cores == 0));
        assert_eq!(scheduler.memory().waiting_count(), 0);
        assert_eq!(waiter.command_counter(), 0);
        assert_eq!(scheduler.ready_len(), 1);
        scheduler.stop();
    }

    #[test]
    fn start_rejects_zero_cores_and_double_start() {
        let none = scheduler(SchedulingAlgorithm::RoundRobin, 0);
        assert_eq!(none.start(), Err(SchedulerError::NoCores));

        let one = scheduler(SchedulingAlgorithm::RoundRobin, 1);
        one.clock().start().unwrap();
        assert_eq!(one.start(), Ok(()));
        assert_eq!(one.start(), Err(SchedulerError::AlreadyRunning));
        one.stop();
        assert!(!one.is_running());
        one.clock().stop();
    }

    #[test]
    fn stop_without_work_returns_promptly() {
        let scheduler = scheduler(SchedulingAlgorithm::FirstComeFirstServed, 3);
        scheduler.clock().start().unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.cores().core_count(), 3);
        scheduler.stop();
        scheduler.clock().stop();
        assert_eq!(scheduler.stats().dispatches, 0);
    }
}
