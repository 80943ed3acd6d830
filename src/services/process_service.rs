// Process Management Service for the OS Emulator
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use rand::Rng;
use spin::Mutex;

use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::process::pcb::{Instruction, Process, ProcessError, ProcessId, ProcessSnapshot};
use crate::process::scheduler::Scheduler;

/// Name prefix of processes created by the batch generator
pub const BATCH_PREFIX: &str = "process_";

/// Process Management Service - creates processes, names them and hands them
/// to the scheduler
pub struct ProcessManager {
    scheduler: Arc<Scheduler>,
    processes: Mutex<BTreeMap<String, Arc<Process>>>,
    next_pid: AtomicU64,
    instructions: (usize, usize),
    memory: (usize, usize),
    batch_frequency: u64,
    batch: BatchGenerator,
}

/// Background thread submitting a new process every few ticks
struct BatchGenerator {
    running: AtomicBool,
    next_index: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessManager {
    pub fn new(config: &Config, scheduler: Arc<Scheduler>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            scheduler,
            processes: Mutex::new(BTreeMap::new()),
            next_pid: AtomicU64::new(1),
            instructions: (config.min_ins, config.max_ins),
            memory: (config.min_mem_per_proc, config.max_mem_per_proc),
            batch_frequency: config.batch_process_freq,
            batch: BatchGenerator {
                running: AtomicBool::new(false),
                next_index: AtomicU64::new(1),
                thread: Mutex::new(None),
            },
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    fn clock(&self) -> &Arc<Clock> {
        self.scheduler.clock()
    }

    /// Create a process with a generated program and submit it
    pub fn create_process(&self, name: &str) -> Result<Arc<Process>, ProcessError> {
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(self.instructions.0..=self.instructions.1);
        let memory = generate_memory_size(&mut rng, self.memory.0, self.memory.1);
        let program = (0..count)
            .map(|_| Instruction::Print {
                message: format!("Hello world from {}!", name),
            })
            .collect();
        self.create_with_program(name, program, memory)
    }

    /// Create a process running `program` and submit it.
    ///
    /// A process the scheduler refuses is not kept.
    pub fn create_with_program(
        &self,
        name: &str,
        program: Vec<Instruction>,
        memory_required: usize,
    ) -> Result<Arc<Process>, ProcessError> {
        if name.trim().is_empty() {
            return Err(ProcessError::EmptyName);
        }

        let process = {
            let mut processes = self.processes.lock();
            if processes.contains_key(name) {
                return Err(ProcessError::DuplicateName(name.to_string()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            let process = Arc::new(Process::new(
                pid,
                name,
                self.clock().current_tick(),
                program,
                memory_required,
            ));
            processes.insert(name.to_string(), Arc::clone(&process));
            process
        };

        if let Err(e) = self.scheduler.submit(Arc::clone(&process)) {
            self.processes.lock().remove(name);
            return Err(e.into());
        }

        debug!(
            "created '{}' (pid {}, {} instructions, {} bytes)",
            name,
            process.pid(),
            process.instruction_count(),
            memory_required
        );
        Ok(process)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Process>> {
        self.processes.lock().get(name).cloned()
    }

    /// Like `lookup`, but a missing name is an error
    pub fn get(&self, name: &str) -> Result<Arc<Process>, ProcessError> {
        self.lookup(name)
            .ok_or_else(|| ProcessError::ProcessNotFound(name.to_string()))
    }

    pub fn find_by_pid(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes
            .lock()
            .values()
            .find(|process| process.pid() == pid)
            .cloned()
    }

    /// Snapshot of every process, in PID order
    pub fn snapshot_all(&self) -> Vec<ProcessSnapshot> {
        let processes: Vec<Arc<Process>> = self.processes.lock().values().cloned().collect();
        let mut snapshots: Vec<ProcessSnapshot> =
            processes.iter().map(|process| process.snapshot()).collect();
        snapshots.sort_by_key(|snapshot| snapshot.pid);
        snapshots
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Start generating `process_<n>` every `batch_process_freq` ticks.
    /// Does nothing if the generator is already running.
    pub fn start_batch(self: &Arc<Self>) -> io::Result<()> {
        if self.batch.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("batch-generator".into())
            .spawn(move || manager.run_batch());
        match spawned {
            Ok(handle) => *self.batch.thread.lock() = Some(handle),
            Err(e) => {
                self.batch.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        info!("batch generation started, one process every {} tick(s)", self.batch_frequency);
        Ok(())
    }

    /// Stop the generator and wait for it to exit
    pub fn stop_batch(&self) {
        if !self.batch.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.batch.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("batch generator panicked");
            }
        }
        info!("batch generation stopped");
    }

    pub fn is_batch_running(&self) -> bool {
        self.batch.running.load(Ordering::SeqCst)
    }

    fn run_batch(&self) {
        let mut last = self.clock().current_tick();
        while self.batch.running.load(Ordering::SeqCst) {
            let tick = match self.clock().wait_for_next_tick(last + self.batch_frequency - 1) {
                Some(tick) => tick,
                None => {
                    warn!("clock stopped, batch generation ends");
                    break;
                }
            };
            if !self.batch.running.load(Ordering::SeqCst) {
                break;
            }
            last = tick;
            self.create_batch_process();
        }
        self.batch.running.store(false, Ordering::SeqCst);
    }

    fn create_batch_process(&self) {
        loop {
            let index = self.batch.next_index.fetch_add(1, Ordering::SeqCst);
            let name = format!("{}{}", BATCH_PREFIX, index);
            match self.create_process(&name) {
                Ok(_) => return,
                // Taken by a user-created process; try the next index
                Err(ProcessError::DuplicateName(_)) => continue,
                Err(e) => {
                    warn!("batch process '{}' not created: {}", name, e);
                    return;
                }
            }
        }
    }
}

/// Uniform in `min..=max`, rounded up to a power of two, clamped to the range
fn generate_memory_size<R: Rng>(rng: &mut R, min: usize, max: usize) -> usize {
    let raw = rng.gen_range(min..=max);
    raw.checked_next_power_of_two().unwrap_or(max).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulingAlgorithm;
    use crate::memory::build_allocator;
    use crate::process::cores::CoreRegistry;
    use crate::process::pcb::ProcessState;
    use crate::process::scheduler::SchedulerError;
    use std::time::{Duration, Instant};

    fn config() -> Config {
        Config {
            num_cpu: 2,
            scheduler: SchedulingAlgorithm::FirstComeFirstServed,
            min_ins: 3,
            max_ins: 7,
            max_overall_mem: 1024,
            mem_per_frame: 256,
            min_mem_per_proc: 64,
            max_mem_per_proc: 512,
            ..Config::default()
        }
    }

    fn manager(config: &Config) -> Arc<ProcessManager> {
        let scheduler = Arc::new(Scheduler::new(
            config,
            Arc::new(Clock::new()),
            Arc::new(CoreRegistry::default()),
            build_allocator(config),
        ));
        Arc::new(ProcessManager::new(config, scheduler).unwrap())
    }

    #[test]
    fn pids_increase_and_names_are_unique() {
        let manager = manager(&config());
        let a = manager.create_process("alpha").unwrap();
        let b = manager.create_process("beta").unwrap();
        assert_eq!(a.pid(), 1);
        assert_eq!(b.pid(), 2);
        assert_eq!(
            manager.create_process("alpha").map(|p| p.pid()),
            Err(ProcessError::DuplicateName("alpha".into()))
        );
        assert_eq!(
            manager.create_process("  ").map(|p| p.pid()),
            Err(ProcessError::EmptyName)
        );
        assert_eq!(manager.process_count(), 2);
        assert_eq!(manager.scheduler().ready_len(), 2);
    }

    #[test]
    fn generated_processes_respect_the_configured_ranges() {
        let manager = manager(&config());
        for i in 0..50 {
            let process = manager.create_process(&format!("gen{}", i)).unwrap();
            assert!((3..=7).contains(&process.instruction_count()));
            let memory = process.memory_required();
            assert!((64..=512).contains(&memory));
            assert!(memory.is_power_of_two());
            assert_eq!(process.state(), ProcessState::Ready);
        }
    }

    #[test]
    fn memory_size_is_clamped() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let size = generate_memory_size(&mut rng, 100, 300);
            assert!(size == 128 || size == 256 || size == 300, "got {}", size);
        }
        assert_eq!(generate_memory_size(&mut rng, 4096, 4096), 4096);
    }

    #[test]
    fn lookup_and_snapshots() {
        let manager = manager(&config());
        manager.create_process("one").unwrap();
        manager.create_process("two").unwrap();

        assert_eq!(manager.lookup("two").map(|p| p.pid()), Some(2));
        assert_eq!(manager.find_by_pid(1).map(|p| p.name().to_string()), Some("one".into()));
        assert_eq!(
            manager.get("three").map(|p| p.pid()),
            Err(ProcessError::ProcessNotFound("three".into()))
        );

        let names: Vec<String> = manager.snapshot_all().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn oversized_process_is_not_kept() {
        let manager = manager(&config());
        let result = manager.create_with_program("big", Vec::new(), 2048);
        assert_eq!(
            result.map(|p| p.pid()),
            Err(ProcessError::Rejected(SchedulerError::ProcessTooLarge {
                pid: 1,
                required: 2048,
                capacity: 1024
            }))
        );
        assert!(manager.lookup("big").is_none());
        assert_eq!(manager.scheduler().ready_len(), 0);
    }

    #[test]
    fn batch_generator_creates_processes_until_stopped() {
        let manager = manager(&config());
        manager.create_process("process_2").unwrap();
        manager.scheduler().clock().start().unwrap();
        manager.start_batch().unwrap();
        assert!(manager.is_batch_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.process_count() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        manager.stop_batch();
        assert!(!manager.is_batch_running());
        let count = manager.process_count();
        assert!(count >= 4);

        // The user-created name is skipped, not overwritten
        assert!(manager.lookup("process_1").is_some());
        assert_eq!(manager.lookup("process_2").map(|p| p.pid()), Some(1));
        assert!(manager.lookup("process_3").is_some());

        thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.process_count(), count);
        manager.scheduler().clock().stop();
    }
}
