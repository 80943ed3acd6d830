// Process Control Block for the OS Emulator
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::memory::MemoryHandle;
use crate::process::scheduler::SchedulerError;

/// Process ID type
pub type ProcessId = u64;

/// Core IDs start at 1
pub type CoreId = usize;

const NO_CORE: usize = 0;
const NEVER_ALLOCATED: u64 = 0;

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    Ready = 0,   // Queued, waiting for a core
    Running = 1, // Owned by a worker, executing instructions
    Waiting = 2, // Reserved for blocking instructions
    Finished = 3,
}

impl ProcessState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            _ => Self::Finished,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// One step of a process program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Write one line to the process log
    Print { message: String },
}

impl Instruction {
    /// Run the instruction, returning the log line it produces (if any)
    fn execute(&self) -> Option<String> {
        match self {
            Self::Print { message } => Some(message.clone()),
        }
    }
}

/// A line written by a `Print` instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub tick: u64,
    pub core: CoreId,
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(tick {}) Core:{} \"{}\"", self.tick, self.core, self.text)
    }
}

/// Process Control Block.
///
/// Identity and program are fixed at creation. Scheduling fields are atomics
/// so reporting threads can read them while the owning worker mutates them.
#[derive(Debug)]
pub struct Process {
    pid: ProcessId,
    name: String,
    created_at: u64,
    program: Vec<Instruction>,
    memory_required: usize,
    state: AtomicU8,
    command_counter: AtomicUsize,
    core_id: AtomicUsize,
    alloc_stamp: AtomicU64,
    scheduled: AtomicBool,
    memory: Mutex<Option<MemoryHandle>>,
    log: Mutex<Vec<LogLine>>,
}

impl Process {
    pub fn new(
        pid: ProcessId,
        name: impl Into<String>,
        created_at: u64,
        program: Vec<Instruction>,
        memory_required: usize,
    ) -> Self {
        Self {
            pid,
            name: name.into(),
            created_at,
            program,
            memory_required,
            state: AtomicU8::new(ProcessState::Ready as u8),
            command_counter: AtomicUsize::new(0),
            core_id: AtomicUsize::new(NO_CORE),
            alloc_stamp: AtomicU64::new(NEVER_ALLOCATED),
            scheduled: AtomicBool::new(false),
            memory: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    /// A process whose program prints `count` greetings
    pub fn with_print_program(
        pid: ProcessId,
        name: impl Into<String>,
        created_at: u64,
        count: usize,
        memory_required: usize,
    ) -> Self {
        let name = name.into();
        let program = (0..count)
            .map(|_| Instruction::Print {
                message: format!("Hello world from {}!", name),
            })
            .collect();
        Self::new(pid, name, created_at, program, memory_required)
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clock tick at which the process was created
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn instruction_count(&self) -> usize {
        self.program.len()
    }

    /// Index of the next instruction to execute
    pub fn command_counter(&self) -> usize {
        self.command_counter.load(Ordering::SeqCst)
    }

    pub fn remaining_instructions(&self) -> usize {
        self.instruction_count() - self.command_counter()
    }

    pub fn has_remaining_instructions(&self) -> bool {
        self.command_counter() < self.instruction_count()
    }

    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Owned by a scheduler: queued or on a core
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Take ownership for a scheduler. Fails if one already holds it.
    pub(crate) fn claim_scheduling(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release_scheduling(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
    }

    /// Core currently assigned, if any
    pub fn core_id(&self) -> Option<CoreId> {
        match self.core_id.load(Ordering::SeqCst) {
            NO_CORE => None,
            core => Some(core),
        }
    }

    pub fn set_core_id(&self, core: Option<CoreId>) {
        self.core_id.store(core.unwrap_or(NO_CORE), Ordering::SeqCst);
    }

    /// Bytes of memory the process needs to run
    pub fn memory_required(&self) -> usize {
        self.memory_required
    }

    pub fn memory_handle(&self) -> Option<MemoryHandle> {
        self.memory.lock().clone()
    }

    pub fn set_memory_handle(&self, handle: Option<MemoryHandle>) {
        *self.memory.lock() = handle;
    }

    pub fn has_memory(&self) -> bool {
        self.memory.lock().is_some()
    }

    /// Stamp of the most recent successful allocation
    pub fn alloc_stamp(&self) -> Option<u64> {
        match self.alloc_stamp.load(Ordering::SeqCst) {
            NEVER_ALLOCATED => None,
            stamp => Some(stamp),
        }
    }

    pub fn set_alloc_stamp(&self, stamp: u64) {
        self.alloc_stamp.store(stamp, Ordering::SeqCst);
    }

    /// Execute the instruction at the program counter.
    ///
    /// Returns `false` when the program is already complete.
    pub fn execute_next(&self, tick: u64) -> bool {
        let index = self.command_counter();
        let instruction = match self.program.get(index) {
            Some(instruction) => instruction,
            None => return false,
        };

        if let Some(text) = instruction.execute() {
            let core = self.core_id().unwrap_or(NO_CORE);
            self.log.lock().push(LogLine { tick, core, text });
        }
        self.command_counter.store(index + 1, Ordering::SeqCst);
        true
    }

    /// Copy of every line printed so far
    pub fn log(&self) -> Vec<LogLine> {
        self.log.lock().clone()
    }

    /// Read-only view for reporting
    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            pid: self.pid,
            name: self.name.clone(),
            created_at: self.created_at,
            state: self.state(),
            command_counter: self.command_counter(),
            instruction_count: self.instruction_count(),
            core_id: self.core_id(),
            memory_required: self.memory_required,
            memory_handle: self.memory_handle(),
        }
    }
}

/// Point-in-time copy of a process's externally visible fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: ProcessId,
    pub name: String,
    pub created_at: u64,
    pub state: ProcessState,
    pub command_counter: usize,
    pub instruction_count: usize,
    pub core_id: Option<CoreId>,
    pub memory_required: usize,
    pub memory_handle: Option<MemoryHandle>,
}

/// Process management errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    EmptyName,
    DuplicateName(String),
    ProcessNotFound(String),
    Rejected(SchedulerError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "process name must not be empty"),
            Self::DuplicateName(name) => write!(f, "process {:?} already exists", name),
            Self::ProcessNotFound(name) => write!(f, "no process named {:?}", name),
            Self::Rejected(e) => write!(f, "scheduler rejected process: {}", e),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<SchedulerError> for ProcessError {
    fn from(e: SchedulerError) -> Self {
        Self::Rejected(e)
    }
}
