// OS Emulator: multi-core CPU scheduling and memory management
//
// Services are constructed once by the caller and shared through `Arc`
// handles; nothing here is a global.
pub mod clock;
pub mod config;
pub mod memory;
pub mod process;
pub mod report;
pub mod services;

pub use clock::Clock;
pub use config::{AllocatorKind, Config, ConfigError, SchedulingAlgorithm};
pub use memory::{build_allocator, FlatAllocator, MemoryAllocator, MemoryHandle, PagingAllocator};
pub use process::{
    CoreRegistry, Instruction, Process, ProcessError, ProcessId, ProcessState, Scheduler,
    SchedulerError, SchedulerStats,
};
pub use report::{MemoryReport, UtilizationReport};
pub use services::ProcessManager;
