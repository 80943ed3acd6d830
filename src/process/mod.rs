// Process Management Module for the OS Emulator
pub mod cores;
pub mod pcb;
pub mod queue;
pub mod scheduler;

pub use cores::{CoreRegistry, CoreSlot};
pub use pcb::{
    CoreId, Instruction, LogLine, Process, ProcessError, ProcessId, ProcessSnapshot, ProcessState,
};
pub use queue::ReadyQueue;
pub use scheduler::{Scheduler, SchedulerError, SchedulerStats};
