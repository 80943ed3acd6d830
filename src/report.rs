// Read-only reports for the OS Emulator
//
// Reports only read accessors; building one never changes scheduler,
// allocator or process state.
use core::fmt;

use crate::memory::ResidentProcess;
use crate::process::pcb::{ProcessSnapshot, ProcessState};
use crate::process::scheduler::Scheduler;
use crate::services::ProcessManager;

const RULE: &str = "--------------------------------------------";

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// CPU utilization and the process lists
#[derive(Debug, Clone, PartialEq)]
pub struct UtilizationReport {
    pub cores_total: usize,
    pub cores_used: usize,
    pub cpu_utilization: f64,
    pub running: Vec<ProcessSnapshot>,
    pub ready: Vec<ProcessSnapshot>,
    pub finished: Vec<ProcessSnapshot>,
}

impl UtilizationReport {
    pub fn collect(manager: &ProcessManager) -> Self {
        let cores = manager.scheduler().cores();
        let cores_total = cores.core_count();
        let cores_used = cores.busy_count();

        let mut report = Self {
            cores_total,
            cores_used,
            cpu_utilization: percent(cores_used, cores_total),
            running: Vec::new(),
            ready: Vec::new(),
            finished: Vec::new(),
        };
        for snapshot in manager.snapshot_all() {
            match snapshot.state {
                ProcessState::Running => report.running.push(snapshot),
                ProcessState::Finished => report.finished.push(snapshot),
                ProcessState::Ready | ProcessState::Waiting => report.ready.push(snapshot),
            }
        }
        report
    }

    pub fn cores_available(&self) -> usize {
        self.cores_total - self.cores_used
    }
}

fn write_process_line(f: &mut fmt::Formatter<'_>, snapshot: &ProcessSnapshot) -> fmt::Result {
    let location = match (snapshot.state, snapshot.core_id) {
        (ProcessState::Finished, _) => "Finished".to_string(),
        (_, Some(core)) => format!("Core: {}", core),
        (_, None) => "Queued".to_string(),
    };
    writeln!(
        f,
        "{:<16} (tick {:>6})   {:<10} {} / {}",
        snapshot.name,
        snapshot.created_at,
        location,
        snapshot.command_counter,
        snapshot.instruction_count
    )
}

impl fmt::Display for UtilizationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CPU utilization: {:.2}%", self.cpu_utilization)?;
        writeln!(f, "Cores used: {}", self.cores_used)?;
        writeln!(f, "Cores available: {}", self.cores_available())?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Running processes:")?;
        for snapshot in &self.running {
            write_process_line(f, snapshot)?;
        }
        writeln!(f)?;
        writeln!(f, "Ready processes: {}", self.ready.len())?;
        writeln!(f)?;
        writeln!(f, "Finished processes:")?;
        for snapshot in &self.finished {
            write_process_line(f, snapshot)?;
        }
        write!(f, "{}", RULE)
    }
}

/// Memory usage, residency and tick accounting
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryReport {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub fragmentation: usize,
    pub resident: Vec<ResidentProcess>,
    /// Processes waiting for memory
    pub waiting: usize,
    pub page_ins: usize,
    pub page_outs: usize,
    pub active_ticks: u64,
    pub idle_ticks: u64,
    pub total_ticks: u64,
}

impl MemoryReport {
    pub fn collect(scheduler: &Scheduler) -> Self {
        let memory = scheduler.memory();
        let clock = scheduler.clock();
        let total = memory.total_capacity();
        let free = memory.free_space();
        let total_ticks = clock.current_tick();
        let active_ticks = clock.active_tick_count().min(total_ticks);

        Self {
            total,
            used: total - free,
            free,
            fragmentation: memory.fragmentation(),
            resident: memory.process_snapshot(),
            waiting: memory.waiting_count(),
            page_ins: memory.page_in_count(),
            page_outs: memory.page_out_count(),
            active_ticks,
            idle_ticks: total_ticks - active_ticks,
            total_ticks,
        }
    }

    pub fn memory_utilization(&self) -> f64 {
        percent(self.used, self.total)
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory utilization: {:.2}%", self.memory_utilization())?;
        writeln!(f, "Total memory: {} bytes", self.total)?;
        writeln!(f, "Used memory: {} bytes", self.used)?;
        writeln!(f, "Free memory: {} bytes", self.free)?;
        writeln!(f, "Fragmentation: {} bytes", self.fragmentation)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Resident processes: {}", self.resident.len())?;
        for resident in &self.resident {
            writeln!(
                f,
                "{:<16} {:>8} bytes ({} reserved)",
                resident.name, resident.size, resident.reserved
            )?;
        }
        writeln!(f, "Waiting for memory: {}", self.waiting)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "Active CPU ticks: {}", self.active_ticks)?;
        writeln!(f, "Idle CPU ticks: {}", self.idle_ticks)?;
        writeln!(f, "Total CPU ticks: {}", self.total_ticks)?;
        writeln!(f, "Num paged in: {}", self.page_ins)?;
        write!(f, "Num paged out: {}", self.page_outs)
    }
}
