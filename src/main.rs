// OS Emulator entry point
//
// Runs one batch of generated processes under the scheduler named on the
// command line (`fcfs` or `rr`, default `rr`) and prints the reports.
use std::env;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, LevelFilter, Log, Metadata, Record};

use osemu::{
    build_allocator, Clock, Config, CoreRegistry, MemoryReport, ProcessManager, Scheduler,
    UtilizationReport,
};

const BATCH_WINDOW: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Console logger, level from `OSEMU_LOG` (default `info`)
struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let thread = thread::current();
            eprintln!(
                "[{:<5} {}] {}",
                record.level(),
                thread.name().unwrap_or("main"),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

fn init_logging() {
    let level = env::var("OSEMU_LOG")
        .ok()
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut config = Config {
        num_cpu: 4,
        quantum_cycles: 5,
        batch_process_freq: 10,
        min_ins: 50,
        max_ins: 100,
        max_overall_mem: 16384,
        mem_per_frame: 1024,
        min_mem_per_proc: 1024,
        max_mem_per_proc: 4096,
        ..Config::default()
    };
    if let Some(name) = env::args().nth(1) {
        config.scheduler = name.parse()?;
    }
    config.validate()?;

    let clock = Arc::new(Clock::new());
    let cores = Arc::new(CoreRegistry::new(config.num_cpu));
    let memory = build_allocator(&config);
    let scheduler = Arc::new(Scheduler::new(&config, Arc::clone(&clock), cores, memory));
    let manager = Arc::new(ProcessManager::new(&config, Arc::clone(&scheduler))?);

    clock.start()?;
    scheduler.start()?;
    manager.start_batch()?;
    thread::sleep(BATCH_WINDOW);
    manager.stop_batch();

    let created = manager.process_count() as u64;
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while scheduler.finished_count() < created && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    info!("{} of {} processes finished", scheduler.finished_count(), created);

    println!("{}", UtilizationReport::collect(&manager));
    println!();
    println!("{}", MemoryReport::collect(&scheduler));
    println!();
    println!("{:#?}", scheduler.stats());

    scheduler.stop();
    clock.stop();
    Ok(())
}
