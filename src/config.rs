// Configuration for the OS Emulator
//
// Mirrors the keys of the emulator's `config.txt` (`num-cpu`, `scheduler`,
// `quantum-cycles`, ...). Loading the file is left to the front end; the
// core only consumes a validated `Config`.

use core::fmt;
use core::str::FromStr;

/// CPU scheduling discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingAlgorithm {
    FirstComeFirstServed,
    RoundRobin,
}

impl FromStr for SchedulingAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().trim_matches('"').to_ascii_lowercase();
        match name.as_str() {
            "fcfs" => Ok(Self::FirstComeFirstServed),
            "rr" => Ok(Self::RoundRobin),
            _ => Err(ConfigError::UnknownScheduler(s.to_string())),
        }
    }
}

impl fmt::Display for SchedulingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstComeFirstServed => write!(f, "fcfs"),
            Self::RoundRobin => write!(f, "rr"),
        }
    }
}

/// Which memory allocator a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorKind {
    /// One contiguous arena, first-fit with coalescing
    Flat,
    /// Fixed-size frames of `frame_size` bytes
    Paging { frame_size: usize },
}

/// Configuration errors, fatal at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoCores,
    UnknownScheduler(String),
    ZeroQuantum,
    ZeroBatchFrequency,
    EmptyInstructionRange { min: usize, max: usize },
    ZeroCapacity,
    InvalidFrameSize { frame_size: usize, capacity: usize },
    EmptyMemoryRange { min: usize, max: usize },
    ProcessExceedsCapacity { required: usize, capacity: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCores => write!(f, "num-cpu must be at least 1"),
            Self::UnknownScheduler(name) => {
                write!(f, "unknown scheduler {:?}, expected \"fcfs\" or \"rr\"", name)
            }
            Self::ZeroQuantum => write!(f, "quantum-cycles must be at least 1"),
            Self::ZeroBatchFrequency => write!(f, "batch-process-freq must be at least 1"),
            Self::EmptyInstructionRange { min, max } => {
                write!(f, "invalid instruction range {}..={}", min, max)
            }
            Self::ZeroCapacity => write!(f, "max-overall-mem must be non-zero"),
            Self::InvalidFrameSize { frame_size, capacity } => write!(
                f,
                "mem-per-frame {} must be between 1 and max-overall-mem {}",
                frame_size, capacity
            ),
            Self::EmptyMemoryRange { min, max } => {
                write!(f, "invalid per-process memory range {}..={}", min, max)
            }
            Self::ProcessExceedsCapacity { required, capacity } => write!(
                f,
                "a process needing {} bytes can never fit in {} bytes of memory",
                required, capacity
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Scheduler and memory parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of emulated cores
    pub num_cpu: usize,
    pub scheduler: SchedulingAlgorithm,
    /// Instructions per RR visit
    pub quantum_cycles: u64,
    /// Ticks between two generated processes in batch mode
    pub batch_process_freq: u64,
    pub min_ins: usize,
    pub max_ins: usize,
    /// Extra ticks between two instructions of the same process
    pub delay_per_exec: u64,
    /// Arena capacity in bytes
    pub max_overall_mem: usize,
    /// Frame size in bytes; equal to `max_overall_mem` selects the flat allocator
    pub mem_per_frame: usize,
    pub min_mem_per_proc: usize,
    pub max_mem_per_proc: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cpu: 4,
            scheduler: SchedulingAlgorithm::RoundRobin,
            quantum_cycles: 5,
            batch_process_freq: 1,
            min_ins: 1000,
            max_ins: 2000,
            delay_per_exec: 0,
            max_overall_mem: 16384,
            mem_per_frame: 16384,
            min_mem_per_proc: 4096,
            max_mem_per_proc: 4096,
        }
    }
}

impl Config {
    /// Check every field, returning the first problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cpu == 0 {
            return Err(ConfigError::NoCores);
        }
        if self.scheduler == SchedulingAlgorithm::RoundRobin && self.quantum_cycles == 0 {
            return Err(ConfigError::ZeroQuantum);
        }
        if self.batch_process_freq == 0 {
            return Err(ConfigError::ZeroBatchFrequency);
        }
        if self.min_ins == 0 || self.min_ins > self.max_ins {
            return Err(ConfigError::EmptyInstructionRange {
                min: self.min_ins,
                max: self.max_ins,
            });
        }
        if self.max_overall_mem == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.mem_per_frame == 0 || self.mem_per_frame > self.max_overall_mem {
            return Err(ConfigError::InvalidFrameSize {
                frame_size: self.mem_per_frame,
                capacity: self.max_overall_mem,
            });
        }
        if self.min_mem_per_proc == 0 || self.min_mem_per_proc > self.max_mem_per_proc {
            return Err(ConfigError::EmptyMemoryRange {
                min: self.min_mem_per_proc,
                max: self.max_mem_per_proc,
            });
        }
        if self.max_mem_per_proc > self.max_overall_mem {
            return Err(ConfigError::ProcessExceedsCapacity {
                required: self.max_mem_per_proc,
                capacity: self.max_overall_mem,
            });
        }
        Ok(())
    }

    /// Allocator selected by the frame size
    pub fn allocator_kind(&self) -> AllocatorKind {
        if self.mem_per_frame == self.max_overall_mem {
            AllocatorKind::Flat
        } else {
            AllocatorKind::Paging {
                frame_size: self.mem_per_frame,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_names_parse_case_insensitively() {
        assert_eq!(
            "FCFS".parse::<SchedulingAlgorithm>(),
            Ok(SchedulingAlgorithm::FirstComeFirstServed)
        );
        assert_eq!(
            "\"rr\"".parse::<SchedulingAlgorithm>(),
            Ok(SchedulingAlgorithm::RoundRobin)
        );
        assert!(matches!(
            "sjf".parse::<SchedulingAlgorithm>(),
            Err(ConfigError::UnknownScheduler(_))
        ));
    }

    #[test]
    fn default_config_is_valid_and_flat() {
        let config = Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.allocator_kind(), AllocatorKind::Flat);
    }

    #[test]
    fn smaller_frames_select_paging() {
        let config = Config {
            max_overall_mem: 1024,
            mem_per_frame: 256,
            min_mem_per_proc: 256,
            max_mem_per_proc: 512,
            ..Config::default()
        };
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(
            config.allocator_kind(),
            AllocatorKind::Paging { frame_size: 256 }
        );
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let no_cores = Config {
            num_cpu: 0,
            ..Config::default()
        };
        assert_eq!(no_cores.validate(), Err(ConfigError::NoCores));

        let too_big = Config {
            max_mem_per_proc: 32768,
            ..Config::default()
        };
        assert_eq!(
            too_big.validate(),
            Err(ConfigError::ProcessExceedsCapacity {
                required: 32768,
                capacity: 16384
            })
        );

        let zero_quantum = Config {
            quantum_cycles: 0,
            ..Config::default()
        };
        assert_eq!(zero_quantum.validate(), Err(ConfigError::ZeroQuantum));

        let fcfs_ignores_quantum = Config {
            scheduler: SchedulingAlgorithm::FirstComeFirstServed,
            quantum_cycles: 0,
            ..Config::default()
        };
        assert_eq!(fcfs_ignores_quantum.validate(), Ok(()));
    }
}
