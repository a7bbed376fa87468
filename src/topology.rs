use crate::PinningStrategy;
use core_affinity::CoreId;
use sysinfo::{CpuRefreshKind, System};

/// Logical processors visible to the process, and the core ids workers can be
/// pinned to.
#[derive(Debug, Clone)]
pub struct Topology {
    logical_cores: usize,
    core_ids: Vec<CoreId>,
}

impl Topology {
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());

        let logical_cores = match system.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };

        Topology {
            logical_cores,
            core_ids: core_affinity::get_core_ids().unwrap_or_default(),
        }
    }

    /// A topology with `cores` pinnable cores numbered from zero.
    pub fn uniform(cores: usize) -> Self {
        Topology {
            logical_cores: cores.max(1),
            core_ids: (0..cores).map(|id| CoreId { id }).collect(),
        }
    }

    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    /// Core worker `worker` should be pinned to, starting at core 0 and
    /// wrapping when there are more workers than cores.
    pub fn core_for(&self, strategy: PinningStrategy, worker: usize) -> Option<CoreId> {
        if self.core_ids.is_empty() {
            return None;
        }
        let n = self.core_ids.len();
        match strategy {
            PinningStrategy::None => None,
            PinningStrategy::Linear => Some(self.core_ids[worker % n]),
            PinningStrategy::AvoidSMT => {
                // Even logical processors first, odd ones once those run out.
                let physical = n.div_ceil(2);
                let slot = worker % n;
                let index = if slot < physical {
                    slot * 2
                } else {
                    (slot - physical) * 2 + 1
                };
                Some(self.core_ids[index])
            }
        }
    }
}
