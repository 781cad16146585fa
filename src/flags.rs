use crate::gc::{K, M};
use crate::mem;

/// Runtime configuration for the collector. Plain data, no parsing; embedders
/// fill in what they need and leave the rest at the defaults.
#[derive(Clone)]
pub struct Flags {
    pub heap_size: usize,
    pub gc_workers: usize,

    pub mark_stack_capacity: usize,
    pub mark_stack_max_capacity: usize,
    pub overflow_expand_threshold: usize,

    /// Old generation occupancy (percent) above which a concurrent
    /// cycle is started.
    pub occupancy_trigger_percent: usize,

    /// Budget for the abortable preclean phase in milliseconds. Any
    /// non-negative value is valid; zero disables the extra precleaning.
    pub abortable_preclean_budget_ms: u64,

    /// How long the background thread sleeps between trigger checks.
    /// Zero means wait indefinitely for an explicit request.
    pub wait_duration_ms: u64,

    pub gc_verbose: bool,
    pub gc_stats: bool,
    pub gc_verify: bool,
}

impl Flags {
    pub fn max_heap_size(&self) -> usize {
        mem::align_usize_up(self.heap_size, crate::os::page_size())
    }

    pub fn gc_workers(&self) -> usize {
        if self.gc_workers > 0 {
            self.gc_workers
        } else {
            std::cmp::min(num_cpus::get(), 4)
        }
    }
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            heap_size: 32 * M,
            gc_workers: 0,

            mark_stack_capacity: 4 * K,
            mark_stack_max_capacity: 64 * K,
            overflow_expand_threshold: 128,

            occupancy_trigger_percent: 75,
            abortable_preclean_budget_ms: 100,
            wait_duration_ms: 50,

            gc_verbose: false,
            gc_stats: false,
            gc_verify: false,
        }
    }
}
