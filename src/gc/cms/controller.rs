use parking_lot::Mutex;
use std::cmp::{max, min};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::flags::Flags;
use crate::gc::{formatted_size, GcReason};
use crate::mem;
use crate::os;

/// Per-cycle phase timings in milliseconds.
#[derive(Clone)]
pub struct CyclePhases {
    pub initial_mark: f32,
    pub marking: f32,
    pub preclean: f32,
    pub remark: f32,
    pub sweep: f32,
    pub total: f32,
}

impl CyclePhases {
    pub fn new() -> CyclePhases {
        CyclePhases {
            initial_mark: 0f32,
            marking: 0f32,
            preclean: 0f32,
            remark: 0f32,
            sweep: 0f32,
            total: 0f32,
        }
    }
}

/// Sizing and statistics policy. Records what each cycle did, keeps decaying
/// averages for scheduling, and computes the post-sweep capacity target.
pub struct CycleController {
    occupancy_trigger_percent: usize,
    min_capacity: usize,
    max_capacity: usize,

    cycle_start: Option<Instant>,
    start_used: usize,
    end_used: usize,
    last_cycle_end: Option<Instant>,

    pub promoted_bytes: usize,
    pub direct_allocated_bytes: usize,

    pub total_cycles: usize,
    pub total_full_collections: usize,
    pub total_failures: usize,
    pub total_pause: f32,

    pub avg_cycle_duration: f32,
    pub avg_cycle_period: f32,
    pub avg_allocation_per_cycle: f32,

    cycle_phases: Vec<CyclePhases>,
}

pub type SharedController = Arc<Mutex<CycleController>>;

impl CycleController {
    pub fn new(flags: &Flags, min_capacity: usize, max_capacity: usize) -> CycleController {
        assert!(min_capacity <= max_capacity);

        CycleController {
            occupancy_trigger_percent: flags.occupancy_trigger_percent,
            min_capacity,
            max_capacity,

            cycle_start: None,
            start_used: 0,
            end_used: 0,
            last_cycle_end: None,

            promoted_bytes: 0,
            direct_allocated_bytes: 0,

            total_cycles: 0,
            total_full_collections: 0,
            total_failures: 0,
            total_pause: 0f32,

            avg_cycle_duration: 0f32,
            avg_cycle_period: 0f32,
            avg_allocation_per_cycle: 0f32,

            cycle_phases: Vec::new(),
        }
    }

    /// Occupancy trigger for starting a background cycle.
    pub fn should_start_cycle(&self, used: usize, capacity: usize) -> bool {
        if self.cycle_start.is_some() {
            return false;
        }

        used * 100 >= capacity * self.occupancy_trigger_percent
    }

    pub fn note_promoted(&mut self, size: usize) {
        self.promoted_bytes += size;
    }

    pub fn note_direct_allocated(&mut self, size: usize) {
        self.direct_allocated_bytes += size;
    }

    pub fn note_pause(&mut self, duration_ms: f32) {
        self.total_pause += duration_ms;
    }

    pub fn cycle_started(&mut self, used: usize) {
        assert!(self.cycle_start.is_none());

        if let Some(last_end) = self.last_cycle_end {
            let period_ms = last_end.elapsed().as_secs_f32() * 1000f32;
            self.avg_cycle_period = decaying_average(self.avg_cycle_period, period_ms);
        }

        self.cycle_start = Some(Instant::now());
        self.start_used = used;
    }

    pub fn cycle_completed(&mut self, used: usize, phases: CyclePhases) -> f32 {
        let duration_ms = self.finish_cycle(used);

        self.total_cycles += 1;
        self.avg_cycle_duration = decaying_average(self.avg_cycle_duration, duration_ms);
        self.avg_allocation_per_cycle = decaying_average(
            self.avg_allocation_per_cycle,
            (self.promoted_bytes + self.direct_allocated_bytes) as f32,
        );
        self.promoted_bytes = 0;
        self.direct_allocated_bytes = 0;
        self.cycle_phases.push(phases);

        duration_ms
    }

    pub fn cycle_failed(&mut self, used: usize) {
        self.finish_cycle(used);
        self.total_failures += 1;
    }

    pub fn full_collection_completed(&mut self, used: usize, duration_ms: f32) {
        self.total_full_collections += 1;
        self.total_pause += duration_ms;
        self.end_used = used;
        self.promoted_bytes = 0;
        self.direct_allocated_bytes = 0;
        self.last_cycle_end = Some(Instant::now());
    }

    fn finish_cycle(&mut self, used: usize) -> f32 {
        let start = self.cycle_start.take().expect("cycle not started");
        let duration_ms = start.elapsed().as_secs_f32() * 1000f32;
        self.end_used = used;
        self.last_cycle_end = Some(Instant::now());
        duration_ms
    }

    pub fn cycle_in_progress(&self) -> bool {
        self.cycle_start.is_some()
    }

    /// Post-sweep capacity target: keep the generation around half full so
    /// the next cycle starts well before exhaustion.
    pub fn compute_capacity(&self, used: usize) -> usize {
        let desired = used.saturating_mul(2);
        let desired = max(desired, self.min_capacity);
        let desired = min(desired, self.max_capacity);
        mem::align_usize_up(desired, os::page_size())
    }

    pub fn start_used(&self) -> usize {
        self.start_used
    }

    pub fn phases(&self) -> &[CyclePhases] {
        &self.cycle_phases
    }
}

fn decaying_average(old: f32, sample: f32) -> f32 {
    if old == 0f32 {
        sample
    } else {
        old * 0.7f32 + sample * 0.3f32
    }
}

pub fn print_cycle(
    controller: &CycleController,
    reason: GcReason,
    duration_ms: f32,
    phases: &CyclePhases,
) {
    println!(
        "GC: concurrent cycle ({}) {} -> {}; {:.2} ms total; \
         pauses {:.2}/{:.2} ms; marking {:.2} ms; sweep {:.2} ms",
        reason,
        formatted_size(controller.start_used),
        formatted_size(controller.end_used),
        duration_ms,
        phases.initial_mark,
        phases.remark,
        phases.marking,
        phases.sweep,
    );
}

pub fn print_full(controller: &CycleController, reason: GcReason, duration_ms: f32) {
    println!(
        "GC: full ({}) {} -> {}; {:.2} ms",
        reason,
        formatted_size(controller.start_used),
        formatted_size(controller.end_used),
        duration_ms,
    );
}

impl fmt::Display for CycleController {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cycles={} full={} failures={} total_pause={:.1}ms avg_cycle={:.1}ms",
            self.total_cycles,
            self.total_full_collections,
            self.total_failures,
            self.total_pause,
            self.avg_cycle_duration,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::M;

    fn controller() -> CycleController {
        let flags = Flags::default();
        CycleController::new(&flags, M, 4 * M)
    }

    #[test]
    fn occupancy_trigger() {
        let ctrl = controller();

        assert!(!ctrl.should_start_cycle(74 * M / 100, M));
        assert!(ctrl.should_start_cycle(75 * M / 100, M));
        assert!(ctrl.should_start_cycle(M, M));
    }

    #[test]
    fn no_trigger_while_cycle_runs() {
        let mut ctrl = controller();

        ctrl.cycle_started(M);
        assert!(!ctrl.should_start_cycle(M, M));

        ctrl.cycle_completed(M / 4, CyclePhases::new());
        assert!(ctrl.should_start_cycle(M, M));
        assert_eq!(ctrl.total_cycles, 1);
    }

    #[test]
    fn capacity_target_is_clamped() {
        let ctrl = controller();

        assert_eq!(ctrl.compute_capacity(0), M);
        assert_eq!(ctrl.compute_capacity(3 * M), 4 * M);

        let mid = ctrl.compute_capacity(M);
        assert!(mid >= 2 * M && mid <= 4 * M);
    }

    #[test]
    fn failure_accounting() {
        let mut ctrl = controller();

        ctrl.cycle_started(M);
        ctrl.cycle_failed(M);
        assert_eq!(ctrl.total_failures, 1);
        assert_eq!(ctrl.total_cycles, 0);
        assert!(!ctrl.cycle_in_progress());
    }
}
