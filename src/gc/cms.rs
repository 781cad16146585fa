use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::flags::Flags;
use crate::gc::bitmap::MarkBitMap;
use crate::gc::cms::controller::{CycleController, CyclePhases, SharedController};
use crate::gc::mark_stack::{OverflowChannel, SharedMarkStack};
use crate::gc::worker::{TaskOutcome, YieldScope, YieldingGang, YieldingTask};
use crate::gc::{Address, GcReason};
use crate::heap::Heap;
use crate::safepoint::Safepoint;

pub mod controller;
pub mod driver;
pub mod full;
pub mod marker;
pub mod sweeper;

/// Collector phases. The numbering puts every out-of-cycle state at or
/// below `Idling`: once sweeping finished, resizing and resetting no longer
/// exclude a foreground collection.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum CollectorState {
    Resizing = 0,
    Resetting = 1,
    Idling = 2,
    InitialMarking = 3,
    Marking = 4,
    Precleaning = 5,
    AbortablePreclean = 6,
    FinalMarking = 7,
    Sweeping = 8,
}

impl CollectorState {
    pub fn is_outside_cycle(self) -> bool {
        self <= CollectorState::Idling
    }
}

fn is_valid_transition(from: CollectorState, to: CollectorState) -> bool {
    use CollectorState::*;

    matches!(
        (from, to),
        (Idling, InitialMarking)
            | (InitialMarking, Marking)
            | (Marking, Precleaning)
            | (Marking, FinalMarking)
            | (Precleaning, AbortablePreclean)
            | (Precleaning, FinalMarking)
            | (AbortablePreclean, FinalMarking)
            | (FinalMarking, Sweeping)
            | (Sweeping, Resizing)
            | (Resizing, Resetting)
            | (Resetting, Idling)
    )
}

/// Current phase plus the recorded sequence of the running cycle. The
/// history makes completed cycles checkable against the transition graph.
pub struct PhaseTracker {
    state: AtomicUsize,
    history: Mutex<Vec<CollectorState>>,
}

impl PhaseTracker {
    pub fn new() -> PhaseTracker {
        PhaseTracker {
            state: AtomicUsize::new(u8::from(CollectorState::Idling) as usize),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn load(&self) -> CollectorState {
        CollectorState::try_from(self.state.load(Ordering::Acquire) as u8)
            .expect("invalid collector state")
    }

    pub fn is_outside_cycle(&self) -> bool {
        self.load().is_outside_cycle()
    }

    /// Moves along an edge of the transition graph. Anything else is a
    /// programming error.
    pub fn transition(&self, from: CollectorState, to: CollectorState) {
        assert!(is_valid_transition(from, to), "{:?} -> {:?}", from, to);

        let prev = self
            .state
            .swap(u8::from(to) as usize, Ordering::AcqRel);
        assert_eq!(prev as u8, u8::from(from), "unexpected phase");

        self.history.lock().push(to);
    }

    /// Failure path: jumps to `to` regardless of the current phase. Still
    /// recorded in the history.
    pub fn force(&self, to: CollectorState) {
        self.state.store(u8::from(to) as usize, Ordering::Release);
        self.history.lock().push(to);
    }

    pub fn begin_cycle_history(&self) {
        self.history.lock().clear();
    }

    pub fn history(&self) -> Vec<CollectorState> {
        self.history.lock().clone()
    }
}

const CMS_WANTS: u8 = 1 << 0;
const CMS_HAS: u8 = 1 << 1;
const VM_WANTS: u8 = 1 << 2;
const VM_HAS: u8 = 1 << 3;

/// Mutual-exclusion token between the background thread and the safepoint
/// side. Four bits: each side has a wants/has pair, at most one side holds
/// "has" at a time. The safepoint side has priority: the background thread
/// blocks while the safepoint side wants or holds the token, the safepoint
/// side only blocks while the background thread actually holds it.
pub struct CmsToken {
    bits: Mutex<u8>,
    granted: Condvar,
}

pub struct VmTokenScope<'a> {
    token: &'a CmsToken,
}

impl CmsToken {
    pub fn new() -> CmsToken {
        CmsToken {
            bits: Mutex::new(0),
            granted: Condvar::new(),
        }
    }

    pub fn cms_acquire(&self) {
        let mut bits = self.bits.lock();
        *bits |= CMS_WANTS;

        while *bits & (VM_WANTS | VM_HAS | CMS_HAS) != 0 {
            self.granted.wait(&mut bits);
        }

        *bits = (*bits & !CMS_WANTS) | CMS_HAS;
        debug_assert!(*bits & VM_HAS == 0);
    }

    pub fn cms_release(&self) {
        let mut bits = self.bits.lock();
        assert!(*bits & CMS_HAS != 0);
        *bits &= !CMS_HAS;
        self.granted.notify_all();
    }

    pub fn vm_scope(&self) -> VmTokenScope<'_> {
        let mut bits = self.bits.lock();
        *bits |= VM_WANTS;

        while *bits & (CMS_HAS | VM_HAS) != 0 {
            self.granted.wait(&mut bits);
        }

        *bits = (*bits & !VM_WANTS) | VM_HAS;
        debug_assert!(*bits & CMS_HAS == 0);

        VmTokenScope { token: self }
    }

    /// Queried by safepoint machinery: a pending safepoint operation has to
    /// wait while the background thread holds the token.
    pub fn background_holds(&self) -> bool {
        *self.bits.lock() & CMS_HAS != 0
    }
}

impl<'a> Drop for VmTokenScope<'a> {
    fn drop(&mut self) {
        let mut bits = self.token.bits.lock();
        assert!(*bits & VM_HAS != 0);
        *bits &= !VM_HAS;
        self.token.granted.notify_all();
    }
}

/// Cooperative yield counter. Latency-sensitive operations hold a
/// `YieldRequest` while they run; the background side polls `is_pending` at
/// checkpoints and suspends until the count returns to zero.
pub struct PendingYield {
    count: AtomicUsize,
    sync: Mutex<()>,
    zero: Condvar,
}

pub struct YieldRequest<'a> {
    pending: &'a PendingYield,
}

impl PendingYield {
    pub fn new() -> PendingYield {
        PendingYield {
            count: AtomicUsize::new(0),
            sync: Mutex::new(()),
            zero: Condvar::new(),
        }
    }

    pub fn request(&self) -> YieldRequest<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        YieldRequest { pending: self }
    }

    pub fn is_pending(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }

    /// Blocks until no yield request is outstanding.
    pub fn await_zero(&self) {
        self.await_zero_or(|| false);
    }

    /// Blocks until no yield request is outstanding or `cancelled` turns
    /// true. Cancellation sources must call `notify` after flipping their
    /// condition.
    pub fn await_zero_or<F>(&self, cancelled: F)
    where
        F: Fn() -> bool,
    {
        let mut guard = self.sync.lock();

        while self.count.load(Ordering::SeqCst) > 0 && !cancelled() {
            self.zero.wait(&mut guard);
        }
    }

    /// Wakes waiters so they re-check their cancellation condition.
    pub fn notify(&self) {
        let _guard = self.sync.lock();
        self.zero.notify_all();
    }
}

impl<'a> Drop for YieldRequest<'a> {
    fn drop(&mut self) {
        if self.pending.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.pending.sync.lock();
            self.pending.zero.notify_all();
        }
    }
}

struct Coordination {
    cycle_request: Option<GcReason>,
    full_request: bool,
    foreground_active: bool,
    background_active: bool,
    stop_requested: bool,
}

/// The mostly-concurrent mark-sweep collector. Owns the heap, the marking
/// state, the background driver and the worker gang; sole entry point for
/// the allocator and the safepoint machinery.
pub struct CmsCollector {
    pub flags: Flags,
    pub heap: Heap,
    pub safepoint: Safepoint,

    pub(crate) bitmap: MarkBitMap,
    pub(crate) mark_stack: SharedMarkStack,
    pub(crate) overflow: OverflowChannel,
    pub(crate) phase: PhaseTracker,
    pub(crate) token: CmsToken,
    pub(crate) pending_yield: PendingYield,
    pub(crate) gang: Arc<YieldingGang>,
    pub(crate) controller: SharedController,

    coordination: Mutex<Coordination>,
    changed: Condvar,
    /// Top of the heap when the current sweep started; 0 while no sweep has
    /// started this cycle. Objects at or above it are never touched.
    sweep_limit: AtomicUsize,

    driver: Mutex<Option<JoinHandle<()>>>,
}

impl CmsCollector {
    pub fn new(flags: Flags) -> Arc<CmsCollector> {
        let heap = Heap::new(&flags);
        let total = heap.total();

        let bitmap = MarkBitMap::new(total);
        let overflow = OverflowChannel::new(total);
        let mark_stack =
            SharedMarkStack::new(flags.mark_stack_capacity, flags.mark_stack_max_capacity);
        let gang = YieldingGang::new(flags.gc_workers());
        let controller = Arc::new(Mutex::new(CycleController::new(
            &flags,
            heap.initial_capacity(),
            heap.max_capacity(),
        )));

        let collector = Arc::new(CmsCollector {
            flags,
            heap,
            safepoint: Safepoint::new(),
            bitmap,
            mark_stack,
            overflow,
            phase: PhaseTracker::new(),
            token: CmsToken::new(),
            pending_yield: PendingYield::new(),
            gang,
            controller,
            coordination: Mutex::new(Coordination {
                cycle_request: None,
                full_request: false,
                foreground_active: false,
                background_active: false,
                stop_requested: false,
            }),
            changed: Condvar::new(),
            sweep_limit: AtomicUsize::new(0),
            driver: Mutex::new(None),
        });

        let handle = driver::start(collector.clone());
        *collector.driver.lock() = Some(handle);

        collector
    }

    pub fn state(&self) -> CollectorState {
        self.phase.load()
    }

    pub fn cycle_history(&self) -> Vec<CollectorState> {
        self.phase.history()
    }

    /// Allocates a live object, running a synchronous full collection on
    /// allocation failure. Must not be called while holding a mutator
    /// scope; allocation parks internally.
    pub fn allocate(&self, size_words: usize, ref_count: usize) -> Option<Address> {
        for attempt in 0..2 {
            let result = {
                let _scope = self.safepoint.mutator();
                self.heap.allocate(size_words, ref_count)
            };

            if let Some(obj) = result {
                self.note_allocation(obj, size_words * crate::mem::ptr_width_usize());
                return Some(obj);
            }

            if attempt == 0 {
                let reason = if self.background_active() {
                    GcReason::ConcurrentModeFailure
                } else {
                    GcReason::AllocationFailure
                };

                self.collect_full(reason);
            }
        }

        None
    }

    fn note_allocation(&self, obj: Address, size: usize) {
        if !self.phase.is_outside_cycle() {
            self.bitmap.par_mark(obj);
        }

        self.controller.lock().note_direct_allocated(size);
    }

    /// Notification that `addr` was promoted into this generation. During a
    /// cycle the object is marked live and its cards dirtied, so precleaning
    /// or remark rescans the fields the copy wrote without barriers.
    pub fn promoted(&self, addr: Address, size: usize) {
        if !self.phase.is_outside_cycle() {
            self.bitmap.par_mark(addr);
            self.heap.card_table().dirty_range(addr.region_start(size));
        }

        self.controller.lock().note_promoted(size);
    }

    /// Notification of a direct (non-promoting) allocation done outside
    /// `allocate`, e.g. by a compiled fast path.
    pub fn direct_allocated(&self, addr: Address, size: usize) {
        self.note_allocation(addr, size);
    }

    /// True once sweeping has started this cycle and the object is below
    /// the sweep limit without having been marked reachable.
    pub fn is_dead_object(&self, obj: Address) -> bool {
        let limit = self.sweep_limit.load(Ordering::Acquire);

        limit != 0 && obj.to_usize() < limit && self.bitmap.is_unmarked(obj)
    }

    /// Scoped acquisition for callers that must pause concurrent sweeping
    /// (verification, heap iteration). Sweeping parks at its next block
    /// boundary and stays parked while the guard lives.
    pub fn freelist_locks(&self) -> YieldRequest<'_> {
        self.pending_yield.request()
    }

    /// Hands out a yield request for latency-sensitive operations such as a
    /// minor collection.
    pub fn yield_request(&self) -> YieldRequest<'_> {
        self.pending_yield.request()
    }

    pub fn collect(&self, reason: GcReason) {
        match reason {
            GcReason::ForceCollect | GcReason::Occupancy => self.request_cycle(reason),
            GcReason::AllocationFailure | GcReason::ConcurrentModeFailure => {
                self.collect_full(reason)
            }
        }
    }

    /// Asks the background driver to start a concurrent cycle.
    pub fn request_cycle(&self, reason: GcReason) {
        let mut coord = self.coordination.lock();

        if coord.background_active || coord.cycle_request.is_some() {
            return;
        }

        coord.cycle_request = Some(reason);
        self.changed.notify_all();
    }

    /// Synchronous full collection. If a background cycle is running, the
    /// baton protocol makes it abandon its cycle at the next phase
    /// boundary; this thread blocks until responsibility is handed over,
    /// then runs the full collection itself.
    pub fn collect_full(&self, reason: GcReason) {
        {
            let mut coord = self.coordination.lock();
            coord.full_request = true;
            self.changed.notify_all();
        }

        // A driver suspended on yield requests re-checks the baton.
        self.pending_yield.notify();

        {
            let mut coord = self.coordination.lock();

            while coord.background_active || coord.foreground_active {
                self.changed.wait(&mut coord);
            }

            coord.foreground_active = true;
            coord.full_request = false;
        }

        let pause_start = Instant::now();

        {
            let _token = self.token.vm_scope();
            self.safepoint.stop_the_world(|| full::collect(self, reason));
        }

        let duration_ms = pause_start.elapsed().as_secs_f32() * 1000f32;

        {
            let mut controller = self.controller.lock();
            controller.full_collection_completed(self.heap.used(), duration_ms);
            controller.note_pause(duration_ms);

            if self.flags.gc_verbose {
                controller::print_full(&controller, reason, duration_ms);
            }
        }

        {
            let mut coord = self.coordination.lock();
            coord.foreground_active = false;
            self.changed.notify_all();
        }
    }

    pub fn background_active(&self) -> bool {
        self.coordination.lock().background_active
    }

    pub(crate) fn baton_requested(&self) -> bool {
        self.coordination.lock().full_request
    }

    /// Driver side: blocks until a cycle should run. Returns None on stop.
    pub(crate) fn wait_for_trigger(&self) -> Option<GcReason> {
        let mut coord = self.coordination.lock();

        loop {
            if coord.stop_requested {
                return None;
            }

            if !coord.full_request && !coord.foreground_active {
                if let Some(reason) = coord.cycle_request.take() {
                    coord.background_active = true;
                    return Some(reason);
                }

                let should_start = self
                    .controller
                    .lock()
                    .should_start_cycle(self.heap.used(), self.heap.capacity());

                if should_start {
                    coord.background_active = true;
                    return Some(GcReason::Occupancy);
                }
            }

            if self.flags.wait_duration_ms == 0 {
                self.changed.wait(&mut coord);
            } else {
                self.changed.wait_for(
                    &mut coord,
                    Duration::from_millis(self.flags.wait_duration_ms),
                );
            }
        }
    }

    fn end_background(&self) {
        let mut coord = self.coordination.lock();
        assert!(coord.background_active);
        coord.background_active = false;
        self.changed.notify_all();
    }

    /// One full background cycle, phase by phase. Between phases the driver
    /// checks for a pending foreground request and hands over the baton by
    /// abandoning the cycle.
    pub(crate) fn run_background_cycle(self: &Arc<CmsCollector>, reason: GcReason) {
        self.phase.begin_cycle_history();
        self.controller.lock().cycle_started(self.heap.used());

        let cycle_start = Instant::now();
        let mut phases = CyclePhases::new();

        if self.baton_requested() {
            self.abandon_cycle("before initial mark");
            return;
        }

        self.phase
            .transition(CollectorState::Idling, CollectorState::InitialMarking);
        phases.initial_mark = self.checkpoint_roots_initial();

        self.phase
            .transition(CollectorState::InitialMarking, CollectorState::Marking);
        let phase_start = Instant::now();
        let completed = marker::concurrent_mark(self);
        phases.marking = elapsed_ms(phase_start);

        if !completed || self.baton_requested() {
            self.abandon_cycle("during marking");
            return;
        }

        // Safe checkpoint: no marking in flight, so a one-time stack
        // expansion cannot race with pushes.
        if self.overflow.overflow_count() >= self.flags.overflow_expand_threshold {
            self.mark_stack.expand();
        }

        let phase_start = Instant::now();
        self.phase
            .transition(CollectorState::Marking, CollectorState::Precleaning);
        marker::preclean(self);

        if self.baton_requested() {
            self.abandon_cycle("during precleaning");
            return;
        }

        if self.flags.abortable_preclean_budget_ms > 0 {
            self.phase
                .transition(CollectorState::Precleaning, CollectorState::AbortablePreclean);
            marker::abortable_preclean(self);

            if self.baton_requested() {
                self.abandon_cycle("during abortable preclean");
                return;
            }

            self.phase
                .transition(CollectorState::AbortablePreclean, CollectorState::FinalMarking);
        } else {
            self.phase
                .transition(CollectorState::Precleaning, CollectorState::FinalMarking);
        }
        phases.preclean = elapsed_ms(phase_start);

        phases.remark = self.checkpoint_roots_final();

        self.phase
            .transition(CollectorState::FinalMarking, CollectorState::Sweeping);
        let phase_start = Instant::now();
        let completed = sweeper::concurrent_sweep(self);
        phases.sweep = elapsed_ms(phase_start);

        if !completed || self.baton_requested() {
            self.abandon_cycle("during sweeping");
            return;
        }

        self.phase
            .transition(CollectorState::Sweeping, CollectorState::Resizing);
        let capacity = self.controller.lock().compute_capacity(self.heap.used());
        self.heap.set_capacity(capacity);

        self.phase
            .transition(CollectorState::Resizing, CollectorState::Resetting);
        self.reset_cycle_structures();
        self.phase
            .transition(CollectorState::Resetting, CollectorState::Idling);

        phases.total = elapsed_ms(cycle_start);

        {
            let mut controller = self.controller.lock();
            let duration_ms = controller.cycle_completed(self.heap.used(), phases.clone());

            if self.flags.gc_verbose {
                controller::print_cycle(&controller, reason, duration_ms, &phases);
            }
        }

        self.end_background();
    }

    /// Baton handoff or failed phase: drop all cycle progress and return to
    /// Idling so the foreground side can run a full collection.
    fn abandon_cycle(&self, where_: &str) {
        if self.flags.gc_verbose {
            println!("GC: concurrent cycle abandoned {}", where_);
        }

        self.reset_cycle_structures();
        self.phase.force(CollectorState::Resetting);
        self.phase.force(CollectorState::Idling);
        self.controller.lock().cycle_failed(self.heap.used());
        self.end_background();
    }

    fn reset_cycle_structures(&self) {
        self.bitmap.clear_all();
        self.mark_stack.reset();
        self.overflow.reset();
        self.heap.card_table().clear_all();
        self.sweep_limit.store(0, Ordering::Release);
    }

    /// Stop-the-world initial mark. Returns the pause duration in ms.
    pub fn checkpoint_roots_initial(&self) -> f32 {
        let _token = self.token.vm_scope();
        let pause_start = Instant::now();

        self.safepoint
            .stop_the_world(|| marker::checkpoint_roots_initial(self));

        let duration_ms = elapsed_ms(pause_start);
        self.controller.lock().note_pause(duration_ms);
        duration_ms
    }

    /// Stop-the-world remark. Returns the pause duration in ms.
    pub fn checkpoint_roots_final(&self) -> f32 {
        let _token = self.token.vm_scope();
        let pause_start = Instant::now();

        self.safepoint
            .stop_the_world(|| marker::checkpoint_roots_final(self));

        let duration_ms = elapsed_ms(pause_start);
        self.controller.lock().note_pause(duration_ms);
        duration_ms
    }

    pub(crate) fn set_sweep_limit(&self, limit: Address) {
        self.sweep_limit.store(limit.to_usize(), Ordering::Release);
    }

    pub(crate) fn sweep_limit(&self) -> Address {
        Address::from(self.sweep_limit.load(Ordering::Acquire))
    }

    /// Runs a yielding task on the gang, suspending the whole phase while
    /// yield requests are outstanding. The token is held exactly while
    /// workers can run. Returns true when the task completed.
    pub(crate) fn run_gang_phase(&self, task: Arc<dyn YieldingTask>, workers: usize) -> bool {
        self.token.cms_acquire();
        self.gang.start(task, workers);

        loop {
            match self.gang.wait() {
                TaskOutcome::Completed => {
                    self.token.cms_release();
                    return true;
                }
                TaskOutcome::Aborted => {
                    self.token.cms_release();
                    return false;
                }
                TaskOutcome::Yielded => {
                    self.token.cms_release();
                    self.pending_yield.await_zero_or(|| self.baton_requested());
                    self.token.cms_acquire();

                    if self.baton_requested() {
                        self.gang.abort();
                    } else {
                        self.gang.continue_task();
                    }
                }
            }
        }
    }

    /// Checkpoint polled by gang workers at object granularity: converts a
    /// pending yield or foreground request into a gang-wide yield, then
    /// parks. Returns false when the task is aborting.
    pub(crate) fn worker_checkpoint(&self, scope: &YieldScope<'_>) -> bool {
        if self.pending_yield.is_pending() || self.baton_requested() {
            self.gang.request_yield();
        }

        scope.yield_point()
    }

    /// Driver-thread checkpoint for serial concurrent work (precleaning,
    /// resetting): suspends while yield requests are outstanding. Returns
    /// false when a foreground request should end the phase early.
    pub(crate) fn driver_checkpoint(&self) -> bool {
        if self.pending_yield.is_pending() {
            self.token.cms_release();
            self.pending_yield.await_zero_or(|| self.baton_requested());
            self.token.cms_acquire();
        }

        !self.baton_requested()
    }

    /// Stops the background driver and the worker gang. The collector stays
    /// usable for synchronous full collections afterwards.
    pub fn stop(&self) {
        {
            let mut coord = self.coordination.lock();
            coord.stop_requested = true;
            self.changed.notify_all();
        }

        if let Some(handle) = self.driver.lock().take() {
            handle.join().expect("driver thread panicked");
        }

        self.gang.shutdown();

        if self.flags.gc_stats {
            println!("GC: {}", self.controller.lock());
        }
    }
}

fn elapsed_ms(start: Instant) -> f32 {
    start.elapsed().as_secs_f32() * 1000f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_matches_cycle_membership() {
        use CollectorState::*;

        for state in [Resizing, Resetting, Idling] {
            assert!(state.is_outside_cycle());
        }

        for state in [
            InitialMarking,
            Marking,
            Precleaning,
            AbortablePreclean,
            FinalMarking,
            Sweeping,
        ] {
            assert!(!state.is_outside_cycle());
        }
    }

    #[test]
    fn transition_graph_edges() {
        use CollectorState::*;

        assert!(is_valid_transition(Idling, InitialMarking));
        assert!(is_valid_transition(Marking, FinalMarking));
        assert!(is_valid_transition(Precleaning, FinalMarking));
        assert!(!is_valid_transition(Idling, Marking));
        assert!(!is_valid_transition(Sweeping, Idling));
        assert!(!is_valid_transition(FinalMarking, Marking));
    }

    #[test]
    #[should_panic]
    fn invalid_transition_is_fatal() {
        let phase = PhaseTracker::new();
        phase.transition(CollectorState::Idling, CollectorState::Sweeping);
    }

    #[test]
    fn token_grants_one_side_at_a_time() {
        let token = Arc::new(CmsToken::new());

        token.cms_acquire();
        assert!(token.background_holds());

        let acquired = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = {
            let token = token.clone();
            let acquired = acquired.clone();

            std::thread::spawn(move || {
                let _scope = token.vm_scope();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));

        token.cms_release();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(!token.background_holds());
    }

    #[test]
    fn vm_priority_blocks_background_reacquisition() {
        let token = Arc::new(CmsToken::new());

        // Safepoint side holds the token; background acquisition must wait.
        let scope = token.vm_scope();

        let cms_acquired = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let handle = {
            let token = token.clone();
            let cms_acquired = cms_acquired.clone();

            std::thread::spawn(move || {
                token.cms_acquire();
                cms_acquired.store(true, Ordering::SeqCst);
                token.cms_release();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!cms_acquired.load(Ordering::SeqCst));

        drop(scope);
        handle.join().unwrap();
        assert!(cms_acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn pending_yield_counts_requests() {
        let pending = PendingYield::new();
        assert!(!pending.is_pending());

        {
            let _first = pending.request();
            let _second = pending.request();
            assert!(pending.is_pending());
        }

        assert!(!pending.is_pending());
        pending.await_zero();
    }
}
