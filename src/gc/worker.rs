use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Work unit executed by the yielding gang. `work` is called once per
/// participating worker and is expected to poll `scope.yield_point()` at
/// object granularity so the gang stays responsive to yield and abort
/// requests.
pub trait YieldingTask: Send + Sync {
    fn name(&self) -> &'static str;
    fn work(&self, worker_id: usize, scope: &YieldScope);
}

/// Outcome observed by the coordinator after `wait`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TaskOutcome {
    /// Every active worker is parked at a yield point; the task can be
    /// continued later from exactly where it stopped.
    Yielded,
    Completed,
    Aborted,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum GangStatus {
    Inactive,
    Active,
    /// Yield requested, workers still draining to their next yield point.
    Yielding,
    Yielded,
    /// Abort requested, workers unwinding.
    Aborting,
    Aborted,
    Completed,
}

struct GangState {
    status: GangStatus,
    task: Option<Arc<dyn YieldingTask>>,
    /// Bumped once per `start`; a worker joins each task at most once.
    epoch: usize,
    active: usize,
    started: usize,
    finished: usize,
    yielded: usize,
    shutdown: bool,
}

impl GangState {
    fn verify_counters(&self) {
        assert!(self.started <= self.active);
        assert!(self.yielded + self.finished <= self.active);
    }
}

/// Pool of persistent worker threads running one yielding task at a time.
///
/// Unlike a plain thread pool, a running task can be suspended: the
/// coordinator requests a yield, each worker parks at its next yield point
/// without losing its position, and the whole gang reports `Yielded` once
/// every active worker is either parked or finished. `continue_task` resumes
/// the parked workers in place.
pub struct YieldingGang {
    inner: Mutex<GangState>,
    monitor: Condvar,
    workers: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl YieldingGang {
    pub fn new(workers: usize) -> Arc<YieldingGang> {
        assert!(workers > 0);

        let gang = Arc::new(YieldingGang {
            inner: Mutex::new(GangState {
                status: GangStatus::Inactive,
                task: None,
                epoch: 0,
                active: 0,
                started: 0,
                finished: 0,
                yielded: 0,
                shutdown: false,
            }),
            monitor: Condvar::new(),
            workers,
            threads: Mutex::new(Vec::new()),
        });

        let mut threads = gang.threads.lock();

        for worker_id in 0..workers {
            let gang = gang.clone();

            let handle = std::thread::Builder::new()
                .name(format!("gc-worker-{}", worker_id))
                .spawn(move || {
                    gang.worker_loop(worker_id);
                })
                .expect("failed to spawn gc worker");

            threads.push(handle);
        }

        drop(threads);
        gang
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Installs `task` and wakes up to `requested_workers` workers. The gang
    /// must be idle. Returns immediately; pair with `wait`.
    pub fn start(&self, task: Arc<dyn YieldingTask>, requested_workers: usize) {
        let mut state = self.inner.lock();
        assert_eq!(state.status, GangStatus::Inactive);
        assert!(requested_workers > 0);

        state.task = Some(task);
        state.epoch += 1;
        state.active = std::cmp::min(requested_workers, self.workers);
        state.started = 0;
        state.finished = 0;
        state.yielded = 0;
        state.status = GangStatus::Active;

        self.monitor.notify_all();
    }

    /// Blocks until the task yields, completes, or aborts. A terminal
    /// outcome resets the gang to idle; `Yielded` leaves the task installed
    /// for `continue_task` or `abort`.
    pub fn wait(&self) -> TaskOutcome {
        let mut state = self.inner.lock();

        loop {
            match state.status {
                GangStatus::Yielded => return TaskOutcome::Yielded,
                GangStatus::Completed => {
                    self.reset_to_idle(&mut state);
                    return TaskOutcome::Completed;
                }
                GangStatus::Aborted => {
                    self.reset_to_idle(&mut state);
                    return TaskOutcome::Aborted;
                }
                _ => self.monitor.wait(&mut state),
            }
        }
    }

    fn reset_to_idle(&self, state: &mut GangState) {
        assert_eq!(state.finished, state.active);
        assert_eq!(state.yielded, 0);
        state.task = None;
        state.status = GangStatus::Inactive;
    }

    /// Asks every worker to park at its next yield point. No-op unless a
    /// task is running.
    pub fn request_yield(&self) {
        let mut state = self.inner.lock();

        if state.status == GangStatus::Active {
            state.status = GangStatus::Yielding;
            self.monitor.notify_all();
        }
    }

    /// Resumes a yielded task in place.
    pub fn continue_task(&self) {
        let mut state = self.inner.lock();
        assert_eq!(state.status, GangStatus::Yielded);
        state.status = GangStatus::Active;
        self.monitor.notify_all();
    }

    /// Tells the task to unwind. Parked workers wake up, observe the abort
    /// and return from their work function. Workers that have not joined
    /// yet never will: `active` is clamped to `started` so the abort does
    /// not wait for them.
    pub fn abort(&self) {
        let mut state = self.inner.lock();

        match state.status {
            GangStatus::Active | GangStatus::Yielding | GangStatus::Yielded => {
                state.active = state.started;

                state.status = if state.finished == state.active {
                    GangStatus::Aborted
                } else {
                    GangStatus::Aborting
                };

                self.monitor.notify_all();
            }
            _ => {}
        }
    }

    fn worker_loop(&self, worker_id: usize) {
        let mut last_epoch = 0;

        loop {
            let task = {
                let mut state = self.inner.lock();

                loop {
                    if state.shutdown {
                        return;
                    }

                    let joinable = matches!(
                        state.status,
                        GangStatus::Active | GangStatus::Yielding | GangStatus::Yielded
                    ) && state.epoch != last_epoch
                        && state.started < state.active;

                    if joinable {
                        break;
                    }

                    self.monitor.wait(&mut state);
                }

                last_epoch = state.epoch;
                state.started += 1;
                state.verify_counters();
                state.task.as_ref().expect("task missing").clone()
            };

            let scope = YieldScope { gang: self };
            task.work(worker_id, &scope);
            self.note_finish();
        }
    }

    fn note_finish(&self) {
        let mut state = self.inner.lock();
        state.finished += 1;
        state.verify_counters();

        if state.finished == state.active {
            state.status = if state.status == GangStatus::Aborting {
                GangStatus::Aborted
            } else {
                GangStatus::Completed
            };
            self.monitor.notify_all();
        } else if state.yielded + state.finished == state.active
            && state.status == GangStatus::Yielding
        {
            state.status = GangStatus::Yielded;
            self.monitor.notify_all();
        }
    }

    fn park_at_yield(&self) {
        let mut state = self.inner.lock();

        if !matches!(state.status, GangStatus::Yielding | GangStatus::Yielded) {
            return;
        }

        state.yielded += 1;
        state.verify_counters();

        if state.yielded + state.finished == state.active && state.status == GangStatus::Yielding {
            state.status = GangStatus::Yielded;
            self.monitor.notify_all();
        }

        while matches!(state.status, GangStatus::Yielding | GangStatus::Yielded) {
            self.monitor.wait(&mut state);
        }

        state.yielded -= 1;
    }

    fn status_is_aborting(&self) -> bool {
        matches!(
            self.inner.lock().status,
            GangStatus::Aborting | GangStatus::Aborted
        )
    }

    fn status_is_yielding(&self) -> bool {
        matches!(
            self.inner.lock().status,
            GangStatus::Yielding | GangStatus::Yielded
        )
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.inner.lock();
            assert_eq!(state.status, GangStatus::Inactive);
            state.shutdown = true;
            self.monitor.notify_all();
        }

        let mut threads = self.threads.lock();

        for handle in threads.drain(..) {
            handle.join().expect("gc worker panicked");
        }
    }
}

/// Per-worker handle into the gang's yield protocol.
pub struct YieldScope<'a> {
    gang: &'a YieldingGang,
}

impl<'a> YieldScope<'a> {
    pub fn should_yield(&self) -> bool {
        self.gang.status_is_yielding()
    }

    pub fn is_aborted(&self) -> bool {
        self.gang.status_is_aborting()
    }

    /// Parks the worker if a yield is pending. Returns false when the task
    /// is aborting and the worker should unwind without finishing its work.
    pub fn yield_point(&self) -> bool {
        if self.gang.status_is_yielding() {
            self.gang.park_at_yield();
        }

        !self.is_aborted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingTask {
        participants: AtomicUsize,
    }

    impl YieldingTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn work(&self, _worker_id: usize, _scope: &YieldScope) {
            self.participants.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SpinTask {
        stop: AtomicBool,
        iterations: AtomicUsize,
    }

    impl SpinTask {
        fn new() -> SpinTask {
            SpinTask {
                stop: AtomicBool::new(false),
                iterations: AtomicUsize::new(0),
            }
        }
    }

    impl YieldingTask for SpinTask {
        fn name(&self) -> &'static str {
            "spin"
        }

        fn work(&self, _worker_id: usize, scope: &YieldScope) {
            while !self.stop.load(Ordering::SeqCst) {
                self.iterations.fetch_add(1, Ordering::SeqCst);

                if !scope.yield_point() {
                    return;
                }
            }
        }
    }

    #[test]
    fn task_runs_on_requested_workers() {
        let gang = YieldingGang::new(4);

        let task = Arc::new(CountingTask {
            participants: AtomicUsize::new(0),
        });

        gang.start(task.clone(), 3);
        assert_eq!(gang.wait(), TaskOutcome::Completed);
        assert_eq!(task.participants.load(Ordering::SeqCst), 3);

        gang.shutdown();
    }

    #[test]
    fn yield_freezes_and_continue_resumes() {
        let gang = YieldingGang::new(2);
        let task = Arc::new(SpinTask::new());

        gang.start(task.clone(), 2);
        gang.request_yield();
        assert_eq!(gang.wait(), TaskOutcome::Yielded);

        // Every worker is parked: progress stops completely.
        let frozen = task.iterations.load(Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(task.iterations.load(Ordering::SeqCst), frozen);

        task.stop.store(true, Ordering::SeqCst);
        gang.continue_task();
        assert_eq!(gang.wait(), TaskOutcome::Completed);
        assert!(task.iterations.load(Ordering::SeqCst) >= frozen);

        gang.shutdown();
    }

    #[test]
    fn abort_unwinds_running_task() {
        let gang = YieldingGang::new(2);
        let task = Arc::new(SpinTask::new());

        gang.start(task.clone(), 2);

        while task.iterations.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }

        gang.abort();
        assert_eq!(gang.wait(), TaskOutcome::Aborted);

        gang.shutdown();
    }

    #[test]
    fn abort_before_workers_join_does_not_hang() {
        let gang = YieldingGang::new(2);

        // Back-to-back start/abort: depending on scheduling, zero, one or
        // both workers have joined when the abort lands. The gang must
        // terminate without waiting for workers that never joined.
        for _ in 0..100 {
            let task = Arc::new(SpinTask::new());
            gang.start(task, 2);
            gang.abort();
            assert_eq!(gang.wait(), TaskOutcome::Aborted);
        }

        gang.shutdown();
    }

    #[test]
    fn abort_while_yielded_unwinds_parked_workers() {
        let gang = YieldingGang::new(2);
        let task = Arc::new(SpinTask::new());

        gang.start(task.clone(), 2);
        gang.request_yield();
        assert_eq!(gang.wait(), TaskOutcome::Yielded);

        gang.abort();
        assert_eq!(gang.wait(), TaskOutcome::Aborted);

        gang.shutdown();
    }

    #[test]
    fn gang_is_reusable_across_tasks() {
        let gang = YieldingGang::new(3);

        for _ in 0..4 {
            let task = Arc::new(CountingTask {
                participants: AtomicUsize::new(0),
            });

            gang.start(task.clone(), 3);
            assert_eq!(gang.wait(), TaskOutcome::Completed);
            assert_eq!(task.participants.load(Ordering::SeqCst), 3);
        }

        gang.shutdown();
    }
}
