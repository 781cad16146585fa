use parking_lot::{RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// World-stop coordination between mutators and the collector.
///
/// Mutators hold a shared guard while touching the heap; a collector pause
/// takes the lock exclusively, so it begins only once every mutator has
/// reached a safe boundary and blocks new mutator work until it ends.
/// parking_lot's writer preference keeps pauses from starving behind a
/// stream of mutators.
pub struct Safepoint {
    world: RwLock<()>,
    pauses: AtomicUsize,
}

pub struct MutatorScope<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl Safepoint {
    pub fn new() -> Safepoint {
        Safepoint {
            world: RwLock::new(()),
            pauses: AtomicUsize::new(0),
        }
    }

    /// Enters mutator mode. Blocks while a pause is in progress.
    pub fn mutator(&self) -> MutatorScope<'_> {
        MutatorScope {
            _guard: self.world.read(),
        }
    }

    /// Runs `f` with the world stopped. Must not be called from a thread
    /// holding a `MutatorScope`.
    pub fn stop_the_world<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.world.write();
        self.pauses.fetch_add(1, Ordering::Relaxed);
        f()
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn pause_waits_for_mutators() {
        let safepoint = Arc::new(Safepoint::new());
        let in_pause = Arc::new(AtomicBool::new(false));

        let scope = safepoint.mutator();

        let handle = {
            let safepoint = safepoint.clone();
            let in_pause = in_pause.clone();

            std::thread::spawn(move || {
                safepoint.stop_the_world(|| {
                    in_pause.store(true, Ordering::SeqCst);
                });
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!in_pause.load(Ordering::SeqCst));

        drop(scope);
        handle.join().unwrap();
        assert!(in_pause.load(Ordering::SeqCst));
        assert_eq!(safepoint.pause_count(), 1);
    }
}
