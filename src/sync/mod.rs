//! Rendezvous barriers that bracket every phase transition of a run.
//!
//! - `BlockingBarrier`: parks waiting threads on a condition variable.
//! - `SpinBarrier`: sense-reversing busy-wait barrier. Waiters burn their
//!   processor but leave the barrier within a few hundred nanoseconds of the
//!   last arrival.
//!
//! Both are reusable across any number of phases without reconstruction and
//! can be poisoned: a worker that dies mid-run poisons the barrier so its
//! peers return an error instead of waiting for it forever.
//! `StartGate` holds freshly spawned workers back until the driver knows the
//! whole team exists.
mod spin;

use std::sync::{Condvar, Mutex, PoisonError};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::spin::SpinBarrier;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("barrier poisoned by a failed participant")]
pub struct BarrierPoisoned;

/// An N-party reusable barrier.
pub trait PhaseBarrier: Send + Sync {
    /// Blocks until all participants arrived. Exactly one participant per
    /// phase gets `Ok(true)`. Fails once the barrier is poisoned.
    fn wait(&self) -> Result<bool, BarrierPoisoned>;
    /// Releases all current and future waiters with an error.
    fn poison(&self);
    fn participants(&self) -> usize;
}

#[derive(Debug)]
struct BlockingState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

#[derive(Debug)]
pub struct BlockingBarrier {
    state: Mutex<BlockingState>,
    released: Condvar,
    participants: usize,
}

impl BlockingBarrier {
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "a barrier needs at least one participant");
        BlockingBarrier {
            state: Mutex::new(BlockingState {
                arrived: 0,
                generation: 0,
                poisoned: false,
            }),
            released: Condvar::new(),
            participants,
        }
    }
}

impl PhaseBarrier for BlockingBarrier {
    fn wait(&self) -> Result<bool, BarrierPoisoned> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.poisoned {
            return Err(BarrierPoisoned);
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation += 1;
            self.released.notify_all();
            return Ok(true);
        }
        let state = self
            .released
            .wait_while(state, |s| s.generation == generation && !s.poisoned)
            .unwrap_or_else(PoisonError::into_inner);
        // a phase that completed before the poisoning still counts
        if state.generation == generation {
            Err(BarrierPoisoned)
        } else {
            Ok(false)
        }
    }

    fn poison(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.poisoned = true;
        self.released.notify_all();
    }

    fn participants(&self) -> usize {
        self.participants
    }
}

/// The barrier implementation to synchronise workers with.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierKind {
    #[default]
    Blocking,
    Spin,
}

impl BarrierKind {
    pub fn create(&self, participants: usize) -> Box<dyn PhaseBarrier> {
        match self {
            BarrierKind::Blocking => Box::new(BlockingBarrier::new(participants)),
            BarrierKind::Spin => Box::new(SpinBarrier::new(participants)),
        }
    }
}

/// One-shot gate opened by the driver once, either to start every waiting
/// worker or to send them all home.
#[derive(Debug, Default)]
pub struct StartGate {
    state: Mutex<Option<bool>>,
    opened: Condvar,
}

impl StartGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, start: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = Some(start);
        self.opened.notify_all();
    }

    /// Blocks until the gate is opened. Returns whether to start.
    pub fn wait(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self
            .opened
            .wait_while(state, |state| state.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::thread;

    use super::{BarrierKind, BarrierPoisoned, PhaseBarrier, StartGate};

    /// Runs `phases` barrier phases on `n` threads and checks that no thread
    /// ever observes a counter from a later phase before all peers finished
    /// the earlier one.
    fn check_phases(kind: BarrierKind, n: usize, phases: usize) {
        let barrier: Arc<dyn PhaseBarrier> = Arc::from(kind.create(n));
        let arrived = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let arrived = Arc::clone(&arrived);
                let leaders = Arc::clone(&leaders);
                thread::spawn(move || {
                    for phase in 0..phases {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        if barrier.wait().unwrap() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        assert!(arrived.load(Ordering::SeqCst) >= (phase + 1) * n);
                        barrier.wait().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(arrived.load(Ordering::SeqCst), n * phases);
        assert_eq!(leaders.load(Ordering::SeqCst), phases);
    }

    #[test]
    fn test_blocking_barrier_phases() {
        check_phases(BarrierKind::Blocking, 4, 50);
    }

    #[test]
    fn test_spin_barrier_phases() {
        check_phases(BarrierKind::Spin, 4, 50);
    }

    #[test]
    fn test_single_participant_never_blocks() {
        for kind in [BarrierKind::Blocking, BarrierKind::Spin] {
            let barrier = kind.create(1);
            assert_eq!(barrier.participants(), 1);
            for _ in 0..10 {
                assert!(barrier.wait().unwrap());
            }
        }
    }

    #[test]
    fn test_poison_releases_waiters() {
        for kind in [BarrierKind::Blocking, BarrierKind::Spin] {
            let barrier = kind.create(3);
            let results: Vec<_> = thread::scope(|s| {
                let waiters: Vec<_> = (0..2).map(|_| s.spawn(|| barrier.wait())).collect();
                // the third participant never arrives
                thread::sleep(std::time::Duration::from_millis(20));
                barrier.poison();
                waiters.into_iter().map(|w| w.join().unwrap()).collect()
            });
            assert_eq!(results, vec![Err(BarrierPoisoned), Err(BarrierPoisoned)]);
            // late arrivals fail right away
            assert_eq!(barrier.wait(), Err(BarrierPoisoned));
        }
    }

    #[test]
    fn test_start_gate() {
        for start in [true, false] {
            let gate = StartGate::new();
            let started = AtomicUsize::new(0);
            thread::scope(|s| {
                for _ in 0..3 {
                    s.spawn(|| {
                        if gate.wait() {
                            started.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
                gate.open(start);
            });
            assert_eq!(started.load(Ordering::SeqCst), if start { 3 } else { 0 });
            // an opened gate stays open
            assert_eq!(gate.wait(), start);
        }
    }
}
