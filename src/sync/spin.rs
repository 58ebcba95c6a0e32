use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use super::{BarrierPoisoned, PhaseBarrier};

/// Spins this many times before yielding the processor to other threads.
const SPINS_BEFORE_YIELD: u32 = 1 << 14;

/// Sense-reversing centralized barrier.
///
/// The last thread to arrive resets the counter and flips the global sense,
/// releasing everybody spinning on the previous sense.
#[derive(Debug)]
pub struct SpinBarrier {
    participants: usize,
    remaining: AtomicUsize,
    sense: AtomicBool,
    poisoned: AtomicBool,
}

impl SpinBarrier {
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "a barrier needs at least one participant");
        SpinBarrier {
            participants,
            remaining: AtomicUsize::new(participants),
            sense: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        }
    }
}

impl PhaseBarrier for SpinBarrier {
    fn wait(&self) -> Result<bool, BarrierPoisoned> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(BarrierPoisoned);
        }
        let local_sense = !self.sense.load(Ordering::Acquire);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.remaining.store(self.participants, Ordering::Relaxed);
            self.sense.store(local_sense, Ordering::Release);
            return Ok(true);
        }
        let mut spins = 0u32;
        while self.sense.load(Ordering::Acquire) != local_sense {
            if self.poisoned.load(Ordering::Acquire) {
                return Err(BarrierPoisoned);
            }
            if spins < SPINS_BEFORE_YIELD {
                spins += 1;
                spin_loop();
            } else {
                thread::yield_now();
            }
        }
        Ok(false)
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    fn participants(&self) -> usize {
        self.participants
    }
}
