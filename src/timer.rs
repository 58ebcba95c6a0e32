//! Wall-clock time source for the measurement protocol.
//!
//! Only the leader thread of a run ever reads the clock, so a timer needs to
//! be shareable but not particularly cheap to query.
use std::time::Instant;

/// Number of consecutive readings sampled when estimating clock resolution.
const RESOLUTION_SAMPLES: usize = 10_000;

pub trait Timer: Send + Sync {
    /// Monotonic time in seconds since an arbitrary, fixed origin.
    fn seconds(&self) -> f64;
    /// Smallest observable difference between two readings, in seconds.
    fn resolution(&self) -> f64;
}

/// `Instant` based timer. The resolution is estimated once at construction.
#[derive(Debug)]
pub struct MonotonicTimer {
    origin: Instant,
    resolution: f64,
}

impl MonotonicTimer {
    pub fn new() -> Self {
        let origin = Instant::now();
        let resolution = estimate_resolution(|| origin.elapsed().as_secs_f64());
        debug!("clock resolution estimated at {:.2} ns", resolution * 1e9);
        MonotonicTimer { origin, resolution }
    }
}

impl Default for MonotonicTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for MonotonicTimer {
    fn seconds(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn resolution(&self) -> f64 {
        self.resolution
    }
}

/// Smallest positive step between consecutive readings of `now`.
///
/// Falls back to one nanosecond if no step was observed at all.
fn estimate_resolution(now: impl Fn() -> f64) -> f64 {
    let mut best = f64::INFINITY;
    let mut prev = now();
    for _ in 0..RESOLUTION_SAMPLES {
        let mut next = now();
        // spin until the clock ticks, bounded so a frozen clock cannot hang us
        for _ in 0..1_000 {
            if next != prev {
                break;
            }
            next = now();
        }
        let delta = next - prev;
        if delta > 0.0 && delta < best {
            best = delta;
        }
        prev = next;
    }
    if best.is_finite() {
        best
    } else {
        1e-9
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::{estimate_resolution, MonotonicTimer, Timer};

    /// Replays a fixed list of readings, repeating the last one forever.
    pub(crate) struct ScriptedTimer {
        readings: Mutex<Vec<f64>>,
        resolution: f64,
    }

    impl ScriptedTimer {
        pub(crate) fn new(mut readings: Vec<f64>, resolution: f64) -> Self {
            readings.reverse();
            ScriptedTimer {
                readings: Mutex::new(readings),
                resolution,
            }
        }
    }

    impl Timer for ScriptedTimer {
        fn seconds(&self) -> f64 {
            let mut readings = self.readings.lock().unwrap();
            if readings.len() > 1 {
                readings.pop().unwrap()
            } else {
                readings[0]
            }
        }

        fn resolution(&self) -> f64 {
            self.resolution
        }
    }

    #[test]
    fn test_monotonic_timer_advances() {
        let timer = MonotonicTimer::new();
        let a = timer.seconds();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = timer.seconds();
        assert!(b > a);
        assert!(timer.resolution() > 0.0);
        assert!(timer.resolution() < 1e-2);
    }

    #[test]
    fn test_estimate_resolution_of_coarse_clock() {
        let ticks = Mutex::new(0u64);
        let res = estimate_resolution(|| {
            let mut t = ticks.lock().unwrap();
            *t += 1;
            // a clock that only moves every 4th call, in 1 ms steps
            (*t / 4) as f64 * 1e-3
        });
        assert!((res - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_estimate_resolution_of_frozen_clock() {
        assert_eq!(estimate_resolution(|| 42.0), 1e-9);
    }

    #[test]
    fn test_scripted_timer_repeats_last() {
        let timer = ScriptedTimer::new(vec![1.0, 2.0], 1e-9);
        assert_eq!(timer.seconds(), 1.0);
        assert_eq!(timer.seconds(), 2.0);
        assert_eq!(timer.seconds(), 2.0);
    }
}
