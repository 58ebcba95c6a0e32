use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::util::{MAX_CALIBRATION_ITERS, MIN_CALIBRATION_SECONDS};

/// A calibration round has to take longer than this before its iteration
/// count is trusted.
pub fn calibration_bound(resolution: f64) -> f64 {
    MIN_CALIBRATION_SECONDS.max(10.0 * resolution)
}

/// Doubling search. Calls `round(iters)` for `iters = 1, 2, 4, ...` while the
/// previous round took at most `bound` seconds.
///
/// Returns the doubled count following the last round together with that
/// round's elapsed time, which is what [`calibrated_iterations`] expects.
/// Stops at `MAX_CALIBRATION_ITERS` if the clock never advances. A failing
/// round ends the search with its error.
pub fn calibrate<E>(
    bound: f64,
    mut round: impl FnMut(u64) -> Result<f64, E>,
) -> Result<(u64, f64), E> {
    let mut iters: u64 = 1;
    let mut elapsed = 0.0;
    while elapsed <= bound && iters <= MAX_CALIBRATION_ITERS {
        elapsed = round(iters)?;
        debug!("calibration: {} iteration(s) took {:.6} s", iters, elapsed);
        iters <<= 1;
    }
    Ok((iters, elapsed))
}

/// Iterations for one experiment: half of `seconds` worth of the calibration
/// rate if a duration was requested, one second worth otherwise. At least 1.
pub fn calibrated_iterations(seconds: f64, iters: u64, elapsed: f64) -> u64 {
    if elapsed <= 0.0 {
        return iters.clamp(1, MAX_CALIBRATION_ITERS);
    }
    let target = if seconds > 0.0 {
        0.5 * seconds * iters as f64 / elapsed
    } else {
        iters as f64 / elapsed
    };
    ((0.9999 + target) as u64).clamp(1, MAX_CALIBRATION_ITERS)
}

/// State shared by all workers of a run. Written under the lock; the timing
/// fields only ever by thread 0.
#[derive(Debug)]
pub struct RunState {
    pub ops_per_chain: u64,
    pub iterations: u64,
    pub best_seconds: f64,
    pub samples: Vec<f64>,
    pub calibration_elapsed: f64,
    pub setup_failures: usize,
}

impl RunState {
    /// Folds a trial into the best time. Non-positive deltas are dropped.
    pub fn record_trial(&mut self, delta: f64) -> bool {
        if delta <= 0.0 {
            warn!("Discarding non-positive trial time {:e} s", delta);
            return false;
        }
        self.samples.push(delta);
        self.best_seconds = self.best_seconds.min(delta);
        true
    }
}

#[derive(Debug)]
pub struct SharedResult {
    state: Mutex<RunState>,
}

impl SharedResult {
    pub fn new(iterations: u64) -> Self {
        SharedResult {
            state: Mutex::new(RunState {
                ops_per_chain: 0,
                iterations,
                best_seconds: f64::INFINITY,
                samples: Vec::new(),
                calibration_elapsed: 0.0,
                setup_failures: 0,
            }),
        }
    }

    /// A panicking worker fails the whole run, so a poisoned lock still holds
    /// usable state.
    pub fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> RunState {
        self.state.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{calibrate, calibrated_iterations, calibration_bound, SharedResult};
    use crate::util::MAX_CALIBRATION_ITERS;

    #[test]
    fn test_calibration_bound() {
        assert_eq!(calibration_bound(1e-9), 0.2);
        assert_eq!(calibration_bound(0.1), 1.0);
    }

    #[test]
    fn test_calibration_doubles_until_bound() {
        let mut seen = Vec::new();
        // 1 ms per iteration
        let (iters, elapsed) = calibrate(0.2, |iters| {
            seen.push(iters);
            Ok::<_, ()>(iters as f64 * 1e-3)
        })
        .unwrap();
        assert!(seen.windows(2).all(|w| w[1] == 2 * w[0]));
        assert_eq!(seen.first(), Some(&1));
        assert_eq!(*seen.last().unwrap(), 256);
        assert_eq!(iters, 512);
        assert!(elapsed > 0.2);
        assert!(calibrated_iterations(0.0, iters, elapsed) >= 1);
    }

    #[test]
    fn test_calibration_stops_on_frozen_clock() {
        let mut rounds = 0;
        let mut laps = 0;
        let (iters, elapsed) = calibrate(0.2, |iters| {
            rounds += 1;
            laps += iters;
            Ok::<_, ()>(0.0)
        })
        .unwrap();
        assert_eq!(rounds, 25);
        // the whole search stays within a few seconds of chasing
        assert!(laps < 2 * MAX_CALIBRATION_ITERS);
        assert!(iters > MAX_CALIBRATION_ITERS);
        assert_eq!(calibrated_iterations(1.0, iters, elapsed), MAX_CALIBRATION_ITERS);
    }

    #[test]
    fn test_calibration_stops_on_failed_round() {
        let mut rounds = 0;
        let result = calibrate(0.2, |iters| {
            rounds += 1;
            if iters == 4 {
                Err("peer gone")
            } else {
                Ok(0.0)
            }
        });
        assert_eq!(result, Err("peer gone"));
        assert_eq!(rounds, 3);
    }

    #[test]
    fn test_calibrated_iterations() {
        // 512 iterations at 0.256 s: 2000 iterations per second
        assert_eq!(calibrated_iterations(0.0, 512, 0.256), 2000);
        assert_eq!(calibrated_iterations(2.0, 512, 0.256), 2000);
        assert_eq!(calibrated_iterations(1.0, 512, 0.256), 1000);
        assert_eq!(calibrated_iterations(1.0, 1, 1000.0), 1);
    }

    #[test]
    fn test_best_is_minimum_of_positive_trials() {
        let shared = SharedResult::new(1);
        {
            let mut state = shared.lock();
            for delta in [0.5, 0.3, -0.1, 0.0, 0.4, 0.31] {
                state.record_trial(delta);
            }
        }
        let state = shared.into_inner();
        assert_eq!(state.best_seconds, 0.3);
        assert_eq!(state.samples, vec![0.5, 0.3, 0.4, 0.31]);
    }
}
