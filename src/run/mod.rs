//! The multi-threaded measurement protocol.
//!
//! Every worker lays out its own chains, then all workers move through the
//! phases below in lockstep, each transition bracketed by barriers so no
//! thread enters or leaves a timed region early:
//!
//! 1. setup: pin, allocate, link; failures are published before the first
//!    barrier so peers abort instead of waiting forever
//! 2. calibration (iterations = 0 only): doubling search for the iteration
//!    count, timed by thread 0
//! 3. measurement: `experiments` timed trials, thread 0 keeps the minimum
mod protocol;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use anyhow::{anyhow, bail, Context};
use indicatif::ProgressBar;
use serde::Serialize;

use crate::chain::{build_chain, ChainMemory, Link};
use crate::chase::{select_chase, ChaseLoop};
use crate::experiment::Experiment;
use crate::numa::NumaPlacement;
use crate::sync::{BarrierPoisoned, PhaseBarrier, StartGate};
use crate::timer::Timer;
use crate::util::Rng;

pub use self::protocol::{
    calibrate, calibrated_iterations, calibration_bound, RunState, SharedResult,
};

/// What a completed run hands to reporting.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ops_per_chain: u64,
    pub iterations: u64,
    pub best_seconds: f64,
    pub samples: Vec<f64>,
    pub clock_resolution: f64,
    pub chase: &'static str,
}

/// Runs the experiment on `exp.num_threads` worker threads.
///
/// `progress`, if given, is advanced once per completed trial.
pub fn execute(
    exp: &Experiment,
    numa: &dyn NumaPlacement,
    timer: &dyn Timer,
    progress: Option<&ProgressBar>,
) -> anyhow::Result<RunSummary> {
    let chase = select_chase(exp)?;
    let barrier = exp.barrier.create(exp.num_threads);
    let shared = SharedResult::new(exp.iterations);
    let gate = StartGate::new();

    let results: Vec<anyhow::Result<()>> = thread::scope(|s| {
        let mut handles = Vec::with_capacity(exp.num_threads);
        let mut spawn_error = None;
        for id in 0..exp.num_threads {
            let worker = Worker {
                id,
                exp,
                barrier: barrier.as_ref(),
                shared: &shared,
                timer,
                chase: chase.as_ref(),
                numa,
                progress,
            };
            let gate = &gate;
            let spawned = thread::Builder::new()
                .name(format!("pchase-{}", id))
                .spawn_scoped(s, move || {
                    if !gate.wait() {
                        bail!("worker {} not started", id);
                    }
                    let barrier = worker.barrier;
                    let result = panic::catch_unwind(AssertUnwindSafe(|| worker.run()))
                        .unwrap_or_else(|payload| {
                            Err(anyhow!("worker {} panicked: {}", id, panic_message(&*payload)))
                        });
                    // peers blocked at the next phase must not wait for us
                    if result.is_err() {
                        barrier.poison();
                    }
                    result
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    spawn_error = Some(anyhow!(e).context(format!("failed to spawn worker {}", id)));
                    break;
                }
            }
        }
        gate.open(spawn_error.is_none());

        let mut results: Vec<_> = spawn_error.into_iter().map(Err).collect();
        for (id, handle) in handles.into_iter().enumerate() {
            results.push(
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("worker {} panicked", id))),
            );
        }
        results
    });
    // report the failure that poisoned the barrier, not its echoes
    let mut errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
    if let Some(first) = errors
        .iter()
        .position(|e| e.downcast_ref::<BarrierPoisoned>().is_none())
    {
        return Err(errors.swap_remove(first));
    }
    if let Some(error) = errors.into_iter().next() {
        return Err(error);
    }

    let state = shared.into_inner();
    if state.samples.is_empty() {
        bail!(
            "none of the {} trial(s) produced a positive elapsed time",
            exp.experiments
        );
    }
    Ok(RunSummary {
        ops_per_chain: state.ops_per_chain,
        iterations: state.iterations,
        best_seconds: state.best_seconds,
        samples: state.samples,
        clock_resolution: timer.resolution(),
        chase: chase.name(),
    })
}

struct Worker<'a> {
    id: usize,
    exp: &'a Experiment,
    barrier: &'a dyn PhaseBarrier,
    shared: &'a SharedResult,
    timer: &'a dyn Timer,
    chase: &'a dyn ChaseLoop,
    numa: &'a dyn NumaPlacement,
    progress: Option<&'a ProgressBar>,
}

impl Worker<'_> {
    fn is_timekeeper(&self) -> bool {
        self.id == 0
    }

    fn run(&self) -> anyhow::Result<()> {
        let setup = self.setup();
        if setup.is_err() {
            self.shared.lock().setup_failures += 1;
        }
        self.barrier.wait()?;
        let failures = self.shared.lock().setup_failures;
        // keeps the chain memory alive until the run is over
        let (_memory, heads) = setup?;
        if failures > 0 {
            bail!("worker {} aborting, {} peer(s) failed setup", self.id, failures);
        }

        if self.exp.iterations == 0 {
            self.calibrate(&heads)?;
        }
        let iterations = self.shared.lock().iterations;
        self.measure(&heads, iterations)?;

        self.barrier.wait()?;
        Ok(())
    }

    fn setup(&self) -> anyhow::Result<(Vec<ChainMemory>, Vec<*const Link>)> {
        let exp = self.exp;
        let node = exp.thread_domain[self.id];
        match self.numa.run_on_node(node) {
            Ok(()) => debug!("worker {} running on domain {}", self.id, node),
            Err(e) => warn!("worker {} could not be bound to domain {}: {}", self.id, node, e),
        }

        let mut rng = Rng::from_seed(exp.thread_seeds[self.id]);
        let mut memory = Vec::with_capacity(exp.chains_per_thread);
        let mut heads = Vec::with_capacity(exp.chains_per_thread);
        for chain in 0..exp.chains_per_thread {
            let mut chain_memory = ChainMemory::new(
                exp.geometry.links_per_chain,
                exp.chain_domain[self.id][chain],
                self.numa,
            )
            .with_context(|| format!("worker {} chain {}", self.id, chain))?;
            let root = build_chain(&mut chain_memory, exp, &mut rng)?;
            if log_enabled!(log::Level::Debug) {
                let walked = chain_memory.walk(root.root).count() as u64;
                if walked != root.ops {
                    bail!(
                        "worker {} chain {}: walked {} links, linked {}",
                        self.id,
                        chain,
                        walked,
                        root.ops
                    );
                }
            }
            // every chain has the same length, the last writer wins
            self.shared.lock().ops_per_chain = root.ops;
            heads.push(root.root);
            memory.push(chain_memory);
        }
        Ok((memory, heads))
    }

    /// One barrier-bracketed timed round. Every worker returns the elapsed
    /// time published by thread 0.
    fn timed_round(&self, heads: &[*const Link], iterations: u64) -> Result<f64, BarrierPoisoned> {
        self.barrier.wait()?;
        let start = if self.is_timekeeper() {
            self.timer.seconds()
        } else {
            0.0
        };
        self.barrier.wait()?;
        unsafe { self.chase.chase(heads, iterations) };
        self.barrier.wait()?;
        if self.is_timekeeper() {
            let elapsed = self.timer.seconds() - start;
            self.shared.lock().calibration_elapsed = elapsed;
        }
        self.barrier.wait()?;
        Ok(self.shared.lock().calibration_elapsed)
    }

    fn calibrate(&self, heads: &[*const Link]) -> Result<(), BarrierPoisoned> {
        let bound = calibration_bound(self.timer.resolution());
        let (iters, elapsed) = calibrate(bound, |iters| self.timed_round(heads, iters))?;
        if self.is_timekeeper() {
            let iterations = calibrated_iterations(self.exp.seconds, iters, elapsed);
            info!(
                "Calibrated {} iteration(s) per experiment ({} in {:.3} s)",
                iterations,
                iters >> 1,
                elapsed
            );
            self.shared.lock().iterations = iterations;
        }
        self.barrier.wait()?;
        Ok(())
    }

    fn measure(&self, heads: &[*const Link], iterations: u64) -> Result<(), BarrierPoisoned> {
        for trial in 0..self.exp.experiments {
            self.barrier.wait()?;
            let start = if self.is_timekeeper() {
                self.timer.seconds()
            } else {
                0.0
            };
            self.barrier.wait()?;
            unsafe { self.chase.chase(heads, iterations) };
            self.barrier.wait()?;
            let stop = if self.is_timekeeper() {
                self.timer.seconds()
            } else {
                0.0
            };
            self.barrier.wait()?;
            if self.is_timekeeper() {
                let delta = stop - start;
                debug!("trial {}: {:.6} s", trial, delta);
                self.shared.lock().record_trial(delta);
                if let Some(progress) = self.progress {
                    progress.inc(1);
                }
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::execute;
    use crate::chase::ChaseStrategy;
    use crate::experiment::{AccessKind, Experiment, ExperimentConfig};
    use crate::numa::NoNuma;
    use crate::sync::BarrierKind;
    use crate::timer::tests::ScriptedTimer;
    use crate::timer::{MonotonicTimer, Timer};

    /// A clock that dies on first use.
    struct BrokenTimer;

    impl Timer for BrokenTimer {
        fn seconds(&self) -> f64 {
            panic!("clock unplugged");
        }

        fn resolution(&self) -> f64 {
            1e-9
        }
    }

    fn small_config() -> ExperimentConfig {
        ExperimentConfig {
            bytes_per_line: 64,
            bytes_per_page: 4096,
            bytes_per_chain: 16 * 1024,
            seed: Some(11),
            ..Default::default()
        }
    }

    #[test]
    fn test_calibrated_run_on_two_threads() -> anyhow::Result<()> {
        let config = ExperimentConfig {
            num_threads: 2,
            iterations: 0,
            seconds: 0.0,
            experiments: 1,
            ..small_config()
        };
        let exp = Experiment::from_config(&config, 1)?;
        let summary = execute(&exp, &NoNuma, &MonotonicTimer::new(), None)?;
        assert_eq!(summary.ops_per_chain, 256);
        assert!(summary.iterations >= 1);
        assert!(summary.best_seconds > 0.0 && summary.best_seconds.is_finite());
        assert!(summary.samples.iter().all(|&s| s >= summary.best_seconds));
        Ok(())
    }

    #[test]
    fn test_fixed_iterations_keep_minimum() -> anyhow::Result<()> {
        let config = ExperimentConfig {
            iterations: 3,
            experiments: 3,
            strategy: ChaseStrategy::Generic,
            barrier: BarrierKind::Spin,
            ..small_config()
        };
        let exp = Experiment::from_config(&config, 1)?;
        // start/stop pairs: 0.5 s, a frozen clock, then 0.25 s
        let timer = ScriptedTimer::new(vec![1.0, 1.5, 2.0, 2.0, 3.0, 3.25], 1e-9);
        let summary = execute(&exp, &NoNuma, &timer, None)?;
        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.samples, vec![0.5, 0.25]);
        assert_eq!(summary.best_seconds, 0.25);
        Ok(())
    }

    #[test]
    fn test_frozen_clock_fails_the_run() -> anyhow::Result<()> {
        let config = ExperimentConfig {
            iterations: 1,
            experiments: 2,
            ..small_config()
        };
        let exp = Experiment::from_config(&config, 1)?;
        let timer = ScriptedTimer::new(vec![7.0], 1e-9);
        assert!(execute(&exp, &NoNuma, &timer, None).is_err());
        Ok(())
    }

    #[test]
    fn test_panicking_worker_fails_the_run() -> anyhow::Result<()> {
        for barrier in [BarrierKind::Blocking, BarrierKind::Spin] {
            for iterations in [0, 1] {
                let config = ExperimentConfig {
                    num_threads: 2,
                    iterations,
                    barrier,
                    ..small_config()
                };
                let exp = Experiment::from_config(&config, 1)?;
                let err = execute(&exp, &NoNuma, &BrokenTimer, None).unwrap_err();
                let message = format!("{:#}", err);
                assert!(message.contains("worker 0 panicked"), "{}", message);
                assert!(message.contains("clock unplugged"), "{}", message);
            }
        }
        Ok(())
    }

    #[test]
    fn test_setup_failure_aborts_all_workers() -> anyhow::Result<()> {
        let config = ExperimentConfig {
            num_threads: 2,
            // far beyond any address space, mmap has to refuse
            bytes_per_chain: 1 << 60,
            bytes_per_page: 1 << 40,
            ..small_config()
        };
        let exp = Experiment::from_config(&config, 1)?;
        let err = execute(&exp, &NoNuma, &MonotonicTimer::new(), None).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("mmap"), "{}", message);
        Ok(())
    }

    #[test]
    fn test_multi_chain_patterns() -> anyhow::Result<()> {
        for (access, stride) in [
            (AccessKind::Random, 1),
            (AccessKind::Forward, 2),
            (AccessKind::Reverse, 1),
        ] {
            let config = ExperimentConfig {
                num_threads: 3,
                chains_per_thread: 4,
                iterations: 2,
                experiments: 2,
                access,
                stride,
                ..small_config()
            };
            let exp = Experiment::from_config(&config, 1)?;
            let summary = execute(&exp, &NoNuma, &MonotonicTimer::new(), None)?;
            assert_eq!(summary.ops_per_chain, 256 / stride as u64);
            assert_eq!(summary.iterations, 2);
        }
        Ok(())
    }
}
