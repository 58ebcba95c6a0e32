//! The pointer-chase hot loop.
//!
//! Two interchangeable strategies implement [`ChaseLoop`]:
//! - [`GenericChase`]: compiled Rust, unrolled over the number of chains.
//! - [`JitChase`]: machine code generated at startup for the exact chain
//!   count, with optional prefetching and padding no-ops (x86-64 only).
//!
//! Both advance every chain one link per step and stop once chain 0 is back
//! at its head, so one lap performs `chains * links` dereferences.
mod generic;
#[cfg(target_arch = "x86_64")]
mod jit;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Link;
use crate::experiment::Experiment;

pub use self::generic::GenericChase;
#[cfg(target_arch = "x86_64")]
pub use self::jit::{JitChase, MAX_JIT_CHAINS};

#[derive(Error, Debug)]
pub enum JitError {
    #[error("code generation is not supported on {0}")]
    UnsupportedArch(&'static str),
    #[error("{chains} chains do not fit the register file, at most {max} are supported")]
    TooManyChains { chains: usize, max: usize },
    #[cfg(target_arch = "x86_64")]
    #[error("assembler error: {0}")]
    Asm(#[from] iced_x86::IcedError),
    #[error("failed to map executable memory: {0}")]
    Mmap(#[from] std::io::Error),
}

/// Cache level hint for the prefetch issued after every step.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchHint {
    #[default]
    None,
    /// All cache levels.
    T0,
    T1,
    T2,
    /// Non-temporal, minimise cache pollution.
    Nta,
}

/// Which chase loop to run.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChaseStrategy {
    /// Generated code where available, the generic loop otherwise.
    #[default]
    Auto,
    Jit,
    Generic,
}

pub trait ChaseLoop: Send + Sync {
    fn name(&self) -> &'static str;

    /// Walks every chain in `heads` once around its cycle and returns the
    /// number of steps taken per chain.
    ///
    /// # Safety
    ///
    /// Every head must be the root of a closed chain that stays alive for the
    /// duration of the call, and all chains must have the same length.
    unsafe fn lap(&self, heads: &[*const Link]) -> u64;

    /// Runs `iterations` laps. Returns the total number of steps per chain.
    ///
    /// # Safety
    ///
    /// Same as [`ChaseLoop::lap`].
    unsafe fn chase(&self, heads: &[*const Link], iterations: u64) -> u64 {
        let mut steps = 0;
        for _ in 0..iterations {
            steps += self.lap(heads);
        }
        steps
    }
}

/// Picks the chase loop configured for `exp`. `Auto` falls back to the
/// generic loop if code generation fails.
pub fn select_chase(exp: &Experiment) -> Result<Box<dyn ChaseLoop>, JitError> {
    let chase: Box<dyn ChaseLoop> = match exp.strategy {
        ChaseStrategy::Generic => Box::new(generic_chase(exp)),
        ChaseStrategy::Jit => Box::new(jit_chase(exp)?),
        ChaseStrategy::Auto => match jit_chase(exp) {
            Ok(jit) => Box::new(jit),
            Err(e) => {
                warn!("Falling back to the generic chase loop: {}", e);
                Box::new(generic_chase(exp))
            }
        },
    };
    info!(
        "Using {} chase loop for {} chain(s)",
        chase.name(),
        exp.chains_per_thread
    );
    Ok(chase)
}

/// Options of `exp` that only generated code honours.
fn ignored_by_generic(exp: &Experiment) -> Vec<&'static str> {
    let mut ignored = Vec::new();
    if exp.prefetch != PrefetchHint::None {
        ignored.push("prefetch hint");
    }
    if exp.loop_length > 0 {
        ignored.push("loop length");
    }
    ignored
}

fn generic_chase(exp: &Experiment) -> GenericChase {
    let ignored = ignored_by_generic(exp);
    if !ignored.is_empty() {
        warn!("The generic chase loop ignores the {}", ignored.join(" and "));
    }
    GenericChase::new(exp.chains_per_thread)
}

#[cfg(target_arch = "x86_64")]
fn jit_chase(exp: &Experiment) -> Result<JitChase, JitError> {
    JitChase::compile(exp.chains_per_thread, exp.prefetch, exp.loop_length)
}

#[cfg(not(target_arch = "x86_64"))]
fn jit_chase(_exp: &Experiment) -> Result<GenericChase, JitError> {
    Err(JitError::UnsupportedArch(std::env::consts::ARCH))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{ignored_by_generic, select_chase, ChaseLoop, ChaseStrategy, PrefetchHint};
    use crate::chain::{forward_slots, ChainMemory, ChainRoot, RandomSlots};
    use crate::experiment::{ChainGeometry, Experiment, ExperimentConfig};
    use crate::numa::NoNuma;
    use crate::util::Rng;

    /// `chains` randomly laid out chains of `links` links each.
    pub(crate) fn make_chains(chains: usize, links: usize) -> (Vec<ChainMemory>, Vec<ChainRoot>) {
        let g = ChainGeometry::from_sizes(8, 64.min(links * 8), links * 8).unwrap();
        let mut rng = Rng::from_seed(chains as u64);
        let mut memories = Vec::new();
        let mut roots = Vec::new();
        for c in 0..chains {
            let mut memory = ChainMemory::new(g.links_per_chain, 0, &NoNuma).unwrap();
            let root = if c % 2 == 0 {
                memory.link(RandomSlots::new(&g, &mut rng))
            } else {
                memory.link(forward_slots(&g, 1))
            };
            roots.push(root.unwrap());
            memories.push(memory);
        }
        (memories, roots)
    }

    /// Checks `chase` takes exactly `links * iterations` steps per chain over
    /// `chains` chains.
    pub(crate) fn check_equivalence(chase: &dyn ChaseLoop, chains: usize) {
        for links in [1, 8, 64, 512] {
            let (_memory, roots) = make_chains(chains, links);
            let heads: Vec<_> = roots.iter().map(|r| r.root).collect();
            for iterations in [0, 1, 3] {
                let steps = unsafe { chase.chase(&heads, iterations) };
                assert_eq!(
                    steps,
                    links as u64 * iterations,
                    "{} with {} chains of {} links",
                    chase.name(),
                    chains,
                    links
                );
            }
        }
    }

    #[test]
    fn test_select_generic() -> anyhow::Result<()> {
        let config = ExperimentConfig {
            strategy: ChaseStrategy::Generic,
            ..Default::default()
        };
        let exp = Experiment::from_config(&config, 1)?;
        assert_eq!(select_chase(&exp)?.name(), "generic");
        Ok(())
    }

    #[test]
    fn test_generic_reports_ignored_tuning() -> anyhow::Result<()> {
        let mut config = ExperimentConfig {
            strategy: ChaseStrategy::Generic,
            prefetch: PrefetchHint::T0,
            loop_length: 4,
            ..Default::default()
        };
        let exp = Experiment::from_config(&config, 1)?;
        assert_eq!(ignored_by_generic(&exp), vec!["prefetch hint", "loop length"]);
        assert_eq!(select_chase(&exp)?.name(), "generic");
        config.prefetch = PrefetchHint::None;
        config.loop_length = 0;
        let exp = Experiment::from_config(&config, 1)?;
        assert!(ignored_by_generic(&exp).is_empty());
        Ok(())
    }

    #[test]
    fn test_select_auto_always_succeeds() -> anyhow::Result<()> {
        let config = ExperimentConfig {
            chains_per_thread: 16,
            ..Default::default()
        };
        let exp = Experiment::from_config(&config, 1)?;
        // 16 chains exceed the register file, auto falls back
        assert_eq!(select_chase(&exp)?.name(), "generic");
        Ok(())
    }

    #[test]
    fn test_select_jit_fails_loudly() -> anyhow::Result<()> {
        let config = ExperimentConfig {
            chains_per_thread: 16,
            strategy: ChaseStrategy::Jit,
            ..Default::default()
        };
        let exp = Experiment::from_config(&config, 1)?;
        assert!(select_chase(&exp).is_err());
        Ok(())
    }
}
