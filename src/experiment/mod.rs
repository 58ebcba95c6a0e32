//! The experiment descriptor: geometry, placement and protocol parameters of
//! one benchmark run.
//!
//! `ExperimentConfig` is what a user writes (JSON file and/or CLI flags).
//! `Experiment` is the validated, fully derived descriptor every worker reads.
//! Only sizes are configured; all link/line/page counts are derived here so
//! they are always mutually consistent.
mod placement;

use std::fs::File;
use std::io::Read;
use std::mem;
use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Link;
use crate::chase::{ChaseStrategy, PrefetchHint};
use crate::output::OutputMode;
use crate::sync::BarrierKind;
use crate::util::{make_vec, thread_seed, CL_SIZE, DEFAULT_CHAIN_SIZE, MAX_CHAINS, PAGE_SIZE};

pub use self::placement::Placement;

#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("line size {0} must be a power of two and a multiple of the pointer size")]
    LineSize(usize),
    #[error("page size {page} must be a non-zero multiple of the line size {line}")]
    PageSize { page: usize, line: usize },
    #[error("chain size {chain} must be a non-zero multiple of {unit}")]
    ChainSize { chain: usize, unit: usize },
    #[error("chains per thread must be between 1 and {max}, got {0}", max = MAX_CHAINS)]
    ChainCount(usize),
    #[error("thread count must be at least 1")]
    ThreadCount,
    #[error("experiment count must be at least 1")]
    ExperimentCount,
    #[error("sequential access needs a non-zero stride")]
    Stride,
    #[error("stride of {stride} lines exceeds the {lines} lines of a chain")]
    StrideTooLarge { stride: usize, lines: usize },
    #[error("requested seconds must be non-negative, got {0}")]
    Seconds(f64),
    #[error("invalid placement {0:?}, expected local, interleave, xor:<mask>, add:<offset> or map:<map>")]
    Placement(String),
    #[error("invalid domain map {0:?}: {1}")]
    DomainMap(String, String),
    #[error("NUMA node {node} out of range, {domains} domains available")]
    UnknownNode { node: usize, domains: usize },
}

/// Access pattern as configured.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    #[default]
    Random,
    /// Sequential with a fixed stride; a negative stride walks backwards.
    Forward,
    Reverse,
}

/// Access pattern as derived: the stride sign is folded into the direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPattern {
    Forward,
    Reverse,
    Random,
}

impl AccessPattern {
    pub fn name(&self) -> &'static str {
        match self {
            AccessPattern::Forward => "forward",
            AccessPattern::Reverse => "reverse",
            AccessPattern::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub bytes_per_line: usize,
    pub bytes_per_page: usize,
    pub bytes_per_chain: usize,
    pub chains_per_thread: usize,
    pub num_threads: usize,
    /// 0 requests calibration.
    pub iterations: u64,
    pub experiments: u64,
    /// Target duration of one experiment when calibrating, 0 for "one second
    /// worth of doubling rounds".
    pub seconds: f64,
    pub access: AccessKind,
    /// Stride in lines, only used for sequential access.
    pub stride: i64,
    pub prefetch: PrefetchHint,
    /// Number of padding no-ops per step of the generated loop.
    pub loop_length: usize,
    pub strategy: ChaseStrategy,
    pub barrier: BarrierKind,
    pub placement: Placement,
    pub seed: Option<u64>,
    pub output: OutputMode,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            bytes_per_line: CL_SIZE,
            bytes_per_page: PAGE_SIZE,
            bytes_per_chain: DEFAULT_CHAIN_SIZE,
            chains_per_thread: 1,
            num_threads: 1,
            iterations: 0,
            experiments: 1,
            seconds: 1.0,
            access: AccessKind::Random,
            stride: 1,
            prefetch: PrefetchHint::None,
            loop_length: 0,
            strategy: ChaseStrategy::Auto,
            barrier: BarrierKind::Blocking,
            placement: Placement::Local,
            seed: None,
            output: OutputMode::Table,
        }
    }
}

impl ExperimentConfig {
    pub fn from_jsonfile(filepath: &str) -> anyhow::Result<ExperimentConfig> {
        let mut file = File::open(Path::new(filepath))
            .with_context(|| format!("failed to open config {}", filepath))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: ExperimentConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", filepath))?;
        Ok(config)
    }
}

/// Link counts describing one chain. Every count is at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainGeometry {
    pub links_per_line: usize,
    pub links_per_page: usize,
    pub links_per_chain: usize,
    pub lines_per_page: usize,
    pub lines_per_chain: usize,
    pub pages_per_chain: usize,
}

impl ChainGeometry {
    /// Derives the link counts from byte sizes, clamping the page to the
    /// chain so chains smaller than a page still form one "page".
    pub fn from_sizes(
        bytes_per_line: usize,
        bytes_per_page: usize,
        bytes_per_chain: usize,
    ) -> Result<Self, ExperimentError> {
        let pointer_size = mem::size_of::<Link>();
        if bytes_per_line == 0
            || !bytes_per_line.is_power_of_two()
            || bytes_per_line % pointer_size != 0
        {
            return Err(ExperimentError::LineSize(bytes_per_line));
        }
        if bytes_per_page == 0 || bytes_per_page % bytes_per_line != 0 {
            return Err(ExperimentError::PageSize {
                page: bytes_per_page,
                line: bytes_per_line,
            });
        }
        let page = bytes_per_page.min(bytes_per_chain);
        if bytes_per_chain == 0 || page % bytes_per_line != 0 || bytes_per_chain % page != 0 {
            return Err(ExperimentError::ChainSize {
                chain: bytes_per_chain,
                unit: if bytes_per_chain < bytes_per_page {
                    bytes_per_line
                } else {
                    bytes_per_page
                },
            });
        }
        Ok(ChainGeometry {
            links_per_line: bytes_per_line / pointer_size,
            links_per_page: page / pointer_size,
            links_per_chain: bytes_per_chain / pointer_size,
            lines_per_page: page / bytes_per_line,
            lines_per_chain: bytes_per_chain / bytes_per_line,
            pages_per_chain: bytes_per_chain / page,
        })
    }
}

/// The validated descriptor shared read-only by all workers.
#[derive(Debug, Clone, Serialize)]
pub struct Experiment {
    pub pointer_size: usize,
    pub bytes_per_line: usize,
    pub bytes_per_page: usize,
    pub bytes_per_chain: usize,
    pub bytes_per_thread: usize,
    pub bytes_per_test: usize,
    pub geometry: ChainGeometry,
    pub chains_per_thread: usize,
    pub num_threads: usize,
    /// Requested iterations, 0 if they are to be calibrated.
    pub iterations: u64,
    pub experiments: u64,
    pub seconds: f64,
    pub access_pattern: AccessPattern,
    pub stride: i64,
    pub prefetch: PrefetchHint,
    pub loop_length: usize,
    pub strategy: ChaseStrategy,
    pub barrier: BarrierKind,
    pub placement: Placement,
    pub num_numa_domains: usize,
    pub thread_domain: Vec<usize>,
    pub chain_domain: Vec<Vec<usize>>,
    pub seed: u64,
    pub thread_seeds: Vec<u64>,
    pub output: OutputMode,
}

impl Experiment {
    /// Validates `config` and derives the descriptor for a machine with
    /// `numa_domains` domains.
    pub fn from_config(
        config: &ExperimentConfig,
        numa_domains: usize,
    ) -> Result<Self, ExperimentError> {
        let geometry = ChainGeometry::from_sizes(
            config.bytes_per_line,
            config.bytes_per_page,
            config.bytes_per_chain,
        )?;
        if config.chains_per_thread == 0 || config.chains_per_thread > MAX_CHAINS {
            return Err(ExperimentError::ChainCount(config.chains_per_thread));
        }
        if config.num_threads == 0 {
            return Err(ExperimentError::ThreadCount);
        }
        if config.experiments == 0 {
            return Err(ExperimentError::ExperimentCount);
        }
        if config.seconds.is_nan() || config.seconds < 0.0 {
            return Err(ExperimentError::Seconds(config.seconds));
        }
        let access_pattern = match config.access {
            AccessKind::Random => AccessPattern::Random,
            _ if config.stride == 0 => return Err(ExperimentError::Stride),
            AccessKind::Forward if config.stride > 0 => AccessPattern::Forward,
            AccessKind::Forward | AccessKind::Reverse => AccessPattern::Reverse,
        };

        if access_pattern != AccessPattern::Random
            && config.stride.unsigned_abs() as usize > geometry.lines_per_chain
        {
            return Err(ExperimentError::StrideTooLarge {
                stride: config.stride.unsigned_abs() as usize,
                lines: geometry.lines_per_chain,
            });
        }

        let numa_domains = numa_domains.max(1);
        let maps = config.placement.domain_maps(
            config.num_threads,
            config.chains_per_thread,
            numa_domains,
        )?;

        let seed = config.seed.unwrap_or_else(rand::random);
        let bytes_per_thread = config.bytes_per_chain * config.chains_per_thread;

        Ok(Experiment {
            pointer_size: mem::size_of::<Link>(),
            bytes_per_line: config.bytes_per_line,
            bytes_per_page: config.bytes_per_page,
            bytes_per_chain: config.bytes_per_chain,
            bytes_per_thread,
            bytes_per_test: bytes_per_thread * config.num_threads,
            geometry,
            chains_per_thread: config.chains_per_thread,
            num_threads: config.num_threads,
            iterations: config.iterations,
            experiments: config.experiments,
            seconds: config.seconds,
            access_pattern,
            stride: config.stride,
            prefetch: config.prefetch,
            loop_length: config.loop_length,
            strategy: config.strategy,
            barrier: config.barrier,
            placement: config.placement.clone(),
            num_numa_domains: numa_domains,
            thread_domain: maps.thread_domain,
            chain_domain: maps.chain_domain,
            seed,
            thread_seeds: make_vec(config.num_threads, |t| thread_seed(seed, t)),
            output: config.output,
        })
    }

    /// Stride magnitude in lines.
    pub fn stride_lines(&self) -> usize {
        self.stride.unsigned_abs() as usize
    }

    /// `"t:c,c;t:c,c"` rendering of the domain maps.
    pub fn domain_map(&self) -> String {
        self.thread_domain
            .iter()
            .zip(&self.chain_domain)
            .map(|(thread, chains)| format!("{}:{}", thread, chains.iter().join(",")))
            .join(";")
    }

    pub fn log_geometry(&self) {
        info!(
            "{} thread(s) x {} chain(s) of {} bytes, {} access, stride {}",
            self.num_threads,
            self.chains_per_thread,
            self.bytes_per_chain,
            self.access_pattern.name(),
            self.stride
        );
        info!(
            "{} links/chain, {} pages/chain, {} lines/page, {} links/line",
            self.geometry.links_per_chain,
            self.geometry.pages_per_chain,
            self.geometry.lines_per_page,
            self.geometry.links_per_line
        );
        info!(
            "placement {} over {} domain(s): {}",
            self.placement,
            self.num_numa_domains,
            self.domain_map()
        );
    }
}
