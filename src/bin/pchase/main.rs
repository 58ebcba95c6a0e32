use anyhow::{bail, Context};
use clap::Parser;
use log::info;
use pchase::{
    chase::{ChaseStrategy, PrefetchHint},
    experiment::{AccessKind, Experiment, ExperimentConfig, Placement},
    numa,
    output::{OutputMode, Report},
    run::execute,
    sync::BarrierKind,
    timer::{MonotonicTimer, Timer},
    util::{init_logging_with_progress, named_bar},
};

/// CLI arguments for the `pchase` binary.
///
/// Every option overrides the corresponding value of the `--config` file, if
/// one is given. Sizes accept a `k`, `m` or `g` suffix.
#[derive(Debug, Parser)]
#[command(about = "Parallel pointer-chasing memory latency and bandwidth benchmark")]
struct CliArgs {
    /// JSON experiment configuration to start from.
    #[clap(long = "config")]
    config: Option<String>,
    /// Cache line size in bytes.
    #[clap(short = 'l', long = "line", value_parser = parse_size)]
    line: Option<usize>,
    /// Page size in bytes.
    #[clap(short = 'p', long = "page", value_parser = parse_size)]
    page: Option<usize>,
    /// Size of each chain in bytes.
    #[clap(short = 'c', long = "chain", value_parser = parse_size)]
    chain: Option<usize>,
    /// Number of chains chased by each thread.
    #[clap(short = 'r', long = "chains")]
    chains: Option<usize>,
    /// Number of worker threads.
    #[clap(short = 't', long = "threads")]
    threads: Option<usize>,
    /// Iterations per experiment, 0 to calibrate.
    #[clap(short = 'i', long = "iterations")]
    iterations: Option<u64>,
    /// Number of timed experiments; the fastest one is reported.
    #[clap(short = 'e', long = "experiments")]
    experiments: Option<u64>,
    /// Target duration of one experiment when calibrating.
    #[clap(short = 's', long = "seconds")]
    seconds: Option<f64>,
    /// Memory access pattern.
    #[clap(short = 'a', long = "access")]
    access: Option<AccessKind>,
    /// Stride in cache lines for forward/reverse access. Negative walks backwards.
    #[clap(long = "stride", allow_hyphen_values = true)]
    stride: Option<i64>,
    /// Prefetch issued on every step of the generated loop.
    #[clap(long = "prefetch")]
    prefetch: Option<PrefetchHint>,
    /// Number of no-ops padding every step of the generated loop.
    #[clap(long = "loop-length")]
    loop_length: Option<usize>,
    /// Chase loop implementation.
    #[clap(long = "strategy")]
    strategy: Option<ChaseStrategy>,
    /// Barrier used to synchronise the workers.
    #[clap(long = "barrier")]
    barrier: Option<BarrierKind>,
    /// NUMA placement: local, interleave, xor:<mask>, add:<offset> or map:<t:c,c;...>.
    #[clap(short = 'n', long = "numa")]
    placement: Option<Placement>,
    /// Seed for the random chain layout.
    #[arg(long)]
    seed: Option<u64>,
    /// Report format.
    #[clap(short = 'o', long = "output")]
    output: Option<OutputMode>,
}

impl CliArgs {
    fn apply(self, config: &mut ExperimentConfig) {
        macro_rules! set {
            ($($arg:ident => $field:ident),+) => {
                $(if let Some(value) = self.$arg {
                    config.$field = value;
                })+
            };
        }
        set!(
            line => bytes_per_line,
            page => bytes_per_page,
            chain => bytes_per_chain,
            chains => chains_per_thread,
            threads => num_threads,
            iterations => iterations,
            experiments => experiments,
            seconds => seconds,
            access => access,
            stride => stride,
            prefetch => prefetch,
            loop_length => loop_length,
            strategy => strategy,
            barrier => barrier,
            placement => placement,
            output => output
        );
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

/// Parses `4096`, `64k`, `1m` or `2g` into bytes.
fn parse_size(s: &str) -> anyhow::Result<usize> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 10),
        Some((i, 'm' | 'M')) => (&s[..i], 20),
        Some((i, 'g' | 'G')) => (&s[..i], 30),
        _ => (s, 0),
    };
    let value: usize = digits
        .parse()
        .with_context(|| format!("invalid size {:?}", s))?;
    match value.checked_mul(1 << shift) {
        Some(bytes) => Ok(bytes),
        None => bail!("size {:?} overflows", s),
    }
}

fn main() -> anyhow::Result<()> {
    let progress = init_logging_with_progress()?;

    // parse args
    let args = CliArgs::parse();
    let mut config = match &args.config {
        Some(path) => ExperimentConfig::from_jsonfile(path)?,
        None => ExperimentConfig::default(),
    };
    args.apply(&mut config);

    let numa = numa::detect();
    let exp = Experiment::from_config(&config, numa.domains())?;
    exp.log_geometry();

    let timer = MonotonicTimer::new();
    info!("Clock resolution {:.2} ns", timer.resolution() * 1e9);
    let bar = named_bar(&progress, "experiments", exp.experiments);
    let summary = execute(&exp, numa.as_ref(), &timer, Some(&bar))?;
    bar.finish_and_clear();
    info!(
        "Best of {} experiment(s): {:.6} s using the {} loop",
        summary.samples.len(),
        summary.best_seconds,
        summary.chase
    );

    Report::new(&exp, &summary).write(exp.output, std::io::stdout().lock())?;
    Ok(())
}
