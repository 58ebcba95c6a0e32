pub const KB: usize = 1 << 10;
pub const MB: usize = 1 << 20;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const CL_SIZE: usize = 64;

pub const DEFAULT_CHAIN_SIZE: usize = MB;

/// Lower bound on the wall-clock time a calibration round has to exceed.
pub const MIN_CALIBRATION_SECONDS: f64 = 0.2;

/// Upper bound for the doubling search, guards against clock anomalies. A
/// frozen clock costs at most twice this many laps.
pub const MAX_CALIBRATION_ITERS: u64 = 1 << 24;

/// Largest number of chains a single thread may chase.
pub const MAX_CHAINS: usize = 16;
