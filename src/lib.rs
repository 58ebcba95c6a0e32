//! Parallel pointer-chasing benchmark for memory latency and bandwidth.
//!
//! Worker threads each chase one or more cyclic pointer chains laid out
//! across cache lines, pages and NUMA domains. The fastest of several
//! barrier-synchronised trials is converted into latency and bandwidth.
pub mod chain;
pub mod chase;
pub mod experiment;
pub mod numa;
pub mod output;
pub mod run;
pub mod sync;
pub mod timer;
pub mod util;

#[macro_use]
extern crate log;
