//! Turns a finished run into latency and bandwidth figures and renders them.
use std::io::Write;

use clap::ValueEnum;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};

use crate::experiment::Experiment;
use crate::run::RunSummary;

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One `name = value (unit)` line per figure.
    #[default]
    Table,
    /// A single CSV data row.
    Csv,
    /// The CSV header row only.
    Header,
    /// CSV header and data row.
    Both,
    Json,
}

#[derive(Debug, Serialize)]
pub struct Report<'a> {
    pub experiment: &'a Experiment,
    pub summary: &'a RunSummary,
    pub total_operations: u64,
    pub elapsed_ticks: f64,
    pub latency_ns: f64,
    pub bandwidth_mb_s: f64,
}

/// (CSV header, table label, table unit)
const COLUMNS: [(&str, &str, &str); 23] = [
    ("pointer size (bytes)", "pointer size", "bytes"),
    ("cache line size (bytes)", "cache line size", "bytes"),
    ("page size (bytes)", "page size", "bytes"),
    ("chain size (bytes)", "chain size", "bytes"),
    ("thread size (bytes)", "thread size", "bytes"),
    ("test size (bytes)", "test size", "bytes"),
    ("chains per thread", "chains per thread", ""),
    ("number of threads", "number of threads", ""),
    ("iterations", "iterations", ""),
    ("experiments", "experiments", ""),
    ("access pattern", "access pattern", ""),
    ("stride", "stride", ""),
    ("numa placement", "numa placement", ""),
    ("offset or mask", "offset or mask", ""),
    ("numa domains", "numa domains", ""),
    ("domain map", "domain map", ""),
    ("operations per chain", "operations per chain", ""),
    ("total operations", "total operations", ""),
    ("elapsed time (seconds)", "elapsed time", "seconds"),
    ("elapsed time (timer ticks)", "elapsed time", "timer ticks"),
    ("clock resolution (ns)", "clock resolution", "ns"),
    ("memory latency (ns)", "memory latency", "ns"),
    ("memory bandwidth (MB/s)", "memory bandwidth", "MB/s"),
];

impl<'a> Report<'a> {
    pub fn new(experiment: &'a Experiment, summary: &'a RunSummary) -> Self {
        let exp = experiment;
        let ops = summary.ops_per_chain;
        let streams = (exp.chains_per_thread * exp.num_threads) as u64;
        let accesses = (ops * summary.iterations) as f64;
        let seconds = summary.best_seconds;
        Report {
            experiment,
            summary,
            total_operations: ops * streams,
            elapsed_ticks: seconds / summary.clock_resolution,
            latency_ns: seconds / accesses * 1e9,
            bandwidth_mb_s: accesses * (streams as f64) * exp.bytes_per_line as f64 / seconds * 1e-6,
        }
    }

    /// Formatted values, in `COLUMNS` order.
    fn values(&self) -> Vec<String> {
        let exp = self.experiment;
        let summary = self.summary;
        vec![
            exp.pointer_size.to_string(),
            exp.bytes_per_line.to_string(),
            exp.bytes_per_page.to_string(),
            exp.bytes_per_chain.to_string(),
            exp.bytes_per_thread.to_string(),
            exp.bytes_per_test.to_string(),
            exp.chains_per_thread.to_string(),
            exp.num_threads.to_string(),
            summary.iterations.to_string(),
            exp.experiments.to_string(),
            exp.access_pattern.name().to_string(),
            exp.stride.to_string(),
            exp.placement.name().to_string(),
            exp.placement.offset_or_mask().to_string(),
            exp.num_numa_domains.to_string(),
            exp.domain_map(),
            summary.ops_per_chain.to_string(),
            self.total_operations.to_string(),
            format!("{:.3}", summary.best_seconds),
            format!("{:.0}", self.elapsed_ticks),
            format!("{:.2}", summary.clock_resolution * 1e9),
            format!("{:.2}", self.latency_ns),
            format!("{:.3}", self.bandwidth_mb_s),
        ]
    }

    pub fn write(&self, mode: OutputMode, mut out: impl Write) -> anyhow::Result<()> {
        match mode {
            OutputMode::Table => self.write_table(&mut out)?,
            OutputMode::Csv => self.write_csv(&mut out, false, true)?,
            OutputMode::Header => self.write_csv(&mut out, true, false)?,
            OutputMode::Both => self.write_csv(&mut out, true, true)?,
            OutputMode::Json => {
                serde_json::to_writer_pretty(&mut out, self)?;
                writeln!(out)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    fn write_table(&self, out: &mut impl Write) -> anyhow::Result<()> {
        for ((_, label, unit), value) in COLUMNS.iter().zip(self.values()) {
            if *label == "domain map" {
                writeln!(out, "{:<20} = \"{}\"", label, value)?;
            } else if unit.is_empty() {
                writeln!(out, "{:<20} = {}", label, value)?;
            } else {
                writeln!(out, "{:<20} = {} ({})", label, value, unit)?;
            }
        }
        Ok(())
    }

    fn write_csv(&self, out: &mut impl Write, header: bool, data: bool) -> anyhow::Result<()> {
        let mut wtr = WriterBuilder::new().has_headers(false).from_writer(out);
        if header {
            wtr.write_record(COLUMNS.iter().map(|(name, _, _)| *name))?;
        }
        if data {
            wtr.write_record(self.values())?;
        }
        wtr.flush()?;
        Ok(())
    }
}
