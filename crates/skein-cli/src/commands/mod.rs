// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI command implementations.

pub mod barrier;
pub mod pipeline;
pub mod select;

use std::process;

use skein_rt::{Scheduler, SchedulerConfig};

use crate::output;

/// Flags shared by every demo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Overrides SKEIN_WORKERS when given.
    pub workers: Option<usize>,
    pub jobs: usize,
    pub capacity: usize,
    pub items: usize,
    pub waves: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: None,
            jobs: 4,
            capacity: 8,
            items: 1000,
            waves: 8,
        }
    }
}

impl Options {
    /// Parse `--flag value` and `--flag=value` pairs.
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let mut opts = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag, Some(value.to_string())),
                None => (arg.as_str(), None),
            };
            let value = match inline {
                Some(v) => v,
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| format!("{} expects a value", flag))?,
            };
            let n: usize = value
                .parse()
                .map_err(|_| format!("{}: expected a number, got {:?}", flag, value))?;
            match flag {
                "--workers" => opts.workers = Some(n),
                "--jobs" => opts.jobs = n,
                "--capacity" => opts.capacity = n,
                "--items" => opts.items = n,
                "--waves" => opts.waves = n,
                other => return Err(format!("unknown option: {}", other)),
            }
        }
        if opts.jobs == 0 {
            return Err("--jobs must be at least 1".to_string());
        }
        if opts.capacity == 0 {
            return Err("--capacity must be at least 1".to_string());
        }
        // Items are sent as u32 values and waves become u32 deadlines.
        let limit = u32::MAX as usize;
        if opts.items > limit {
            return Err(format!("--items must be at most {}", limit));
        }
        if opts.waves > limit {
            return Err(format!("--waves must be at most {}", limit));
        }
        Ok(opts)
    }
}

/// Start a scheduler from the environment, with `--workers` on top.
/// Exits the process on failure.
pub fn start_scheduler(opts: &Options) -> Scheduler {
    let config = match SchedulerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            process::exit(2);
        }
    };
    let config = match opts.workers {
        Some(n) => config.workers(n),
        None => config,
    };
    match Scheduler::new(config) {
        Ok(sched) => sched,
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            process::exit(1);
        }
    }
}

/// Final stats line and a separator.
pub fn print_stats(sched: &Scheduler) {
    let stats = sched.stats();
    println!(
        "{} {} workers, {} job records ({} free), {} queued",
        output::label("scheduler"),
        stats.workers,
        stats.jobs_allocated,
        stats.jobs_free,
        stats.queued
    );
    println!("{}", output::separator(48));
}
