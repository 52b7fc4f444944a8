// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `skein barrier`: join deadlines one wave at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use skein_rt::{Fibre, JobContext, JobStatus, JoinError};

use super::{print_stats, start_scheduler, Options};
use crate::output;

const ROUNDS: u32 = 4;

/// A few cooperative rounds of busy work, then a tick on its wave's counter.
struct Work {
    round: u32,
    acc: u64,
    done: Arc<AtomicUsize>,
}

impl Fibre for Work {
    type Point = u32;

    fn resume(&mut self, at: u32, cx: &mut JobContext<'_, u32>) -> JobStatus {
        if at == u32::MAX {
            return cx.exit();
        }
        self.acc = (0..2_000u64).fold(self.acc, |a, i| a.rotate_left(5) ^ i);
        self.round += 1;
        if self.round < ROUNDS {
            return cx.wait(self.round);
        }
        std::hint::black_box(self.acc);
        self.done.fetch_add(1, Ordering::Release);
        cx.exit()
    }
}

pub fn cmd_barrier(opts: &Options) -> bool {
    let sched = start_scheduler(opts);
    println!("{}", output::banner("barrier"));

    let start = Instant::now();
    let counters: Vec<Arc<AtomicUsize>> = (0..opts.waves).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for (wave, done) in counters.iter().enumerate() {
        let deadline = wave as u32 + 1;
        for _ in 0..opts.jobs {
            sched.submit(
                Work {
                    round: 0,
                    acc: deadline as u64,
                    done: done.clone(),
                },
                deadline,
            );
        }
    }

    let mut mismatches = 0;
    for (wave, done) in counters.iter().enumerate() {
        let deadline = wave as u32 + 1;
        let mut retries = 0;
        loop {
            match sched.join_deadline(deadline) {
                Ok(()) => break,
                Err(JoinError::Unretired { .. }) => {
                    retries += 1;
                    thread::yield_now();
                }
                Err(e) => {
                    eprintln!("{}: {}", output::error_label(), e);
                    return false;
                }
            }
        }
        let finished = done.load(Ordering::Acquire);
        let ok = finished == opts.jobs;
        if !ok {
            mismatches += 1;
        }
        let mark = if ok { output::status_pass() } else { output::status_fail() };
        println!(
            "  {} deadline {:<3} {}/{} jobs at {} ({} retries)",
            mark,
            deadline,
            finished,
            opts.jobs,
            output::elapsed(start.elapsed()),
            retries
        );
    }
    print_stats(&sched);

    if mismatches == 0 {
        println!("{}", output::banner_ok("barrier"));
        true
    } else {
        println!("{}", output::banner_fail("barrier", mismatches));
        false
    }
}
