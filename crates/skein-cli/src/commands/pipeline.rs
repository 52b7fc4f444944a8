// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `skein pipeline`: producer/consumer pairs over bounded channels.

use std::sync::Arc;
use std::time::Instant;

use skein_rt::{Channel, Fibre, JobContext, JobStatus, ResultSlot, ResumePoint, Transfer};

use super::{print_stats, start_scheduler, Options};
use crate::output;

const DEADLINE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) enum Step {
    #[default]
    Run,
    Cleanup,
}

impl ResumePoint for Step {
    fn cleanup() -> Self {
        Step::Cleanup
    }
}

/// Writes `next..end` as little-endian u32s.
pub(crate) struct Producer {
    pub tx: Arc<Channel>,
    pub next: u32,
    pub end: u32,
}

impl Fibre for Producer {
    type Point = Step;

    fn resume(&mut self, at: Step, cx: &mut JobContext<'_, Step>) -> JobStatus {
        if at == Step::Cleanup {
            return cx.exit();
        }
        while self.next < self.end {
            match self.tx.write(cx, &self.next.to_le_bytes()) {
                Ok(Transfer::Done(_)) => self.next += 1,
                Ok(Transfer::Blocked { .. }) => return cx.block(Step::Run),
                Err(e) => {
                    tracing::error!(error = %e, "producer write failed");
                    return cx.exit();
                }
            }
        }
        cx.exit()
    }
}

/// Reads `left` u32s and reports their sum.
struct Consumer {
    rx: Arc<Channel>,
    left: usize,
    sum: u64,
    out: ResultSlot<u64>,
}

impl Fibre for Consumer {
    type Point = Step;

    fn resume(&mut self, at: Step, cx: &mut JobContext<'_, Step>) -> JobStatus {
        if at == Step::Cleanup {
            return cx.exit();
        }
        let mut item = [0u8; 4];
        while self.left > 0 {
            match self.rx.read(cx, &mut item) {
                Ok(Transfer::Done(_)) => {
                    self.sum += u64::from(u32::from_le_bytes(item));
                    self.left -= 1;
                }
                Ok(Transfer::Blocked { .. }) => return cx.block(Step::Run),
                Err(e) => {
                    tracing::error!(error = %e, "consumer read failed");
                    return cx.exit();
                }
            }
        }
        self.out.set(self.sum);
        cx.exit()
    }
}

pub fn cmd_pipeline(opts: &Options) -> bool {
    let sched = start_scheduler(opts);
    let items = opts.items as u32;
    let expected: u64 = (0..u64::from(items)).sum();

    println!("{}", output::banner("pipeline"));
    let start = Instant::now();
    let mut results = Vec::with_capacity(opts.jobs);
    for _ in 0..opts.jobs {
        let ch = match Channel::shared(4, opts.capacity) {
            Ok(ch) => ch,
            Err(e) => {
                eprintln!("{}: {}", output::error_label(), e);
                return false;
            }
        };
        let out = ResultSlot::new();
        sched.submit(
            Consumer {
                rx: ch.clone(),
                left: opts.items,
                sum: 0,
                out: out.clone(),
            },
            DEADLINE,
        );
        sched.submit(
            Producer {
                tx: ch,
                next: 0,
                end: items,
            },
            DEADLINE,
        );
        results.push(out);
    }

    if let Err(e) = sched.join_deadline(DEADLINE) {
        eprintln!("{}: {}", output::error_label(), e);
        return false;
    }
    let elapsed = start.elapsed();

    let mut mismatches = 0;
    for (pair, out) in results.iter().enumerate() {
        match out.take() {
            Some(sum) if sum == expected => {
                println!("  {} pair {:<3} sum {}", output::status_pass(), pair, sum);
            }
            got => {
                mismatches += 1;
                println!(
                    "  {} pair {:<3} sum {:?}, expected {}",
                    output::status_fail(),
                    pair,
                    got,
                    expected
                );
            }
        }
    }
    println!(
        "{} {} items through {} channels in {}",
        output::label("moved"),
        opts.items * opts.jobs,
        opts.jobs,
        output::elapsed(elapsed)
    );
    print_stats(&sched);

    if mismatches == 0 {
        println!("{}", output::banner_ok("pipeline"));
        true
    } else {
        println!("{}", output::banner_fail("pipeline", mismatches));
        false
    }
}
