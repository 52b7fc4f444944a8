// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `skein select`: one consumer multiplexing several producers.

use std::time::Instant;

use skein_rt::{Channel, Chanmux, Fibre, JobContext, JobStatus, MuxOutcome, ResultSlot};

use super::pipeline::Producer;
use super::{print_stats, start_scheduler, Options};
use crate::output;

const DEADLINE: u32 = 2;

/// Per-source item counts and sums.
type Tally = Vec<(usize, u64)>;

/// Reads 4-byte items from every operand until `left` have arrived.
struct FanIn {
    mux: Chanmux,
    left: usize,
    tally: Tally,
    wakeups: usize,
    out: ResultSlot<(Tally, usize)>,
}

impl Fibre for FanIn {
    type Point = u32;

    fn resume(&mut self, at: u32, cx: &mut JobContext<'_, u32>) -> JobStatus {
        if at == u32::MAX {
            return cx.exit();
        }
        self.wakeups += 1;
        while self.left > 0 {
            match self.mux.mux(cx) {
                Ok(MuxOutcome::Ready(_)) => {
                    let mut next = self.mux.first();
                    while let Some(i) = next {
                        if let Some(data) = self.mux.data(i) {
                            let mut item = [0u8; 4];
                            item.copy_from_slice(data);
                            self.tally[i].0 += 1;
                            self.tally[i].1 += u64::from(u32::from_le_bytes(item));
                            self.left -= 1;
                        }
                        next = self.mux.next(i);
                    }
                }
                Ok(MuxOutcome::Blocked) => return cx.block(1),
                Err(e) => {
                    tracing::error!(error = %e, "mux failed");
                    return cx.exit();
                }
            }
        }
        self.out.set((std::mem::take(&mut self.tally), self.wakeups));
        cx.exit()
    }
}

pub fn cmd_select(opts: &Options) -> bool {
    let sched = start_scheduler(opts);
    let items = opts.items as u32;
    let expected: u64 = (0..u64::from(items)).sum();

    println!("{}", output::banner("select"));
    let start = Instant::now();
    let mut mux = Chanmux::new();
    let mut channels = Vec::with_capacity(opts.jobs);
    for _ in 0..opts.jobs {
        match Channel::shared(4, opts.capacity) {
            Ok(ch) => {
                mux = mux.read(&ch, 4);
                channels.push(ch);
            }
            Err(e) => {
                eprintln!("{}: {}", output::error_label(), e);
                return false;
            }
        }
    }

    let out = ResultSlot::new();
    sched.submit(
        FanIn {
            mux,
            left: opts.items * opts.jobs,
            tally: vec![(0, 0); opts.jobs],
            wakeups: 0,
            out: out.clone(),
        },
        DEADLINE,
    );
    for ch in channels {
        sched.submit(
            Producer {
                tx: ch,
                next: 0,
                end: items,
            },
            DEADLINE,
        );
    }

    if let Err(e) = sched.join_deadline(DEADLINE) {
        eprintln!("{}: {}", output::error_label(), e);
        return false;
    }
    let elapsed = start.elapsed();

    let Some((tally, wakeups)) = out.take() else {
        eprintln!("{}: consumer produced no result", output::error_label());
        return false;
    };
    let mut mismatches = 0;
    for (source, &(count, sum)) in tally.iter().enumerate() {
        let ok = count == opts.items && sum == expected;
        if !ok {
            mismatches += 1;
        }
        let mark = if ok { output::status_pass() } else { output::status_fail() };
        println!("  {} source {:<3} {} items, sum {}", mark, source, count, sum);
    }
    println!(
        "{} {} steps for {} items in {}",
        output::label("consumer"),
        wakeups,
        opts.items * opts.jobs,
        output::elapsed(elapsed)
    );
    print_stats(&sched);

    if mismatches == 0 {
        println!("{}", output::banner_ok("select"));
        true
    } else {
        println!("{}", output::banner_fail("select", mismatches));
        false
    }
}
