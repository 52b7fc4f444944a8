// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Help text for CLI commands.

use crate::output;

pub fn print_usage() {
    println!(
        "{} {} - Deadline-ordered cooperative job scheduling",
        output::title("Skein"),
        output::version(env!("CARGO_PKG_VERSION"))
    );
    println!();
    println!(
        "{}: {} {} {}",
        output::section_header("Usage"),
        output::command("skein"),
        output::arg("<command>"),
        output::arg("[options]")
    );
    println!();
    println!("{}", output::section_header("Demos:"));
    println!("  {}    Producer/consumer job pairs over channels", output::command("pipeline"));
    println!("  {}      Fan-in from several channels with a chanmux", output::command("select"));
    println!("  {}     Waves of jobs joined one deadline at a time", output::command("barrier"));
    println!();
    println!("{}", output::section_header("Other:"));
    println!("  {}        Show this help", output::command("help"));
    println!("  {}     Show version", output::command("version"));

    println!();
    println!("{}", output::section_header("Options:"));
    println!("  {}   Worker threads (0 = one per core)", output::arg("--workers <n>"));
    println!("  {}      Jobs (pairs, producers or jobs per wave)", output::arg("--jobs <n>"));
    println!("  {}  Channel capacity in items", output::arg("--capacity <n>"));
    println!("  {}     Items per producer", output::arg("--items <n>"));
    println!("  {}     Deadlines submitted by barrier", output::arg("--waves <n>"));

    println!();
    println!("{}", output::section_header("Environment:"));
    println!("  {}            Log filter (falls back to RUST_LOG, default warn)", output::arg("SKEIN_LOG"));
    println!("  {}        Default worker count", output::arg("SKEIN_WORKERS"));
    println!("  {} Idle wait bound for workers", output::arg("SKEIN_IDLE_TIMEOUT_MS"));
    println!("  {}  Job records allocated at startup", output::arg("SKEIN_PREALLOC_JOBS"));
}

pub fn print_command_help(cmd: &str) {
    match cmd {
        "pipeline" => {
            println!("{} {} [options]", output::command("skein"), output::command("pipeline"));
            println!();
            println!("Starts --jobs producer/consumer pairs. Each producer writes --items");
            println!("numbers into its own channel of --capacity slots; the consumer sums");
            println!("them. All jobs share one deadline, joined at the end.");
        }
        "select" => {
            println!("{} {} [options]", output::command("skein"), output::command("select"));
            println!();
            println!("Starts --jobs producers, each writing --items numbers to its own");
            println!("channel, and one consumer reading all channels through a chanmux.");
        }
        "barrier" => {
            println!("{} {} [options]", output::command("skein"), output::command("barrier"));
            println!();
            println!("Submits --waves waves of --jobs jobs at deadlines 1, 2, ... and joins");
            println!("each deadline in turn, retrying while it is not yet retired.");
        }
        _ => print_usage(),
    }
}
