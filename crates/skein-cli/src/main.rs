// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein CLI - demos of the job scheduler.

mod commands;
mod help;
mod output;

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use commands::Options;

fn main() {
    output::init();
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        help::print_usage();
        return;
    }

    let cmd = args[1].as_str();
    let rest = &args[2..];
    if rest.iter().any(|a| a == "--help" || a == "-h") {
        help::print_command_help(cmd);
        return;
    }

    match cmd {
        "pipeline" | "select" | "barrier" => {
            let opts = match Options::parse(rest) {
                Ok(opts) => opts,
                Err(msg) => {
                    eprintln!("{}: {}", output::error_label(), msg);
                    eprintln!(
                        "{}: {}",
                        output::hint_label(),
                        output::hint_text(&format!("run `skein {} --help`", cmd))
                    );
                    process::exit(2);
                }
            };
            let ok = match cmd {
                "pipeline" => commands::pipeline::cmd_pipeline(&opts),
                "select" => commands::select::cmd_select(&opts),
                _ => commands::barrier::cmd_barrier(&opts),
            };
            if !ok {
                process::exit(1);
            }
        }
        "help" | "--help" | "-h" => match rest.first() {
            Some(topic) => help::print_command_help(topic),
            None => help::print_usage(),
        },
        "version" | "--version" | "-V" => {
            println!("skein {}", env!("CARGO_PKG_VERSION"));
        }
        other => {
            eprintln!("{}: unknown command: {}", output::error_label(), other);
            help::print_usage();
            process::exit(1);
        }
    }
}

/// Log to stderr, filtered by SKEIN_LOG, then RUST_LOG, else `warn`.
fn init_logging() {
    let filter = EnvFilter::try_from_env("SKEIN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
