// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI output formatting with colors and styling.
//!
//! Respects NO_COLOR and FORCE_COLOR environment variables.
//! Colors are automatically disabled when output is piped.

use std::time::Duration;

use colored::{ColoredString, Colorize};

/// Initialize color support based on environment.
/// Call once at startup.
pub fn init() {
    // colored crate handles NO_COLOR automatically,
    // but we add explicit FORCE_COLOR support
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    } else if std::env::var("FORCE_COLOR").is_ok() {
        colored::control::set_override(true);
    }
}

// === Error Output ===

pub fn error_label() -> ColoredString {
    "error".red().bold()
}

pub fn hint_label() -> ColoredString {
    "hint".cyan()
}

pub fn hint_text(msg: &str) -> ColoredString {
    msg.dimmed()
}

// === Run Output ===

pub fn banner(demo: &str) -> String {
    format!("{} {} {}", "===".dimmed(), demo.bold(), "===".dimmed())
}

pub fn banner_ok(demo: &str) -> String {
    format!(
        "{} {} {}",
        "===".dimmed(),
        format!("{} OK", demo).green().bold(),
        "===".dimmed()
    )
}

pub fn banner_fail(demo: &str, count: usize) -> String {
    let msg = if count == 1 {
        format!("{} FAILED: 1 mismatch", demo)
    } else {
        format!("{} FAILED: {} mismatches", demo, count)
    };
    format!("{} {} {}", "===".dimmed(), msg.red().bold(), "===".dimmed())
}

pub fn status_pass() -> ColoredString {
    "✓".green()
}

pub fn status_fail() -> ColoredString {
    "✗".red()
}

pub fn label(name: &str) -> ColoredString {
    format!("{:>12}", name).cyan()
}

pub fn elapsed(d: Duration) -> ColoredString {
    format!("{:.2?}", d).dimmed()
}

// === Help Output ===

pub fn title(name: &str) -> ColoredString {
    name.bold()
}

pub fn version(v: &str) -> ColoredString {
    v.dimmed()
}

pub fn section_header(header: &str) -> ColoredString {
    header.yellow().bold()
}

pub fn command(name: &str) -> ColoredString {
    name.green()
}

pub fn arg(name: &str) -> ColoredString {
    name.cyan()
}

pub fn separator(width: usize) -> ColoredString {
    "─".repeat(width).dimmed()
}
