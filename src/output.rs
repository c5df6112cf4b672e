//! CLI output formatting.
//!
//! Output is **asset-centric**: a capture is summarized by what happened to
//! each referenced asset, in the order the pipeline reported it, with the
//! failure reason as indented context.
//!
//! # Output Format
//!
//! ## Capture
//!
//! ```text
//! Snapshot 640x480 → card.svg
//! Inlined (2)
//!     001 https://example.com/pic.png
//!     002 url(https://cdn.example.net/bg.png)
//! Left as original (1)
//!     001 https://cdn.example.net/missing.png
//!         Reason: network
//! Cache: 2 resolved (3 lookups)
//! ```
//!
//! ## Pre-cache
//!
//! ```text
//! Pre-cache
//!     Base styles: 4
//!     Images: 3
//!     Backgrounds: 1
//!     Failures: 1
//!     Fonts: skipped
//! ```
//!
//! # Architecture
//!
//! Each command has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::capture::Snapshot;
use crate::fetch::data_url::preview;
use crate::precache::PreCacheReport;
use std::path::Path;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn asset_line(index: usize, reference: &str) -> String {
    format!("{}{} {}", indent(1), format_index(index), preview(reference))
}

// ============================================================================
// Capture
// ============================================================================

/// Format the summary of one capture.
///
/// `destination` is the file the document was written to; `None` means it
/// went to stdout.
pub fn format_capture_summary(snapshot: &Snapshot, destination: Option<&Path>) -> Vec<String> {
    let mut lines = Vec::new();
    let target = destination
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "stdout".to_string());
    lines.push(format!(
        "Snapshot {}x{} \u{2192} {}",
        snapshot.width, snapshot.height, target
    ));

    let report = &snapshot.report;
    if report.total() == 0 {
        lines.push("No external assets".to_string());
    }
    if !report.inlined.is_empty() {
        lines.push(format!("Inlined ({})", report.inlined.len()));
        for (i, reference) in report.inlined.iter().enumerate() {
            lines.push(asset_line(i + 1, reference));
        }
    }
    if !report.left_as_original.is_empty() {
        lines.push(format!("Left as original ({})", report.left_as_original.len()));
        for (i, (reference, err)) in report.left_as_original.iter().enumerate() {
            lines.push(asset_line(i + 1, reference));
            lines.push(format!("{}Reason: {}", indent(2), err.kind()));
        }
    }

    lines.push(format!("Cache: {}", snapshot.stats));
    lines
}

pub fn print_capture_summary(snapshot: &Snapshot, destination: Option<&Path>) {
    for line in format_capture_summary(snapshot, destination) {
        println!("{}", line);
    }
}

// ============================================================================
// Pre-cache
// ============================================================================

pub fn format_precache_summary(report: &PreCacheReport) -> Vec<String> {
    if report.reset {
        return vec!["Cache reset".to_string()];
    }
    vec![
        "Pre-cache".to_string(),
        format!("{}Base styles: {}", indent(1), report.base_styles),
        format!("{}Images: {}", indent(1), report.images),
        format!("{}Backgrounds: {}", indent(1), report.backgrounds),
        format!("{}Failures: {}", indent(1), report.failures),
        format!(
            "{}Fonts: {}",
            indent(1),
            if report.fonts_warmed { "warmed" } else { "skipped" }
        ),
    ]
}

pub fn print_precache_summary(report: &PreCacheReport) {
    for line in format_precache_summary(report) {
        println!("{}", line);
    }
}
