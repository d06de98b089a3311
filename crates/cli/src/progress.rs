//! Cargo-style progress output for dirdiff
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!   Committed r7 (952 files, 67.44 MiB)
//!     Planned 3 moves, 1 copy, 12 transfers (1.20 MiB), 2 deletes
//! ⠙     Syncing 9 ops, 1.03 MiB sent
//!      Synced r7 to ssh:me@box:22:/srv/app in 3.20s
//! ```
//!
//! Bars live in one global [`MultiProgress`]; console logging goes through
//! [`ProgressWriter`] so log lines are printed above the bars.

use std::io::Write as _;
use std::sync::LazyLock;
use std::time::Instant;

use indicatif::{MultiProgress, ProgressBar};
use tracing_subscriber::fmt::MakeWriter;

use dirdiff_core::executor::OperationFailure;
use dirdiff_core::{PlanSummary, VerificationReport};

static MULTI: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
pub struct Status;

impl Status {
    pub const SCANNING: &str = "Scanning";
    pub const COMMITTED: &str = "Committed";
    pub const UNCHANGED: &str = "Unchanged";
    pub const SKIPPED: &str = "Skipped";
    pub const CONNECTING: &str = "Connecting";
    pub const PLANNED: &str = "Planned";
    pub const RESUMING: &str = "Resuming";
    pub const SYNCED: &str = "Synced";
    pub const VERIFIED: &str = "Verified";
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    write_status(console::Style::new().green().bold(), status, message);
}

/// Print a status line in warning colors
pub fn print_warning(status: &str, message: &str) {
    write_status(console::Style::new().yellow().bold(), status, message);
}

fn write_status(style: console::Style, status: &str, message: &str) {
    MULTI.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
    });
}

/// Console writer that keeps log lines from tearing progress bars
#[derive(Clone, Copy)]
pub struct ProgressWriter;

/// One buffered log event, flushed above the bars on drop
pub struct ProgressLine {
    buf: Vec<u8>,
}

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = ProgressLine;

    fn make_writer(&'a self) -> Self::Writer {
        ProgressLine { buf: Vec::new() }
    }
}

impl std::io::Write for ProgressLine {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for ProgressLine {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        MULTI.suspend(|| {
            let _ = std::io::stderr().write_all(&self.buf);
        });
    }
}

pub fn format_bytes(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// "1 copy" / "2 copies" style counts
fn count(n: usize, singular: &str, plural: &str) -> String {
    format!("{n} {}", if n == 1 { singular } else { plural })
}

/// Human summary of a plan
pub fn describe_plan(summary: &PlanSummary) -> String {
    let mut parts = Vec::new();
    if summary.moves > 0 {
        parts.push(count(summary.moves, "move", "moves"));
    }
    if summary.copies > 0 {
        parts.push(count(summary.copies, "copy", "copies"));
    }
    if summary.transfers > 0 {
        parts.push(format!(
            "{} ({})",
            count(summary.transfers, "transfer", "transfers"),
            format_bytes(summary.transfer_bytes)
        ));
    }
    if summary.deletes > 0 {
        parts.push(count(summary.deletes, "delete", "deletes"));
    }
    if parts.is_empty() {
        return "nothing to do".to_string();
    }
    parts.join(", ")
}

/// Show the revision a scan was committed as
pub fn print_committed(revision: &str, files: usize, bytes: u64, changed: bool) {
    let status = if changed {
        Status::COMMITTED
    } else {
        Status::UNCHANGED
    };
    print_status(
        status,
        &format!(
            "{revision} ({}, {})",
            count(files, "file", "files"),
            format_bytes(bytes)
        ),
    );
}

/// Progress tracker for one sync
pub struct SyncProgress {
    start: Instant,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Create a bar that advances once per completed operation
    pub fn operation_bar(&self) -> ProgressBar {
        let pb = MULTI.add(ProgressBar::new_spinner());
        pb.set_style(
            indicatif::ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg:>12} {pos} ops, {prefix:.dim} sent")
                .expect("valid template"),
        );
        pb.set_message("Syncing");
        pb.set_prefix(format_bytes(0));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        pb
    }

    fn elapsed(&self) -> String {
        let elapsed = self.start.elapsed();
        if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        }
    }

    /// Show the final summary of a complete sync
    pub fn finish(&self, revision: &str, remote: &str, bytes: u64) {
        print_status(
            Status::SYNCED,
            &format!(
                "{revision} to {remote} ({} sent) in {}",
                format_bytes(bytes),
                self.elapsed()
            ),
        );
    }

    /// Show why a sync stopped early
    pub fn stopped(&self, failure: Option<&OperationFailure>, cancelled: bool, remaining: usize) {
        if let Some(failure) = failure {
            print_warning(
                "Failed",
                &format!("{}: {}", failure.operation, failure.error),
            );
        } else if cancelled {
            print_warning("Cancelled", "by user");
        }
        print_warning(
            "Stopped",
            &format!(
                "{} left after {}; run sync again to resume",
                count(remaining, "operation", "operations"),
                self.elapsed()
            ),
        );
    }

    /// Show the verification result
    pub fn verification(&self, report: &VerificationReport) {
        if report.is_clean() {
            print_status(Status::VERIFIED, "remote matches the snapshot");
            return;
        }
        for (label, paths) in [
            ("Missing", &report.missing),
            ("Unexpected", &report.unexpected),
            ("Mismatched", &report.mismatched),
        ] {
            for path in paths {
                print_warning(label, &path.display().to_string());
            }
        }
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}
