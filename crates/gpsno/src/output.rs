//! Output formatting for one-shot commands.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use gpsno_core::SyncReport;

use crate::cli::ColorMode;

/// Determine whether color output should be enabled.
pub fn should_color(mode: &ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Sync report ──────────────────────────────────────────────────────

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Kind")]
    kind: &'static str,
    #[tabled(rename = "Published")]
    published: String,
    #[tabled(rename = "Failed")]
    failed: String,
}

/// One row per entity kind that was synced.
pub fn render_report(rows: &[(&'static str, SyncReport)], color: bool) -> String {
    let rows: Vec<ReportRow> = rows
        .iter()
        .map(|(kind, report)| ReportRow {
            kind: *kind,
            published: paint(report.published, color, |s| s.green().to_string()),
            failed: if report.failed == 0 {
                report.failed.to_string()
            } else {
                paint(report.failed, color, |s| s.red().bold().to_string())
            },
        })
        .collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

fn paint(value: usize, color: bool, style: impl Fn(&str) -> String) -> String {
    let text = value.to_string();
    if color { style(&text) } else { text }
}
