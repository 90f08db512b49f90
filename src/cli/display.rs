//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use chrono::{DateTime, Utc};

use super::commands::RecordInfo;
use crate::cleanup::SweepReport;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No clusters recorded.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let last = cells.len().saturating_sub(1);
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < last && i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }

    output
}

/// Compact age like `45s`, `12m`, `3h`, `2d`
pub fn format_age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created_at).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

// ============================================================================
// Record and report display
// ============================================================================

/// Format recorded clusters for `kindtest list`
pub fn format_record_list(records: &[RecordInfo], now: DateTime<Utc>) -> String {
    let headers = &["NAME", "SCOPE", "PID", "AGE", "KEEP", "HOST", "STATUS"];
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            let status = match r.live {
                Some(true) => "Running",
                Some(false) => "Gone",
                None => "Unknown",
            };
            vec![
                r.name.clone(),
                r.scope.to_string(),
                r.pid.to_string(),
                format_age(r.created_at, now),
                if r.keep { "yes" } else { "no" }.to_string(),
                r.host.clone().unwrap_or_else(|| "-".to_string()),
                status.to_string(),
            ]
        })
        .collect();

    format_table(headers, rows)
}

/// Format the result of a sweep or purge
pub fn format_sweep_report(report: &SweepReport) -> String {
    let mut output = String::new();

    for name in &report.deleted {
        output.push_str(&format!("Deleted cluster {}\n", name));
    }
    for name in &report.stale_removed {
        output.push_str(&format!("Removed stale record {}\n", name));
    }
    for failure in &report.failures {
        output.push_str(&format!("Failed: {}\n", failure));
    }

    output.push_str(&format!(
        "{} deleted, {} stale, {} skipped, {} failed\n",
        report.deleted.len(),
        report.stale_removed.len(),
        report.skipped,
        report.failures.len()
    ));
    output
}
