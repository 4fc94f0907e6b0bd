use ::time::{format_description::well_known, OffsetDateTime};
use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use crate::types::ScanReport;

/// Operator-facing summary of a finished scan.
pub fn render_text(report: &ScanReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n-=- results -=-\n");
    if report.fishy_address {
        let _ = writeln!(
            out,
            "** WARNING: Unreliable scan, fishy address: {} **\n",
            report.addr
        );
    }
    if report.open.is_empty() {
        let _ = writeln!(out, "No open ports");
    } else {
        let _ = writeln!(out, "open TCP ports:");
        for o in &report.open {
            let name = o.service.as_deref().unwrap_or("unresolved");
            let _ = writeln!(out, "  {}: {}", o.port, name);
        }
    }
    let _ = writeln!(
        out,
        "{} ports timed out (filtered|closed|lost)",
        report.filtered.len()
    );
    let _ = writeln!(out, "{} ports are closed", report.closed.len());
    out
}

/// Write the report as pretty JSON.
pub fn write_json(path: &Path, report: &ScanReport) -> anyhow::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
