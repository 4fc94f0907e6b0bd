use anyhow::{anyhow, Context, Result};

use crate::error::ScanError;
use crate::types::PortRange;

/// Validate a candidate `start..=end` range.
///
/// Values are taken wide so that zero, negative and over-range input all
/// surface as `ScanError::InvalidRange` instead of wrapping.
pub fn validate_range(start: i64, end: i64) -> crate::error::Result<PortRange> {
    if start <= 0 || end > 65535 || end < start {
        return Err(ScanError::InvalidRange { start, end });
    }
    Ok(PortRange {
        start: start as u16,
        end: end as u16,
    })
}

/// Parse a `start-end` string (or a single port) into a validated range.
///
/// Surrounding whitespace is ignored. Anything after `#` is treated as a comment.
pub fn parse_range_str(s: &str) -> Result<PortRange> {
    let line = s.split('#').next().map(str::trim).unwrap_or("");
    if line.is_empty() {
        return Err(anyhow!("empty port range"));
    }

    let (a, b) = line.split_once('-').unwrap_or((line, line));
    let start = parse_port_num(a.trim()).with_context(|| format!("invalid range start: {a}"))?;
    let end = parse_port_num(b.trim()).with_context(|| format!("invalid range end: {b}"))?;
    Ok(validate_range(start, end)?)
}

/// Split `range` round-robin across `workers` buckets.
///
/// Worker `i` receives every port `p` with `(p - start) % workers == i`, so
/// a single worker's share is spread over the whole range rather than one
/// contiguous slice.
pub fn partition_round_robin(range: PortRange, workers: usize) -> Vec<Vec<u16>> {
    let workers = workers.max(1);
    let mut out: Vec<Vec<u16>> = (0..workers)
        .map(|_| Vec::with_capacity(range.num_ports() / workers + 1))
        .collect();
    for port in range.iter() {
        let idx = usize::from(port - range.start) % workers;
        out[idx].push(port);
    }
    out
}

fn parse_port_num(s: &str) -> Result<i64> {
    s.parse::<i64>().map_err(|e| anyhow!(e))
}
