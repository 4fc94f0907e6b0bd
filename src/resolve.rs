use ipnet::IpNet;
use log::{debug, warn};
use std::net::IpAddr;

use crate::error::{Result, ScanError};

/// A target that passed resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub input: String,
    pub addr: IpAddr,
    /// Input looked suspicious (bare number, loopback). Scanning still proceeds.
    pub fishy: bool,
}

/// Networks a scan is never run against.
const DISALLOWED: &[&str] = &["0.0.0.0/8", "::/128"];

/// Whether `ip` falls in a disallowed bogon network.
pub fn is_disallowed_bogon(ip: IpAddr) -> bool {
    DISALLOWED
        .iter()
        .filter_map(|n| n.parse::<IpNet>().ok())
        .any(|net| net.contains(&ip))
}

/// Whether the raw input or its resolution should be flagged in the report.
pub fn is_fishy(input: &str, addr: IpAddr) -> bool {
    let bare_number = !input.is_empty() && input.chars().all(|c| c.is_ascii_digit());
    bare_number || addr.is_loopback()
}

/// Resolve `input` (IPv4, IPv6 or host name) to a single address.
///
/// The first address returned by the system resolver is used.
pub async fn resolve_target(input: &str) -> Result<ResolvedTarget> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ScanError::MissingAddress);
    }

    let addr = match input.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            let mut addrs = tokio::net::lookup_host((input, 0))
                .await
                .map_err(|e| {
                    debug!("lookup of {input} failed: {e}");
                    ScanError::Unresolvable(input.to_string())
                })?;
            addrs
                .next()
                .map(|sa| sa.ip())
                .ok_or_else(|| ScanError::Unresolvable(input.to_string()))?
        }
    };

    if is_disallowed_bogon(addr) {
        return Err(ScanError::Bogon(addr));
    }

    let fishy = is_fishy(input, addr);
    if fishy {
        warn!("target {input} resolved to {addr}; results may be unreliable");
    }
    Ok(ResolvedTarget {
        input: input.to_string(),
        addr,
        fishy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn zero_network_is_bogon() {
        assert!(is_disallowed_bogon(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 123))));
        assert!(is_disallowed_bogon(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert!(!is_disallowed_bogon(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
    }

    #[test]
    fn fishy_inputs() {
        assert!(is_fishy("127.0.0.1", IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(is_fishy("12345", IpAddr::V4(Ipv4Addr::new(0, 0, 48, 57))));
        assert!(!is_fishy("10.1.2.3", IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
    }

    #[tokio::test]
    async fn literal_addresses_skip_lookup() {
        let t = resolve_target("10.0.0.7").await.unwrap();
        assert_eq!(t.addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(!t.fishy);

        let t = resolve_target("127.0.0.1").await.unwrap();
        assert!(t.fishy);
    }

    #[tokio::test]
    async fn empty_and_bogon_inputs_fail() {
        assert!(matches!(resolve_target("  ").await, Err(ScanError::MissingAddress)));
        assert!(matches!(resolve_target("0.1.2.3").await, Err(ScanError::Bogon(_))));
    }
}
