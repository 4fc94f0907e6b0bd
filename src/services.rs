use log::{debug, warn};
use std::collections::HashMap;
use std::path::Path;

/// Port number -> service name, built once before workers start.
pub type ServiceNameMap = HashMap<u16, String>;

/// Parse services-database text into a TCP port -> name map.
///
/// Recognised lines look like `name port/tcp [aliases...] [# comment]`.
/// Non-tcp entries and malformed lines are skipped. When a port appears
/// more than once, the later entry replaces the earlier one.
pub fn parse_services_str(s: &str) -> ServiceNameMap {
    let mut out = ServiceNameMap::new();
    for raw_line in s.lines() {
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((port, proto)) = port_proto.split_once('/') else {
            continue;
        };
        if proto != "tcp" {
            continue;
        }
        if let Ok(port) = port.parse::<u16>() {
            out.insert(port, name.to_string());
        }
    }
    out
}

/// Load the services database at `path`.
///
/// Failure to read is not fatal: the scan proceeds without service names.
pub async fn load_services(path: impl AsRef<Path>) -> ServiceNameMap {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let map = parse_services_str(&content);
            debug!("loaded {} tcp service names from {}", map.len(), path.display());
            map
        }
        Err(e) => {
            warn!("could not open {}: {e}; service names will be unresolved", path.display());
            ServiceNameMap::new()
        }
    }
}
