use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a single TCP port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
        };
        f.write_str(s)
    }
}

/// Inclusive TCP port range, `1 <= start <= end <= 65535`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const FULL: PortRange = PortRange { start: 1, end: 65535 };

    /// Number of ports covered by the range.
    pub fn num_ports(&self) -> usize {
        usize::from(self.end) - usize::from(self.start) + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange::FULL
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Coordinator -> worker: probe one port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AssignMsg {
    pub port: u16,
    pub addr: String,
}

/// Worker -> coordinator: outcome for one port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyMsg {
    pub port: u16,
    pub state: PortState,
}

/// One open port annotated with its service name, if known.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub port: u16,
    pub service: Option<String>,
}

/// Final aggregated outcome of a completed scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanReport {
    pub addr: String,
    pub fishy_address: bool,
    pub range: PortRange,
    pub open: Vec<OpenPort>,
    pub closed: Vec<u16>,
    pub filtered: Vec<u16>,
    pub finished_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_use_lowercase_states() {
        let msg = ClassifyMsg { port: 22, state: PortState::Filtered };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"port":22,"state":"filtered"}"#);

        let assign: AssignMsg = serde_json::from_str(r#"{"port":80,"addr":"10.0.0.1"}"#).unwrap();
        assert_eq!(assign.port, 80);
        assert_eq!(assign.addr, "10.0.0.1");
    }

    #[test]
    fn full_range_counts_every_port() {
        assert_eq!(PortRange::FULL.num_ports(), 65535);
        assert_eq!(PortRange { start: 20, end: 24 }.num_ports(), 5);
    }
}
