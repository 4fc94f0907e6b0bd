use fanscan::ports::{parse_range_str, partition_round_robin, validate_range};
use fanscan::types::PortRange;

#[test]
fn parse_range_with_comment() {
    let range = parse_range_str("  20-24   # ftp through lmtp").expect("parse ok");
    assert_eq!(range, PortRange { start: 20, end: 24 });
    assert_eq!(range.num_ports(), 5);
}

#[test]
fn invalid_ranges_rejected() {
    assert!(parse_range_str("0-10").is_err());
    assert!(parse_range_str("10-9").is_err());
    assert!(parse_range_str("1-65536").is_err());
    assert!(parse_range_str("one-two").is_err());
    assert!(validate_range(-5, 10).is_err());
}

#[test]
fn full_range_partition_is_exact() {
    let parts = partition_round_robin(PortRange::FULL, 6);
    let total: usize = parts.iter().map(Vec::len).sum();
    assert_eq!(total, 65535);

    let mut all: Vec<u16> = parts.into_iter().flatten().collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 65535);
    assert_eq!(all.first(), Some(&1));
    assert_eq!(all.last(), Some(&65535));
}
