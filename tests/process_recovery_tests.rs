//! Kept in its own test binary: the wrapper script is written and then
//! executed, and no other test in this process may fork in between.
#![cfg(unix)]

use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fanscan::config::WorkerTunables;
use fanscan::coordinator::{Phase, ScanSession};
use fanscan::resolve::ResolvedTarget;
use fanscan::services::ServiceNameMap;
use fanscan::transport::ProcessLauncher;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Write a wrapper that exits nonzero on its first run and execs the real
/// worker binary on every later run.
fn crash_once_wrapper() -> (PathBuf, PathBuf) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("fanscan-crash-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let marker = dir.join("crashed");
    let script = dir.join("crash-once-worker.sh");
    let body = format!(
        "#!/bin/sh\nif mkdir '{}' 2>/dev/null; then exit 3; fi\nexec '{}' \"$@\"\n",
        marker.display(),
        env!("CARGO_BIN_EXE_fanscan"),
    );
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    (dir, script)
}

#[tokio::test]
async fn worker_that_dies_before_serving_is_replaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    let start = open_port.min(65533);

    let (dir, script) = crash_once_wrapper();
    let launcher = ProcessLauncher {
        program: script,
        tunables: WorkerTunables {
            concurrency: 16,
            connect_timeout: Duration::from_secs(2),
            drain_interval: Duration::from_millis(50),
        },
    };
    let mut session = ScanSession::new(launcher, 1);
    session.configure(i64::from(start), i64::from(start) + 2).unwrap();
    let target = ResolvedTarget {
        input: "127.0.0.1".into(),
        addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        fishy: true,
    };
    session.start(target, ServiceNameMap::new()).unwrap();

    let report = timeout(Duration::from_secs(30), session.run(CancellationToken::new()))
        .await
        .expect("scan finished in time")
        .expect("scan ok");
    let _ = std::fs::remove_dir_all(&dir);

    assert_eq!(session.phase(), Phase::Complete);
    assert_eq!(session.results().total(), session.num_ports());
    assert!(report.open.iter().any(|o| o.port == open_port));

    let rec = session.worker(0).unwrap();
    assert_eq!(rec.id.index, 0);
    assert_eq!(rec.id.generation, 1);
    assert!(rec.assignment.waiting().is_empty());
    assert_eq!(rec.assignment.len(), 3);
}
