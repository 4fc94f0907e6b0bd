use std::sync::{Arc, Mutex};
use std::time::Duration;

use fanscan::config::WorkerTunables;
use fanscan::types::{AssignMsg, PortState};
use fanscan::worker::run_worker_with;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

#[tokio::test(start_paused = true)]
async fn backlog_starts_only_on_next_drain_pass() {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (res_tx, mut res_rx) = mpsc::unbounded_channel();
    for port in 1..=102u16 {
        cmd_tx
            .send(AssignMsg { port, addr: "192.0.2.1".into() })
            .unwrap();
    }

    let started: Arc<Mutex<Vec<(u16, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
    let log = started.clone();
    let tunables = WorkerTunables {
        concurrency: 100,
        connect_timeout: Duration::from_secs(5),
        drain_interval: Duration::from_secs(2),
    };
    let t0 = Instant::now();
    let worker = tokio::spawn(run_worker_with(cmd_rx, res_tx, tunables, move |msg, _| {
        log.lock().unwrap().push((msg.port, Instant::now()));
        async move {
            time::sleep(Duration::from_secs(1)).await;
            PortState::Closed
        }
    }));

    let mut reported = Vec::new();
    for _ in 0..102 {
        reported.push(res_rx.recv().await.expect("worker result"));
    }
    drop(cmd_tx);
    worker.await.unwrap();

    let started = started.lock().unwrap();
    assert_eq!(started.len(), 102);
    let immediate: Vec<u16> = started
        .iter()
        .filter(|(_, at)| *at < t0 + Duration::from_secs(1))
        .map(|(p, _)| *p)
        .collect();
    assert_eq!(immediate, (1..=100).collect::<Vec<u16>>());

    let deferred: Vec<(u16, Instant)> = started
        .iter()
        .filter(|(p, _)| *p > 100)
        .copied()
        .collect();
    assert_eq!(deferred.len(), 2);
    for (_, at) in deferred {
        assert!(at >= t0 + Duration::from_secs(2));
        assert!(at < t0 + Duration::from_secs(3));
    }

    reported.sort_by_key(|m| m.port);
    reported.dedup_by_key(|m| m.port);
    assert_eq!(reported.len(), 102);
}

#[tokio::test(start_paused = true)]
async fn disconnect_waits_for_in_flight_probes() {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (res_tx, mut res_rx) = mpsc::unbounded_channel();
    cmd_tx
        .send(AssignMsg { port: 8080, addr: "192.0.2.1".into() })
        .unwrap();
    drop(cmd_tx);

    let worker = tokio::spawn(run_worker_with(
        cmd_rx,
        res_tx,
        WorkerTunables {
            concurrency: 10,
            connect_timeout: Duration::from_secs(5),
            drain_interval: Duration::from_secs(2),
        },
        |_, _| async {
            time::sleep(Duration::from_millis(500)).await;
            PortState::Filtered
        },
    ));

    let msg = res_rx.recv().await.expect("in-flight probe still reports");
    assert_eq!(msg.port, 8080);
    assert_eq!(msg.state, PortState::Filtered);
    worker.await.unwrap();
    assert!(res_rx.recv().await.is_none());
}
