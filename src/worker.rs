use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::config::WorkerTunables;
use crate::probe::probe_port;
use crate::types::{AssignMsg, ClassifyMsg, PortState};

/// Pending-work queue plus in-flight accounting for one worker.
///
/// Only the owning worker loop touches this, so no locking is involved.
#[derive(Debug)]
pub struct WorkerThrottle {
    pending: VecDeque<AssignMsg>,
    in_flight: usize,
    ceiling: usize,
}

impl WorkerThrottle {
    pub fn new(ceiling: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            in_flight: 0,
            ceiling: ceiling.max(1),
        }
    }

    pub fn enqueue(&mut self, msg: AssignMsg) {
        self.pending.push_back(msg);
    }

    /// Pop as many items as free probe slots allow, in FIFO order.
    /// Every returned item counts as in flight until `complete` is called.
    pub fn drain(&mut self) -> Vec<AssignMsg> {
        let mut started = Vec::new();
        while self.in_flight < self.ceiling {
            let Some(msg) = self.pending.pop_front() else {
                break;
            };
            self.in_flight += 1;
            started.push(msg);
        }
        started
    }

    pub fn complete(&mut self) {
        debug_assert!(self.in_flight > 0, "completed more probes than were started");
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_backlog(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Run one worker unit until its command channel closes and in-flight probes finish.
///
/// Assignments arrive on `commands`; each classification is sent on `results`.
/// Closing `commands` is the disconnect signal.
pub async fn run_worker(
    commands: mpsc::UnboundedReceiver<AssignMsg>,
    results: mpsc::UnboundedSender<ClassifyMsg>,
    tunables: WorkerTunables,
) {
    run_worker_with(commands, results, tunables, |msg, watchdog| async move {
        probe_port(&msg.addr, msg.port, watchdog).await
    })
    .await
}

/// `run_worker` with a caller-supplied probe.
pub async fn run_worker_with<P, F>(
    mut commands: mpsc::UnboundedReceiver<AssignMsg>,
    results: mpsc::UnboundedSender<ClassifyMsg>,
    tunables: WorkerTunables,
    probe: P,
) where
    P: Fn(AssignMsg, Duration) -> F,
    F: Future<Output = PortState>,
{
    let launch = |item: AssignMsg| {
        let port = item.port;
        let fut = probe(item, tunables.connect_timeout);
        async move { (port, fut.await) }
    };
    let mut throttle = WorkerThrottle::new(tunables.concurrency);
    let mut probes = FuturesUnordered::new();
    let mut next_drain: Option<Instant> = None;
    let mut connected = true;

    loop {
        if !connected && probes.is_empty() {
            break;
        }

        tokio::select! {
            msg = commands.recv(), if connected => match msg {
                Some(msg) => {
                    throttle.enqueue(msg);
                    probes.extend(throttle.drain().into_iter().map(&launch));
                    if throttle.has_backlog() && next_drain.is_none() {
                        next_drain = Some(Instant::now() + tunables.drain_interval);
                    }
                }
                None => {
                    connected = false;
                    if throttle.has_backlog() {
                        warn!("disconnected with {} ports still queued; dropping them", throttle.pending());
                    }
                    debug!("disconnect received, {} probes still in flight", throttle.in_flight());
                }
            },
            Some((port, state)) = probes.next(), if !probes.is_empty() => {
                throttle.complete();
                if results.send(ClassifyMsg { port, state }).is_err() {
                    info!("coordinator went away; stopping worker");
                    return;
                }
            },
            _ = time::sleep_until(next_drain.unwrap_or_else(Instant::now)), if next_drain.is_some() => {
                next_drain = None;
                let started = throttle.drain();
                debug!(
                    "drain pass started {} probes, {} still queued",
                    started.len(),
                    throttle.pending()
                );
                probes.extend(started.into_iter().map(&launch));
                if throttle.has_backlog() {
                    next_drain = Some(Instant::now() + tunables.drain_interval);
                }
            },
        }
    }
}
