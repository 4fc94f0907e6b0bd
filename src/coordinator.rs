//! Scan coordination: splits the range across workers, aggregates their
//! classifications, restarts workers that die with unfinished work, and
//! decides when the scan is complete.
//!
//! A session moves `Idle -> Running -> Draining -> Complete`. It enters
//! `Draining` when every port has a classification (all workers are then
//! asked to disconnect) and `Complete` once the exit gate has seen every
//! configured worker leave cleanly.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Isolation, ScanConfig, WorkerTunables};
use crate::error::{Result, ScanError};
use crate::ports::{partition_round_robin, validate_range};
use crate::resolve::ResolvedTarget;
use crate::services::{load_services, ServiceNameMap};
use crate::transport::{
    ProcessLauncher, TaskLauncher, WorkerEvent, WorkerId, WorkerLauncher, WorkerLink,
};
use crate::types::{AssignMsg, ClassifyMsg, OpenPort, PortRange, PortState, ScanReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Waiting,
    Scanned,
}

/// Ports handed to one worker and whether each has been reported yet.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    slots: BTreeMap<u16, SlotState>,
}

impl Assignment {
    pub fn insert_waiting(&mut self, port: u16) {
        self.slots.insert(port, SlotState::Waiting);
    }

    /// Returns true only on the `Waiting -> Scanned` transition.
    pub fn mark_scanned(&mut self, port: u16) -> bool {
        match self.slots.get_mut(&port) {
            Some(slot @ SlotState::Waiting) => {
                *slot = SlotState::Scanned;
                true
            }
            _ => false,
        }
    }

    pub fn state(&self, port: u16) -> Option<SlotState> {
        self.slots.get(&port).copied()
    }

    /// Ports still waiting, ascending.
    pub fn waiting(&self) -> Vec<u16> {
        self.slots
            .iter()
            .filter(|(_, s)| **s == SlotState::Waiting)
            .map(|(p, _)| *p)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Result of one `WorkersGate::tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTick {
    /// Still short of the expected count; carries the count so far.
    Counting(usize),
    /// This tick reached the expected count.
    Opened,
    /// Ticked past the expected count.
    Exceeded,
}

/// Counts clean worker exits against the configured worker count.
#[derive(Debug, Clone)]
pub struct WorkersGate {
    expected: usize,
    count: usize,
}

impl WorkersGate {
    pub fn new(expected: usize) -> Self {
        Self { expected, count: 0 }
    }

    pub fn tick(&mut self) -> GateTick {
        self.count += 1;
        if self.count == self.expected {
            GateTick::Opened
        } else if self.count < self.expected {
            GateTick::Counting(self.count)
        } else {
            GateTick::Exceeded
        }
    }

    pub fn is_open(&self) -> bool {
        self.count >= self.expected
    }
}

/// Aggregated classifications with a running total.
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    pub open: Vec<OpenPort>,
    pub closed: Vec<u16>,
    pub filtered: Vec<u16>,
    scanned: HashSet<u16>,
}

impl ScanResults {
    /// `open + closed + filtered`.
    pub fn total(&self) -> usize {
        self.open.len() + self.closed.len() + self.filtered.len()
    }

    pub fn is_scanned(&self, port: u16) -> bool {
        self.scanned.contains(&port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Draining,
    Complete,
}

pub struct WorkerRecord {
    pub id: WorkerId,
    pub assignment: Assignment,
    /// Set on the worker whose report completed the scan.
    pub last_worker: bool,
    pub alive: bool,
    link: Box<dyn WorkerLink>,
}

impl std::fmt::Debug for WorkerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRecord")
            .field("id", &self.id)
            .field("assigned", &self.assignment.len())
            .field("last_worker", &self.last_worker)
            .field("alive", &self.alive)
            .finish()
    }
}

/// All coordinator state for one scan.
pub struct ScanSession<L> {
    launcher: L,
    workers: usize,
    range: PortRange,
    target: Option<ResolvedTarget>,
    services: ServiceNameMap,
    results: ScanResults,
    table: Vec<WorkerRecord>,
    gate: WorkersGate,
    phase: Phase,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl<L: WorkerLauncher> ScanSession<L> {
    pub fn new(launcher: L, workers: usize) -> Self {
        let workers = workers.max(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            launcher,
            workers,
            range: PortRange::FULL,
            target: None,
            services: ServiceNameMap::new(),
            results: ScanResults::default(),
            table: Vec::new(),
            gate: WorkersGate::new(workers),
            phase: Phase::Idle,
            events_tx,
            events_rx,
        }
    }

    /// Set the port range. On error the previous range is kept.
    pub fn configure(&mut self, start: i64, end: i64) -> Result<usize> {
        if matches!(self.phase, Phase::Running | Phase::Draining) {
            return Err(ScanError::ScanActive);
        }
        self.range = validate_range(start, end)?;
        self.reset();
        Ok(self.num_ports())
    }

    /// Drop results and worker state from any previous scan.
    pub fn reset(&mut self) {
        for rec in &mut self.table {
            rec.link.kill();
        }
        self.table.clear();
        // late events from killed workers land on the old channel
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.events_tx = events_tx;
        self.events_rx = events_rx;
        self.results = ScanResults::default();
        self.gate = WorkersGate::new(self.workers);
        self.phase = Phase::Idle;
    }

    pub fn num_ports(&self) -> usize {
        self.range.num_ports()
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn results(&self) -> &ScanResults {
        &self.results
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerRecord> {
        self.table.get(index)
    }

    /// Load the service-name map from `services_path`, then start all workers.
    pub async fn begin_scan(
        &mut self,
        target: ResolvedTarget,
        services_path: impl AsRef<Path>,
    ) -> Result<()> {
        let services = load_services(services_path).await;
        self.start(target, services)
    }

    /// Spawn the workers and hand out the range round-robin.
    pub fn start(&mut self, target: ResolvedTarget, services: ServiceNameMap) -> Result<()> {
        if self.phase != Phase::Idle {
            self.reset();
        }
        info!(
            "starting {} workers for {} ports {} thru {} ({} ports)",
            self.workers,
            target.addr,
            self.range.start,
            self.range.end,
            self.num_ports()
        );
        self.services = services;
        self.target = Some(target);
        self.phase = Phase::Running;

        for (index, ports) in partition_round_robin(self.range, self.workers)
            .into_iter()
            .enumerate()
        {
            let id = WorkerId { index, generation: 0 };
            let rec = self.spawn_with(id, &ports)?;
            if rec.assignment.is_empty() {
                debug!("worker {index} has no ports; it idles until disconnect");
            }
            self.table.push(rec);
        }
        Ok(())
    }

    fn spawn_with(&mut self, id: WorkerId, ports: &[u16]) -> Result<WorkerRecord> {
        let addr = self
            .target
            .as_ref()
            .map(|t| t.addr.to_string())
            .ok_or(ScanError::MissingAddress)?;
        let link = self.launcher.launch(id, self.events_tx.clone())?;
        let mut rec = WorkerRecord {
            id,
            assignment: Assignment::default(),
            last_worker: false,
            alive: true,
            link,
        };
        debug!("sending {} ports to worker {}", ports.len(), id.index);
        for &port in ports {
            if let Err(e) = rec.link.send(AssignMsg {
                port,
                addr: addr.clone(),
            }) {
                // leave it waiting; the exit handler will hand it out again
                error!("worker {} did not take port {port}: {e:#}", id.index);
            }
            rec.assignment.insert_waiting(port);
        }
        Ok(rec)
    }

    /// Apply one worker event and return the resulting phase.
    pub fn handle_event(&mut self, event: WorkerEvent) -> Result<Phase> {
        match event {
            WorkerEvent::Classified { id, msg } => self.on_classified(id, msg)?,
            WorkerEvent::Exited { id, success } => self.on_exited(id, success)?,
            WorkerEvent::Faulted { id, error } => {
                error!("worker {} (gen {}) errored: {error}", id.index, id.generation);
            }
        }
        Ok(self.phase)
    }

    fn current(&mut self, id: WorkerId) -> Option<&mut WorkerRecord> {
        self.table
            .get_mut(id.index)
            .filter(|rec| rec.id.generation == id.generation)
    }

    fn on_classified(&mut self, id: WorkerId, msg: ClassifyMsg) -> Result<()> {
        let ClassifyMsg { port, state } = msg;
        if !self.range.contains(port) {
            return Err(ScanError::Accounting(format!(
                "worker {} reported port {port} outside {}",
                id.index, self.range
            )));
        }
        if self.results.is_scanned(port) {
            return Err(ScanError::Accounting(format!(
                "port {port} reported twice (second time by worker {})",
                id.index
            )));
        }

        match state {
            PortState::Open => {
                let service = self.services.get(&port).cloned();
                self.results.open.push(OpenPort { port, service });
            }
            PortState::Closed => self.results.closed.push(port),
            PortState::Filtered => self.results.filtered.push(port),
        }
        self.results.scanned.insert(port);
        debug!("PORT {port}: {state} (worker {})", id.index);

        match self.current(id) {
            Some(rec) => {
                if !rec.assignment.mark_scanned(port) {
                    warn!("worker {} reported port {port} it was not waiting on", id.index);
                }
            }
            None => warn!(
                "classification for port {port} from superseded worker {} gen {}",
                id.index, id.generation
            ),
        }

        let total = self.results.total();
        let expected = self.num_ports();
        if total > expected {
            return Err(ScanError::Accounting(format!(
                "counted {total} results for {expected} ports"
            )));
        }
        if total == expected && self.phase == Phase::Running {
            if let Some(rec) = self.current(id) {
                rec.last_worker = true;
            }
            info!("all {expected} ports classified; disconnecting {} workers", self.table.len());
            for rec in self.table.iter_mut().filter(|r| r.alive) {
                rec.link.disconnect();
            }
            self.phase = Phase::Draining;
            self.settle();
        }
        Ok(())
    }

    fn on_exited(&mut self, id: WorkerId, success: bool) -> Result<()> {
        let Some(rec) = self.current(id) else {
            warn!("exit from superseded worker {} gen {}", id.index, id.generation);
            return Ok(());
        };
        rec.alive = false;
        let waiting = rec.assignment.waiting();
        info!(
            "worker {} exited ({})",
            id.index,
            if success { "ok" } else { "failed" }
        );

        if !waiting.is_empty() {
            info!("restarting worker {} with {} unfinished ports", id.index, waiting.len());
            let next = WorkerId {
                index: id.index,
                generation: id.generation + 1,
            };
            let replacement = self.spawn_with(next, &waiting)?;
            self.table[id.index] = replacement;
            return Ok(());
        }

        match self.gate.tick() {
            GateTick::Counting(n) => debug!("{n}/{} workers finished", self.workers),
            GateTick::Opened => debug!("all {} workers finished", self.workers),
            GateTick::Exceeded => warn!("more worker exits than workers"),
        }
        self.settle();
        Ok(())
    }

    fn settle(&mut self) {
        if self.phase == Phase::Draining && self.gate.is_open() {
            self.phase = Phase::Complete;
        }
    }

    /// Terminate every worker immediately.
    pub fn abort(&mut self) {
        for rec in self.table.iter_mut().filter(|r| r.alive) {
            rec.link.kill();
        }
    }

    /// Snapshot of the aggregated results.
    pub fn report(&self) -> ScanReport {
        let mut open = self.results.open.clone();
        open.sort_by_key(|o| o.port);
        let mut closed = self.results.closed.clone();
        closed.sort_unstable();
        let mut filtered = self.results.filtered.clone();
        filtered.sort_unstable();
        ScanReport {
            addr: self
                .target
                .as_ref()
                .map(|t| t.addr.to_string())
                .unwrap_or_default(),
            fishy_address: self.target.as_ref().is_some_and(|t| t.fishy),
            range: self.range,
            open,
            closed,
            filtered,
            finished_at: crate::report::now_rfc3339(),
        }
    }

    /// Drive the session from worker events until it completes.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<ScanReport> {
        while self.phase != Phase::Complete {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("scan cancelled; killing workers");
                    self.abort();
                    return Err(ScanError::Cancelled);
                }
                ev = self.events_rx.recv() => ev,
            };
            let Some(event) = event else {
                break;
            };
            if let Err(e) = self.handle_event(event) {
                error!("aborting scan: {e}");
                self.abort();
                return Err(e);
            }
        }
        Ok(self.report())
    }
}

/// Resolve-to-report pipeline for one target.
pub async fn run_scan(
    target: ResolvedTarget,
    range: PortRange,
    config: &ScanConfig,
    cancel: CancellationToken,
) -> anyhow::Result<ScanReport> {
    let tunables = WorkerTunables::from(config);
    match config.isolation {
        Isolation::Task => {
            let session = ScanSession::new(TaskLauncher { tunables }, config.workers);
            drive(session, target, range, config, cancel).await
        }
        Isolation::Process => {
            let launcher = ProcessLauncher::current_exe(tunables)?;
            let session = ScanSession::new(launcher, config.workers);
            drive(session, target, range, config, cancel).await
        }
    }
}

async fn drive<L: WorkerLauncher>(
    mut session: ScanSession<L>,
    target: ResolvedTarget,
    range: PortRange,
    config: &ScanConfig,
    cancel: CancellationToken,
) -> anyhow::Result<ScanReport> {
    session.configure(i64::from(range.start), i64::from(range.end))?;
    session.begin_scan(target, &config.services_path).await?;
    Ok(session.run(cancel).await?)
}
