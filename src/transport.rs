//! Coordinator <-> worker plumbing.
//!
//! Workers are launched either as tokio tasks or as child processes of the
//! current executable. Both report through one coordinator event channel;
//! for a given worker, its `Exited` event is always sent after its last
//! `Classified` event.

use anyhow::{anyhow, Context};
use log::{debug, error};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::config::WorkerTunables;
use crate::error::{Result, ScanError};
use crate::types::{AssignMsg, ClassifyMsg};
use crate::worker::run_worker;

/// Identifies one incarnation of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub index: usize,
    pub generation: u64,
}

/// Something a worker did, as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Classified { id: WorkerId, msg: ClassifyMsg },
    /// The worker terminated. `success` is false for panics, kills and nonzero exits.
    Exited { id: WorkerId, success: bool },
    /// A fault that is not itself a termination.
    Faulted { id: WorkerId, error: String },
}

/// Coordinator-side handle to a running worker.
pub trait WorkerLink: Send {
    /// Fire-and-forget assignment.
    fn send(&mut self, msg: AssignMsg) -> anyhow::Result<()>;
    /// Ask the worker to finish in-flight work and exit.
    fn disconnect(&mut self);
    /// Terminate immediately.
    fn kill(&mut self);
}

pub trait WorkerLauncher {
    fn launch(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerLink>>;
}

/// Runs each worker as a tokio task in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLauncher {
    pub tunables: WorkerTunables,
}

struct TaskLink {
    commands: Option<mpsc::UnboundedSender<AssignMsg>>,
    abort: AbortHandle,
}

impl WorkerLink for TaskLink {
    fn send(&mut self, msg: AssignMsg) -> anyhow::Result<()> {
        let tx = self
            .commands
            .as_ref()
            .ok_or_else(|| anyhow!("worker already disconnected"))?;
        tx.send(msg).map_err(|_| anyhow!("worker task is gone"))
    }

    fn disconnect(&mut self) {
        self.commands.take();
    }

    fn kill(&mut self) {
        self.commands.take();
        self.abort.abort();
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerLink>> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (res_tx, mut res_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(cmd_rx, res_tx, self.tunables));
        let abort = handle.abort_handle();

        tokio::spawn(async move {
            while let Some(msg) = res_rx.recv().await {
                let _ = events.send(WorkerEvent::Classified { id, msg });
            }
            let success = match handle.await {
                Ok(()) => true,
                Err(e) => {
                    let _ = events.send(WorkerEvent::Faulted {
                        id,
                        error: e.to_string(),
                    });
                    false
                }
            };
            let _ = events.send(WorkerEvent::Exited { id, success });
        });

        Ok(Box::new(TaskLink {
            commands: Some(cmd_tx),
            abort,
        }))
    }
}

/// Runs each worker as a child process speaking JSON lines over stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: PathBuf,
    pub tunables: WorkerTunables,
}

impl ProcessLauncher {
    /// Launch workers by re-executing the current binary in worker mode.
    pub fn current_exe(tunables: WorkerTunables) -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("cannot locate current executable")?;
        Ok(Self { program, tunables })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--worker")
            .arg("--concurrency")
            .arg(self.tunables.concurrency.to_string())
            .arg("--timeout-ms")
            .arg(self.tunables.connect_timeout.as_millis().to_string())
            .arg("--drain-interval-ms")
            .arg(self.tunables.drain_interval.as_millis().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

struct ProcessLink {
    commands: Option<mpsc::UnboundedSender<AssignMsg>>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerLink for ProcessLink {
    fn send(&mut self, msg: AssignMsg) -> anyhow::Result<()> {
        let tx = self
            .commands
            .as_ref()
            .ok_or_else(|| anyhow!("worker already disconnected"))?;
        tx.send(msg).map_err(|_| anyhow!("worker stdin writer is gone"))
    }

    fn disconnect(&mut self) {
        // dropping the sender ends the writer task, which closes the child's stdin
        self.commands.take();
    }

    fn kill(&mut self) {
        self.commands.take();
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        id: WorkerId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Box<dyn WorkerLink>> {
        let spawn_err = |reason: String| ScanError::WorkerSpawn {
            index: id.index,
            reason,
        };
        let mut child = self.command().spawn().map_err(|e| spawn_err(e.to_string()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout not captured".into()))?;
        debug!("worker {} (gen {}) started as pid {:?}", id.index, id.generation, child.id());

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<AssignMsg>();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(msg) = cmd_rx.recv().await {
                let line = match serde_json::to_string(&msg) {
                    Ok(mut s) => {
                        s.push('\n');
                        s
                    }
                    Err(e) => {
                        let _ = writer_events.send(WorkerEvent::Faulted { id, error: e.to_string() });
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    let _ = writer_events.send(WorkerEvent::Faulted {
                        id,
                        error: format!("write to worker stdin failed: {e}"),
                    });
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut kill_armed = true;
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match serde_json::from_str::<ClassifyMsg>(&line) {
                            Ok(msg) => {
                                let _ = events.send(WorkerEvent::Classified { id, msg });
                            }
                            Err(e) => {
                                let _ = events.send(WorkerEvent::Faulted {
                                    id,
                                    error: format!("bad message {line:?}: {e}"),
                                });
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            let _ = events.send(WorkerEvent::Faulted {
                                id,
                                error: format!("read from worker stdout failed: {e}"),
                            });
                            break;
                        }
                    },
                    _ = &mut kill_rx, if kill_armed => {
                        kill_armed = false;
                        if let Err(e) = child.start_kill() {
                            error!("failed to kill worker {}: {e}", id.index);
                        }
                    }
                }
            }
            let success = match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    let _ = events.send(WorkerEvent::Faulted { id, error: e.to_string() });
                    false
                }
            };
            let _ = events.send(WorkerEvent::Exited { id, success });
        });

        Ok(Box::new(ProcessLink {
            commands: Some(cmd_tx),
            kill: Some(kill_tx),
        }))
    }
}

/// Child side of `ProcessLauncher`: serve assignments from stdin until it closes.
pub async fn serve_stdio(tunables: WorkerTunables) -> anyhow::Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<AssignMsg>();
    let (res_tx, mut res_rx) = mpsc::unbounded_channel::<ClassifyMsg>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<AssignMsg>(&line) {
                    Ok(msg) => {
                        if cmd_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("ignoring malformed assignment {line:?}: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("reading assignments failed: {e}");
                    break;
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = res_rx.recv().await {
            let mut line = serde_json::to_string(&msg)?;
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    run_worker(cmd_rx, res_tx, tunables).await;
    writer.await.context("result writer panicked")??;
    Ok(())
}
