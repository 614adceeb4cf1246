//! The supervisor's end of one worker: a downward frame sender plus the
//! machinery to notice and enforce its exit.

use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use panel_protocol::codec::{decode_line, encode_line};
use panel_protocol::{FlowControl, ToSupervisor, ToWorker, WorkerId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{RuntimeConfig, WorkerMode};
use crate::runtime::get_handle;
use crate::worker::{self, FrameSink, WorkerError, WorkerProbe, WorkerStats};

/// Everything the dispatcher thread drains.
#[derive(Debug)]
pub enum Inbound {
    Frame(WorkerId, ToSupervisor),
    /// The worker's upward stream ended.
    Closed(WorkerId),
    Shutdown,
}

pub type InboundTx = mpsc::UnboundedSender<Inbound>;

/// Upward sink of a thread-hosted worker.
pub struct InboundSink {
    worker: WorkerId,
    tx: InboundTx,
}

impl InboundSink {
    pub fn new(worker: WorkerId, tx: InboundTx) -> Self {
        Self { worker, tx }
    }
}

impl FrameSink for InboundSink {
    fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
        self.tx
            .send(Inbound::Frame(self.worker, frame))
            .map_err(|_| WorkerError::Disconnected)
    }
}

pub struct WorkerLink {
    worker: WorkerId,
    tx: mpsc::UnboundedSender<ToWorker>,
    exited: Option<oneshot::Receiver<()>>,
    kill: Option<oneshot::Sender<()>>,
    probe: Option<WorkerProbe>,
}

impl WorkerLink {
    pub fn spawn(worker: WorkerId, config: &RuntimeConfig, inbound: InboundTx) -> Result<Self> {
        match config.worker_mode {
            WorkerMode::Thread => Self::spawn_thread(worker, config, inbound),
            WorkerMode::Process => Self::spawn_process(worker, config, inbound),
        }
    }

    /// In-process worker on its own OS thread. Same frames, no serialization.
    fn spawn_thread(worker: WorkerId, config: &RuntimeConfig, inbound: InboundTx) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<ToWorker>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let probe = WorkerProbe {
            flow: Arc::new(FlowControl::new(config.permits)),
            stats: Arc::new(WorkerStats::default()),
        };
        let sink = InboundSink::new(worker, inbound.clone());
        let thread_probe = probe.clone();
        thread::Builder::new()
            .name(format!("{worker}-main"))
            .spawn(move || {
                if let Err(e) = worker::serve(Box::new(rx), Box::new(sink), Some(thread_probe)) {
                    error!(%worker, "worker failed: {e}");
                }
                let _ = inbound.send(Inbound::Closed(worker));
                let _ = exit_tx.send(());
            })
            .context("cannot start worker thread")?;
        info!(%worker, "worker thread started");
        Ok(Self {
            worker,
            tx,
            exited: Some(exit_rx),
            kill: None,
            probe: Some(probe),
        })
    }

    /// Child process running `<exe> worker`, JSON lines over stdio.
    fn spawn_process(worker: WorkerId, config: &RuntimeConfig, inbound: InboundTx) -> Result<Self> {
        let exe = match &config.worker_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe().context("cannot locate own executable")?,
        };
        let handle = get_handle();
        let _guard = handle.enter();

        // ── launch ───────────────────────────────────────────────────────
        let mut child = TokioCommand::new(&exe)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot spawn worker {}", exe.display()))?;
        let mut stdin = child.stdin.take().context("worker stdin unavailable")?;
        let stdout = child.stdout.take().context("worker stdout unavailable")?;
        info!(%worker, pid = child.id(), "worker process started");

        // ── downward: channel → child.stdin ──────────────────────────────
        let (tx, mut rx) = mpsc::unbounded_channel::<ToWorker>();
        handle.spawn(async move {
            while let Some(frame) = rx.recv().await {
                let line = match encode_line(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(%worker, "cannot encode frame: {e}");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    debug!(%worker, "worker stdin closed");
                    break;
                }
            }
        });

        // ── upward: child.stdout → inbound ───────────────────────────────
        handle.spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match decode_line::<ToSupervisor>(&line) {
                        Ok(frame) => {
                            if inbound.send(Inbound::Frame(worker, frame)).is_err() {
                                break;
                            }
                        }
                        Err(e) => error!(%worker, "dropping malformed frame: {e}"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(%worker, "worker stdout failed: {e}");
                        break;
                    }
                }
            }
            let _ = inbound.send(Inbound::Closed(worker));
        });

        // ── exit watcher ─────────────────────────────────────────────────
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        handle.spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => debug!(%worker, "worker exited"),
                    Ok(status) => warn!(%worker, "worker exited with {status}"),
                    Err(e) => error!(%worker, "cannot wait for worker: {e}"),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        error!(%worker, "cannot kill worker: {e}");
                    }
                }
            }
            let _ = exit_tx.send(());
        });

        Ok(Self {
            worker,
            tx,
            exited: Some(exit_rx),
            kill: Some(kill_tx),
            probe: None,
        })
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn send(&self, frame: ToWorker) -> Result<(), WorkerError> {
        self.tx.send(frame).map_err(|_| WorkerError::Disconnected)
    }

    /// Flow-control and statistics of a thread-hosted worker.
    pub fn probe(&self) -> Option<&WorkerProbe> {
        self.probe.as_ref()
    }

    /// Detaches the exit notification so the exit can be awaited while the
    /// link keeps carrying frames.
    pub fn exit_watch(&mut self) -> ExitWatch {
        ExitWatch {
            worker: self.worker,
            exited: self.exited.take(),
            kill: self.kill.take(),
        }
    }

    /// A link to nothing: frames are collected by the returned receiver.
    #[cfg(test)]
    pub fn detached(worker: WorkerId) -> (Self, mpsc::UnboundedReceiver<ToWorker>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                worker,
                tx,
                exited: None,
                kill: None,
                probe: None,
            },
            rx,
        )
    }
}

pub struct ExitWatch {
    worker: WorkerId,
    exited: Option<oneshot::Receiver<()>>,
    kill: Option<oneshot::Sender<()>>,
}

impl ExitWatch {
    /// Waits up to `grace` for the worker to exit. A process still running
    /// after that is killed; a thread is left detached. Returns whether the
    /// worker exited on its own.
    pub async fn reap(mut self, grace: Duration) -> bool {
        let worker = self.worker;
        let Some(exited) = self.exited.take() else {
            return true;
        };
        match tokio::time::timeout(grace, exited).await {
            Ok(_) => {
                debug!(%worker, "worker reaped");
                true
            }
            Err(_) => {
                match self.kill.take() {
                    Some(kill) => {
                        error!(%worker, "worker did not stop within {grace:?}, terminating");
                        let _ = kill.send(());
                    }
                    None => error!(%worker, "worker thread did not stop within {grace:?}, detaching"),
                }
                false
            }
        }
    }
}
