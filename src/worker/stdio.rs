//! Process worker transport: JSON lines on stdin and stdout.
//!
//! Stdout belongs to the protocol, so nothing else may print to it. Logs go
//! to a per-worker file once the init frame names the log directory.

use std::io::{self, BufReader, Stdout, Write};
use std::sync::{Mutex, PoisonError};

use panel_protocol::codec::{FrameReader, write_frame};
use panel_protocol::{ToSupervisor, ToWorker};
use tracing::info;

use super::{FrameSink, FrameSource, WorkerError, serve_init};
use crate::logger::init_worker_tracing;

pub struct StdoutSink {
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for StdoutSink {
    fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *out, &frame)?;
        out.flush()?;
        Ok(())
    }
}

/// Entry point of `labpanel worker`.
pub fn run_stdio() -> Result<(), WorkerError> {
    let mut source = FrameReader::new(BufReader::new(io::stdin()));
    let init = match source.recv()? {
        Some(ToWorker::Init(init)) => init,
        Some(_) => return Err(WorkerError::UnexpectedFrame("expected init first".into())),
        None => return Err(WorkerError::Disconnected),
    };
    if let Err(e) = init_worker_tracing(init.worker, init.log_dir.as_deref(), init.log_level) {
        eprintln!("{}: logging disabled: {e:#}", init.worker);
    }
    info!(worker = %init.worker, pid = std::process::id(), app = %init.app_dir.display(), "worker process up");
    serve_init(init, Box::new(source), Box::new(StdoutSink::new()), None)
}
