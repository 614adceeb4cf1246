//! The worker: runs one app's user modules on a main loop and reaches the
//! app's widgets only through remote handles.
//!
//! The same code serves both hosting modes. A process worker reads frames
//! from stdin and writes them to stdout ([`stdio`]); a thread worker is
//! handed the two ends of in-memory channels by the supervisor.

pub mod conduit;
pub mod marshal;
pub mod modules;
pub mod proxies;
pub mod remote;
pub mod runtime;
pub mod stdio;

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use panel_protocol::codec::FrameReader;
use panel_protocol::{FlowControl, ProtocolError, RemoteError, ToSupervisor, ToWorker};
use tokio::sync::mpsc;

pub use conduit::Conduit;
pub use proxies::ProxyError;
pub use remote::RemoteHandle;
pub use runtime::{serve, serve_init};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("supervisor link is closed")]
    Disconnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Raised by the supervisor while servicing one of our requests.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("cannot marshal value: {0}")]
    Marshal(String),

    #[error("{0}")]
    Script(String),

    #[error("attribute `{0}` is private")]
    Private(String),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where downward frames come from.
pub trait FrameSource: Send {
    /// `Ok(None)` once the supervisor side has gone away.
    fn recv(&mut self) -> Result<Option<ToWorker>, WorkerError>;
}

impl FrameSource for mpsc::UnboundedReceiver<ToWorker> {
    fn recv(&mut self) -> Result<Option<ToWorker>, WorkerError> {
        Ok(self.blocking_recv())
    }
}

impl<R: BufRead + Send> FrameSource for FrameReader<R> {
    fn recv(&mut self) -> Result<Option<ToWorker>, WorkerError> {
        Ok(self.next_frame()?)
    }
}

/// Where upward frames go. Shared by every worker thread.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError>;
}

/// Counters a worker keeps about itself.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub requests: AtomicU64,
    pub replies: AtomicU64,
    pub remote_errors: AtomicU64,
    pub deletes: AtomicU64,
    pub dispatched: AtomicU64,
    pub user_failures: AtomicU64,
}

impl WorkerStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A worker's flow control and counters, visible from outside when the
/// worker runs as a thread.
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    pub flow: Arc<FlowControl>,
    pub stats: Arc<WorkerStats>,
}

impl WorkerProbe {
    pub fn new(permits: usize) -> Self {
        Self {
            flow: Arc::new(FlowControl::new(permits)),
            stats: Arc::new(WorkerStats::default()),
        }
    }
}
