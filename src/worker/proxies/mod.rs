//! Worker-side specialty proxies.
//!
//! A few widgets need behaviour that runs inside the worker: a timer ticking
//! on its own thread, a run button driving a step function, a shell
//! evaluating lines, an image written through shared memory. Their remote
//! handles consult the proxy first and fall back to the supervisor for
//! everything else.

pub mod image;
pub mod run_button;
pub mod shell;
pub mod timer;

use std::path::Path;
use std::sync::Arc;

use panel_protocol::{HandleId, ProxyKind};
use rhai::Dynamic;
use tracing::error;

use super::WorkerError;
use super::conduit::Conduit;
use super::marshal::Bridge;

pub use image::ImageProxy;
pub use run_button::RunButtonProxy;
pub use shell::ShellProxy;
pub use timer::TimerProxy;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("{0} has no action")]
    NoAction(&'static str),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("shared buffer: {0}")]
    Buffer(String),

    #[error("cannot start proxy thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Clone)]
pub enum Special {
    Timer(Arc<TimerProxy>),
    RunButton(Arc<RunButtonProxy>),
    Shell(Arc<ShellProxy>),
    Image(Arc<ImageProxy>),
}

impl Special {
    /// The proxy a prototype asks for, if any. An image whose buffer cannot
    /// be mapped gets no proxy; its pixels then travel in the request.
    pub fn create(handle: HandleId, kind: &ProxyKind, conduit: &Arc<Conduit>) -> Option<Self> {
        match kind {
            ProxyKind::Generic => None,
            ProxyKind::Timer => Some(Self::Timer(Arc::new(TimerProxy::new(handle, conduit.clone())))),
            ProxyKind::RunButton { action, fixed_cadence } => Some(Self::RunButton(Arc::new(RunButtonProxy::new(
                handle,
                conduit.clone(),
                action.clone(),
                *fixed_cadence,
            )))),
            ProxyKind::Shell => Some(Self::Shell(Arc::new(ShellProxy::new(handle)))),
            ProxyKind::Image { path, capacity } => match ImageProxy::open(handle, conduit.clone(), path, *capacity) {
                Ok(image) => Some(Self::Image(Arc::new(image))),
                Err(e) => {
                    error!(%handle, path = %path.display(), "cannot map image buffer: {e}");
                    None
                }
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timer(_) => "timer",
            Self::RunButton(_) => "run_button",
            Self::Shell(_) => "shell",
            Self::Image(_) => "image",
        }
    }

    /// Worker-local attributes.
    pub fn property(&self, name: &str) -> Option<Dynamic> {
        match (self, name) {
            (Self::Timer(t), "running") => Some(Dynamic::from_bool(t.is_running())),
            (Self::Timer(t), "delayed") => Some(Dynamic::from_bool(t.is_delayed())),
            (Self::RunButton(r), "running") => Some(Dynamic::from_bool(r.is_running())),
            (Self::RunButton(r), "delayed") => Some(Dynamic::from_bool(r.is_delayed())),
            (Self::Image(i), "capacity") => Some(Dynamic::from_int(i.capacity() as i64)),
            _ => None,
        }
    }

    /// Worker-local methods called from user code on the main thread. `None`
    /// means the supervisor should handle the call.
    pub fn call(&self, bridge: &Arc<Bridge>, method: &str, args: &[Dynamic]) -> Option<Result<Dynamic, WorkerError>> {
        let unit = |r: Result<(), ProxyError>| Some(r.map(|_| Dynamic::UNIT).map_err(WorkerError::from));
        match (self, method) {
            (Self::Timer(t), "start") => Some(t.start_with(bridge, args).map(|_| Dynamic::UNIT)),
            (Self::Timer(t), "stop") => unit(t.stop()),
            (Self::Timer(t), "ack") => unit(t.ack()),
            // starting needs the module engine, which is busy running the
            // caller; the main loop picks it up next
            (Self::RunButton(r), "start") => unit(r.request_start()),
            (Self::RunButton(r), "stop") => unit(r.stop()),
            (Self::RunButton(r), "resume") => unit(r.resume()),
            (Self::RunButton(r), "kill") => unit(r.kill()),
            (Self::Image(i), "display") => unit(i.display(args)),
            _ => None,
        }
    }

    /// The `_stop` hook: called on the main thread as the worker exits.
    pub fn shutdown(&self) {
        match self {
            Self::Timer(t) => t.shutdown(),
            Self::RunButton(r) => r.shutdown(),
            Self::Shell(s) => s.shutdown(),
            Self::Image(_) => {}
        }
    }

    pub fn start_shell(&self, bridge: &Arc<Bridge>, app_dir: &Path, widgets: &super::modules::Widgets) {
        if let Self::Shell(shell) = self {
            if let Err(e) = shell.start(bridge.clone(), app_dir, widgets.clone()) {
                error!(handle = %shell.handle(), "cannot start shell: {e}");
            }
        }
    }
}

pub(crate) fn number(value: &Dynamic, what: &str) -> Result<f64, ProxyError> {
    value
        .as_float()
        .or_else(|_| value.as_int().map(|i| i as f64))
        .map_err(|t| ProxyError::Argument(format!("{what} must be a number, got {t}")))
}
