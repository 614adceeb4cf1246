//! The supervising side: owns the widgets, runs one worker per open app and
//! services the workers' requests on a single UI thread.

pub mod bus;
pub mod dispatcher;
pub mod host;
pub mod link;
pub mod marshal;
pub mod object;
pub mod params;
pub mod registry;
pub mod ui;
pub mod value;

use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use panel_protocol::WorkerId;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use host::{HostStats, WidgetHost};
pub use link::{Inbound, InboundTx};
pub use ui::{UiHandle, UiState};
pub use value::Value;

use crate::config::RuntimeConfig;
use crate::layout::LoadedApp;

pub struct Supervisor {
    ui: UiHandle,
    inbound: InboundTx,
    ui_thread: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    grace: Duration,
}

impl Supervisor {
    /// Starts the UI and dispatcher threads. No app is open yet.
    pub fn start(config: RuntimeConfig) -> Result<Self> {
        let grace = config.shutdown_grace;
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (ui, ui_thread) = ui::spawn_ui(config, inbound.clone())?;
        let dispatcher = dispatcher::spawn_dispatcher(inbound_rx, ui.clone())?;
        info!("supervisor started");
        Ok(Self {
            ui,
            inbound,
            ui_thread: Some(ui_thread),
            dispatcher: Some(dispatcher),
            grace,
        })
    }

    pub fn ui(&self) -> &UiHandle {
        &self.ui
    }

    pub fn open_app(&self, path: &Path) -> Result<WorkerId> {
        let path = path.to_path_buf();
        self.ui.call(move |state| state.open_file(&path))?
    }

    pub fn open_document(&self, app: LoadedApp) -> Result<WorkerId> {
        self.ui.call(move |state| state.open_document(app))?
    }

    /// Closes an app and blocks until its worker is reaped. Returns whether
    /// the worker stopped within the grace period.
    pub fn close_app(&self, worker: WorkerId) -> Result<bool> {
        let (tx, rx) = std_mpsc::channel();
        self.ui.call(move |state| state.close(worker, Some(tx)))?;
        // the reaper enforces the grace period; the margin covers the hand-off
        rx.recv_timeout(self.grace + Duration::from_secs(5))
            .with_context(|| format!("{worker} was not reaped"))
    }

    pub fn workers(&self) -> Result<Vec<WorkerId>> {
        self.ui.call(|state| state.workers())
    }

    /// Closes every app, then stops the dispatcher and UI threads.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(ui_thread) = self.ui_thread.take() else {
            return Ok(());
        };
        for worker in self.workers().unwrap_or_default() {
            match self.close_app(worker) {
                Ok(true) => {}
                Ok(false) => warn!(%worker, "worker had to be abandoned"),
                Err(e) => warn!(%worker, "close failed: {e}"),
            }
        }
        let _ = self.inbound.send(Inbound::Shutdown);
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.join().map_err(|_| anyhow!("dispatcher thread panicked"))?;
        }
        self.ui.quit();
        ui_thread.join().map_err(|_| anyhow!("UI thread panicked"))?;
        info!("supervisor stopped");
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("supervisor shutdown: {e}");
        }
    }
}
