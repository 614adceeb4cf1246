//! The UI thread. Owns every widget; everything that touches one runs here
//! as a posted task.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, mpsc as std_mpsc};
use std::thread::{self, JoinHandle, ThreadId};

use anyhow::{Context, Result, anyhow};
use panel_protocol::{Dispatch, WireValue, WorkerId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::bus::{GlobalBus, SharedBus};
use super::host::WidgetHost;
use super::link::{Inbound, InboundTx, WorkerLink};
use super::object::{Effect, HostError, read_attr};
use super::params::{load_params, params_path, save_params};
use super::value::Value;
use crate::config::RuntimeConfig;
use crate::layout::{LoadedApp, load_app};
use crate::runtime::spawn_async_task;

/// Upper bound on effects processed for one event; a longer cascade is a
/// signal loop.
const MAX_EFFECTS: usize = 10_000;

pub type UiTask = Box<dyn FnOnce(&mut UiState) + Send>;

pub enum UiMsg {
    Task(UiTask),
    Quit,
}

#[derive(Clone)]
pub struct UiHandle {
    tx: mpsc::UnboundedSender<UiMsg>,
    thread: Arc<OnceLock<ThreadId>>,
}

impl UiHandle {
    /// Queues `task` for the UI thread. False once the UI has stopped.
    pub fn post(&self, task: impl FnOnce(&mut UiState) + Send + 'static) -> bool {
        self.tx.send(UiMsg::Task(Box::new(task))).is_ok()
    }

    /// Runs `task` on the UI thread and waits for its result. Never call this
    /// from the UI thread itself.
    pub fn call<R: Send + 'static>(&self, task: impl FnOnce(&mut UiState) -> R + Send + 'static) -> Result<R> {
        if self.thread.get() == Some(&thread::current().id()) {
            return Err(anyhow!("blocking UI call from the UI thread"));
        }
        let (tx, rx) = std_mpsc::channel();
        if !self.post(move |state| {
            let _ = tx.send(task(state));
        }) {
            return Err(anyhow!("UI thread has stopped"));
        }
        rx.recv().map_err(|_| anyhow!("UI task was dropped"))
    }

    pub async fn call_async<R: Send + 'static>(&self, task: impl FnOnce(&mut UiState) -> R + Send + 'static) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        if !self.post(move |state| {
            let _ = tx.send(task(state));
        }) {
            return Err(anyhow!("UI thread has stopped"));
        }
        rx.await.map_err(|_| anyhow!("UI task was dropped"))
    }

    pub fn quit(&self) {
        let _ = self.tx.send(UiMsg::Quit);
    }
}

/// Starts the UI thread. Returns its handle and join handle.
pub fn spawn_ui(config: RuntimeConfig, inbound: InboundTx) -> Result<(UiHandle, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<UiMsg>();
    let handle = UiHandle {
        tx,
        thread: Arc::new(OnceLock::new()),
    };
    let ui = handle.clone();
    let join = thread::Builder::new()
        .name("labpanel-ui".into())
        .spawn(move || {
            let _ = ui.thread.set(thread::current().id());
            let mut state = UiState::new(config, inbound, ui);
            while let Some(msg) = rx.blocking_recv() {
                match msg {
                    UiMsg::Task(task) => {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task(&mut state))) {
                            error!("UI task panicked: {}", panic_message(&panic));
                        }
                    }
                    UiMsg::Quit => break,
                }
            }
            info!(open_apps = state.hosts.len(), "UI loop stopped");
        })
        .context("cannot start UI thread")?;
    Ok((handle, join))
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

pub struct UiState {
    config: RuntimeConfig,
    hosts: BTreeMap<WorkerId, WidgetHost>,
    bus: SharedBus,
    inbound: InboundTx,
    ui: UiHandle,
    next_worker: u32,
}

impl UiState {
    pub fn new(config: RuntimeConfig, inbound: InboundTx, ui: UiHandle) -> Self {
        Self {
            config,
            hosts: BTreeMap::new(),
            bus: GlobalBus::shared(),
            inbound,
            ui,
            next_worker: 1,
        }
    }

    // ── apps ────────────────────────────────────────────────────────

    pub fn open_file(&mut self, path: &Path) -> Result<WorkerId> {
        let app = load_app(path)?;
        self.open_document(app)
    }

    /// Builds the app's widgets and starts its worker.
    pub fn open_document(&mut self, app: LoadedApp) -> Result<WorkerId> {
        let worker = WorkerId(self.next_worker);
        self.next_worker += 1;
        let mut host = WidgetHost::new(worker, app, &self.bus, &self.config.shm_dir);
        let link = WorkerLink::spawn(worker, &self.config, self.inbound.clone())
            .with_context(|| format!("cannot start worker for {}", host.name()))?;
        let init = host.init_message(self.config.permits, self.config.log_level, self.config.log_dir.as_deref());
        host.start(link, init);
        info!(app = %host.name(), %worker, "app opened");
        self.hosts.insert(worker, host);
        Ok(worker)
    }

    /// Starts closing `worker`. The exit is awaited off the UI thread; the
    /// host is dropped once it is reaped, and `done` learns whether the
    /// worker stopped within the grace period.
    pub fn close(&mut self, worker: WorkerId, done: Option<std_mpsc::Sender<bool>>) {
        let Some(host) = self.hosts.get_mut(&worker) else {
            if let Some(done) = done {
                let _ = done.send(false);
            }
            return;
        };
        info!(app = %host.name(), %worker, "closing app");
        match host.begin_close() {
            Some(watch) => {
                let grace = self.config.shutdown_grace;
                let ui = self.ui.clone();
                spawn_async_task(async move {
                    let clean = watch.reap(grace).await;
                    ui.post(move |state| {
                        state.reap(worker);
                        if let Some(done) = done {
                            let _ = done.send(clean);
                        }
                    });
                });
            }
            None => {
                self.reap(worker);
                if let Some(done) = done {
                    let _ = done.send(true);
                }
            }
        }
    }

    fn reap(&mut self, worker: WorkerId) {
        if let Some(host) = self.hosts.remove(&worker) {
            debug!(app = %host.name(), %worker, "app removed");
        }
    }

    /// Closes the app and opens the same document under a fresh worker.
    pub fn reload_app(&mut self, worker: WorkerId) -> Result<WorkerId> {
        let app = self
            .hosts
            .get(&worker)
            .map(|h| h.app().clone())
            .ok_or_else(|| anyhow!("no app with {worker}"))?;
        self.close(worker, None);
        self.open_document(app)
    }

    /// The app's tab became visible.
    pub fn show_app(&mut self, worker: WorkerId) {
        if let Some(host) = self.hosts.get_mut(&worker) {
            host.redraw();
        }
    }

    // ── traffic ─────────────────────────────────────────────────────

    pub fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Frame(worker, frame) => match self.hosts.get_mut(&worker) {
                Some(host) => {
                    let effects = host.handle_frame(frame);
                    self.apply_effects(effects);
                }
                None => debug!(%worker, "frame from a closed app dropped"),
            },
            Inbound::Closed(worker) => {
                if let Some(host) = self.hosts.get_mut(&worker) {
                    host.link_closed();
                }
            }
            Inbound::Shutdown => {}
        }
    }

    /// Fires `signal` on widget `id` of app `worker`, as user input would.
    pub fn fire(&mut self, worker: WorkerId, id: &str, signal: &str, args: &[Value]) -> Result<(), HostError> {
        let host = self
            .hosts
            .get_mut(&worker)
            .ok_or_else(|| HostError::Lookup(worker.to_string()))?;
        let effects = host.emit_by_id(id, signal, args)?;
        self.apply_effects(effects);
        Ok(())
    }

    pub fn apply_effects(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        let mut processed = 0usize;
        while let Some(effect) = queue.pop_front() {
            processed += 1;
            if processed > MAX_EFFECTS {
                error!(dropped = queue.len() + 1, "signal cascade too long, dropping the rest");
                break;
            }
            match effect {
                Effect::Invoke { worker, callable } => match self.hosts.get_mut(&worker) {
                    Some(host) => host.dispatch(Dispatch::Invoke(callable)),
                    None => warn!(%worker, %callable, "callable of a closed app not invoked"),
                },
                Effect::ProxyCall { worker, call } => match self.hosts.get_mut(&worker) {
                    Some(host) => host.dispatch(Dispatch::ProxyCall(call)),
                    None => warn!(%worker, method = %call.method, "proxy call for a closed app dropped"),
                },
                Effect::Emit { worker, handle, signal } => {
                    if let Some(host) = self.hosts.get_mut(&worker) {
                        queue.extend(host.emit_by_handle(handle, &signal, &[]));
                    }
                }
                Effect::Trigger { name } => {
                    let hosts = &self.hosts;
                    let targets = self
                        .bus
                        .borrow_mut()
                        .targets(&name, |w| hosts.get(&w).is_some_and(WidgetHost::is_live));
                    debug!(trigger = %name, receivers = targets.len(), "global trigger");
                    queue.extend(targets.into_iter().map(|(worker, handle)| Effect::Emit {
                        worker,
                        handle,
                        signal: "triggered".into(),
                    }));
                }
            }
        }
    }

    // ── parameters ──────────────────────────────────────────────────

    pub fn save_params(&mut self, worker: WorkerId, path: Option<PathBuf>) -> Result<PathBuf> {
        let host = self.hosts.get(&worker).ok_or_else(|| anyhow!("no app with {worker}"))?;
        let path = path.unwrap_or_else(|| params_path(&self.config.params_dir, host.name()));
        save_params(&path, host.name(), &host.params())?;
        Ok(path)
    }

    /// Restores saved parameters; returns the ids that matched nothing.
    pub fn load_params(&mut self, worker: WorkerId, path: Option<PathBuf>) -> Result<Vec<String>> {
        let host = self.hosts.get_mut(&worker).ok_or_else(|| anyhow!("no app with {worker}"))?;
        let path = path.unwrap_or_else(|| params_path(&self.config.params_dir, host.name()));
        let params = load_params(&path)?;
        Ok(host.apply_params(params))
    }

    // ── inspection ──────────────────────────────────────────────────

    pub fn host(&self, worker: WorkerId) -> Option<&WidgetHost> {
        self.hosts.get(&worker)
    }

    pub fn host_mut(&mut self, worker: WorkerId) -> Option<&mut WidgetHost> {
        self.hosts.get_mut(&worker)
    }

    pub fn workers(&self) -> Vec<WorkerId> {
        self.hosts.keys().copied().collect()
    }

    pub fn find(&self, name: &str) -> Option<WorkerId> {
        self.hosts.values().find(|h| h.name() == name).map(WidgetHost::worker)
    }

    pub fn bus(&self) -> &SharedBus {
        &self.bus
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Attribute of a widget as a plain value, for callers off the UI thread.
    pub fn widget_attr(&self, worker: WorkerId, id: &str, name: &str) -> Result<WireValue, HostError> {
        let widget = self
            .hosts
            .get(&worker)
            .and_then(|h| h.widget(id))
            .ok_or_else(|| HostError::Lookup(format!("{worker}/{id}")))?;
        let value = read_attr(&widget, name)?;
        value
            .to_plain()
            .ok_or_else(|| HostError::Type(format!("{id}.{name} is an object")))
    }
}
