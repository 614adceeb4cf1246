//! One open app on the supervisor side: its widgets, handle registry and the
//! link to its worker.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use panel_protocol::{
    CallableRef, Dispatch, HandleId, HandleRef, LogLevel, ProxyKind, Reply, ReplyOutcome, ToSupervisor, ToWorker, Upward,
    UpwardOp, WidgetPrototype, WorkerId, WorkerInit, WorkerPhase,
};
use tracing::{debug, error, info, warn};

use super::bus::SharedBus;
use super::link::{ExitWatch, WorkerLink};
use super::marshal::{args_to_objects, handles_to_objects, kwargs_to_objects, objects_to_handles};
use super::object::{CallCtx, Effect, HostError, ObjectRef, Registration, borrow, borrow_mut, call_object, invoke_method, read_attr};
use super::registry::{HandleRegistry, handle_of};
use super::value::Value;
use crate::layout::LoadedApp;
use crate::logger::request_metrics;
use crate::widgets::{self, BuildCtx, ErrorBox};

pub struct WidgetRecord {
    pub id: Option<String>,
    pub kind: String,
    pub object: ObjectRef,
    pub handle: HandleId,
    pub actions: BTreeMap<String, CallableRef>,
    pub save: bool,
    pub proxy: ProxyKind,
    /// Construction error, when the widget was replaced by an error box.
    pub error: Option<String>,
}

/// Counters kept per app, for logs and tests.
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub requests: BTreeMap<&'static str, u64>,
    pub errors: u64,
    pub permits_released: u64,
    pub dispatched: u64,
    pub import_failures: Vec<(String, String)>,
}

impl HostStats {
    pub fn total_requests(&self) -> u64 {
        self.requests.values().sum()
    }

    pub fn count(&self, op: &str) -> u64 {
        self.requests.get(op).copied().unwrap_or(0)
    }
}

pub struct WidgetHost {
    worker: WorkerId,
    app: LoadedApp,
    records: Vec<WidgetRecord>,
    registry: HandleRegistry,
    link: Option<WorkerLink>,
    phase: WorkerPhase,
    modules: Vec<String>,
    on_init: Vec<CallableRef>,
    on_close: Vec<CallableRef>,
    widgets: BTreeMap<String, WidgetPrototype>,
    anonymous: Vec<WidgetPrototype>,
    stats: HostStats,
}

impl WidgetHost {
    /// Builds every widget and runs the registration hooks. Nothing is sent
    /// until [`start`](Self::start).
    pub fn new(worker: WorkerId, app: LoadedApp, bus: &SharedBus, shm_dir: &Path) -> Self {
        let build_ctx = BuildCtx { bus, shm_dir };
        let mut records = Vec::with_capacity(app.document.widgets.len());
        for spec in &app.document.widgets {
            let (mut object, mut error) = widgets::build_or_error_box(spec, &build_ctx);
            let actions = match spec.parsed_actions() {
                Ok(actions) => actions,
                Err(e) if error.is_none() => {
                    error!(app = %app.name, widget = %spec.label(), "{e}");
                    object = super::object::new_object(ErrorBox::new(spec.label(), e.to_string()));
                    error = Some(e.to_string());
                    BTreeMap::new()
                }
                Err(_) => BTreeMap::new(),
            };
            let proxy = object.try_borrow().map(|o| o.proxy_kind()).unwrap_or_default();
            records.push(WidgetRecord {
                id: spec.id.clone(),
                kind: spec.kind.clone(),
                handle: handle_of(&object),
                object,
                actions,
                save: spec.save,
                proxy,
                error,
            });
        }

        let mut modules = app.document.modules.clone();
        let mut on_init = parse_callables(&app, &app.document.on_init, "on_init");
        let mut on_close = parse_callables(&app, &app.document.on_close, "on_close");
        for record in &records {
            let mut reg = Registration {
                worker,
                id: record.id.as_deref(),
                handle: record.handle,
                modules: &mut modules,
                on_init: &mut on_init,
                on_close: &mut on_close,
                bus,
            };
            match borrow_mut(&record.object) {
                Ok(mut object) => object.register(&mut reg),
                Err(e) => error!(app = %app.name, widget = ?record.id, "cannot register: {e}"),
            }
        }
        modules.dedup();

        // one registry copy per handle shipped in the init message
        let mut registry = HandleRegistry::new();
        let mut widgets = BTreeMap::new();
        let mut anonymous = Vec::new();
        for record in &records {
            match &record.id {
                Some(id) => {
                    let proto = WidgetPrototype {
                        handle: registry.allocate(&record.object, false),
                        proxy: record.proxy.clone(),
                    };
                    if let Some(displaced) = widgets.insert(id.clone(), proto) {
                        warn!(app = %app.name, widget = %id, "duplicate widget id, the last one wins");
                        if let Err(e) = registry.release(displaced.handle.id) {
                            error!(app = %app.name, widget = %id, "{e}");
                        }
                    }
                }
                None if record.proxy != ProxyKind::Generic => anonymous.push(WidgetPrototype {
                    handle: registry.allocate(&record.object, false),
                    proxy: record.proxy.clone(),
                }),
                None => {}
            }
        }

        info!(app = %app.name, %worker, widgets = records.len(), "app built");
        Self {
            worker,
            app,
            records,
            registry,
            link: None,
            phase: WorkerPhase::Created,
            modules,
            on_init,
            on_close,
            widgets,
            anonymous,
            stats: HostStats::default(),
        }
    }

    pub fn init_message(&self, permits: usize, log_level: LogLevel, log_dir: Option<&Path>) -> WorkerInit {
        WorkerInit {
            worker: self.worker,
            app_dir: self.app.dir.clone(),
            modules: self.modules.clone(),
            widgets: self.widgets.clone(),
            anonymous: self.anonymous.clone(),
            permits,
            log_level,
            log_dir: log_dir.map(Path::to_path_buf),
        }
    }

    /// Hands the worker its init frame, then schedules the init callables.
    pub fn start(&mut self, link: WorkerLink, init: WorkerInit) {
        if let Err(e) = link.send(ToWorker::Init(init)) {
            error!(app = %self.app.name, worker = %self.worker, "cannot initialise worker: {e}");
        }
        self.link = Some(link);
        for callable in self.on_init.clone() {
            self.dispatch(Dispatch::Invoke(callable));
        }
    }

    // ── upward requests ─────────────────────────────────────────────

    pub fn handle_frame(&mut self, frame: ToSupervisor) -> Vec<Effect> {
        match frame {
            ToSupervisor::Request(request) => self.execute(request),
            ToSupervisor::Phase(phase) => {
                debug!(worker = %self.worker, %phase, "worker phase");
                self.phase = match (self.phase, phase) {
                    // a close already in progress is not undone by a late phase report
                    (WorkerPhase::Stopping, WorkerPhase::Importing | WorkerPhase::Running) => WorkerPhase::Stopping,
                    _ => phase,
                };
                Vec::new()
            }
            ToSupervisor::ImportFailed { module, message } => {
                error!(app = %self.app.name, worker = %self.worker, module = %module, "import failed: {message}");
                self.stats.import_failures.push((module, message));
                Vec::new()
            }
        }
    }

    /// Services one request on the UI thread. A reply goes back for the ops
    /// that wait for one, and a permit goes back in every case.
    pub fn execute(&mut self, request: Upward) -> Vec<Effect> {
        let started = Instant::now();
        let op = request.op.name();
        let expects_reply = request.op.expects_reply();
        *self.stats.requests.entry(op).or_default() += 1;

        let mut ctx = CallCtx::new(self.worker);
        let result = self.service(&mut ctx, request.op);
        let ok = result.is_ok();
        match result {
            Ok(value) => {
                if expects_reply {
                    let value = objects_to_handles(value, &mut self.registry);
                    self.send(ToWorker::Reply(Reply {
                        seq: request.seq,
                        outcome: ReplyOutcome::Value(value),
                    }));
                }
            }
            Err(e) => {
                self.stats.errors += 1;
                error!(app = %self.app.name, worker = %self.worker, request = op, "{e}");
                if expects_reply {
                    self.send(ToWorker::Reply(Reply {
                        seq: request.seq,
                        outcome: ReplyOutcome::Error(e.to_remote()),
                    }));
                }
            }
        }
        self.send(ToWorker::Permit);
        self.stats.permits_released += 1;
        request_metrics().record(op, self.worker, started.elapsed(), ok);
        ctx.take_effects()
    }

    fn service(&mut self, ctx: &mut CallCtx, op: UpwardOp) -> Result<Value, HostError> {
        let worker = self.worker;
        match op {
            UpwardOp::GetAttr { handle, name } => {
                let object = self.registry.resolve(handle)?;
                read_attr(&object, &name)
            }
            UpwardOp::SetAttr { handle, name, value } => {
                let object = self.registry.resolve(handle)?;
                let value = handles_to_objects(value, &self.registry, worker)?;
                borrow_mut(&object)?.set_attr(&name, value)?;
                Ok(Value::Null)
            }
            UpwardOp::CallHandle { handle, args, kwargs } => {
                let object = self.registry.resolve(handle)?;
                let args = args_to_objects(args, &self.registry, worker)?;
                let kwargs = kwargs_to_objects(kwargs, &self.registry, worker)?;
                call_object(&object, ctx, args, kwargs)
            }
            UpwardOp::CallMethod {
                handle,
                method,
                args,
                kwargs,
            }
            | UpwardOp::CallMethodNoReturn {
                handle,
                method,
                args,
                kwargs,
            } => {
                let object = self.registry.resolve(handle)?;
                let args = args_to_objects(args, &self.registry, worker)?;
                let kwargs = kwargs_to_objects(kwargs, &self.registry, worker)?;
                invoke_method(&object, ctx, &method, args, kwargs)
            }
            UpwardOp::DeleteHandle { handle } => {
                self.registry.release(handle)?;
                Ok(Value::Null)
            }
        }
    }

    // ── downward traffic ────────────────────────────────────────────

    fn send(&self, frame: ToWorker) {
        match &self.link {
            Some(link) => {
                if let Err(e) = link.send(frame) {
                    debug!(worker = %self.worker, "frame not delivered: {e}");
                }
            }
            None => debug!(worker = %self.worker, "no worker attached, frame dropped"),
        }
    }

    /// Queues work for the worker's main loop. Dropped once the worker is
    /// stopping.
    pub fn dispatch(&mut self, dispatch: Dispatch) {
        if matches!(self.phase, WorkerPhase::Stopping | WorkerPhase::Dead) {
            warn!(worker = %self.worker, ?dispatch, "worker is stopping, dispatch dropped");
            return;
        }
        self.stats.dispatched += 1;
        self.send(ToWorker::Dispatch(dispatch));
    }

    /// Fires `signal` on widget `index`: the widget reacts first, then the
    /// bound action (if any) is sent to the worker.
    pub fn emit(&mut self, index: usize, signal: &str, args: &[Value]) -> Vec<Effect> {
        let Some(record) = self.records.get(index) else {
            return Vec::new();
        };
        let mut ctx = CallCtx::new(self.worker);
        let reacted = borrow_mut(&record.object).and_then(|mut object| object.on_signal(&mut ctx, signal, args));
        if let Err(e) = reacted {
            error!(app = %self.app.name, widget = ?record.id, signal, "{e}");
            return ctx.take_effects();
        }
        if let Some(callable) = record.actions.get(signal).cloned() {
            self.dispatch(Dispatch::Invoke(callable));
        }
        ctx.take_effects()
    }

    pub fn emit_by_handle(&mut self, handle: HandleId, signal: &str, args: &[Value]) -> Vec<Effect> {
        match self.records.iter().position(|r| r.handle == handle) {
            Some(index) => self.emit(index, signal, args),
            None => {
                warn!(worker = %self.worker, %handle, signal, "signal for unknown widget");
                Vec::new()
            }
        }
    }

    pub fn emit_by_id(&mut self, id: &str, signal: &str, args: &[Value]) -> Result<Vec<Effect>, HostError> {
        let index = self
            .index_of(id)
            .ok_or_else(|| HostError::Lookup(id.to_string()))?;
        Ok(self.emit(index, signal, args))
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Queues the close callables and the stop sentinel. The link stays so
    /// the close callables are still serviced; the returned watch lets the
    /// caller wait for the exit off the UI thread.
    pub fn begin_close(&mut self) -> Option<ExitWatch> {
        if self.phase != WorkerPhase::Dead {
            for callable in self.on_close.clone() {
                self.dispatch(Dispatch::Invoke(callable));
            }
            self.send(ToWorker::Dispatch(Dispatch::Stop));
            self.phase = WorkerPhase::Stopping;
        }
        self.link.as_mut().map(WorkerLink::exit_watch)
    }

    /// The worker's upward stream ended.
    pub fn link_closed(&mut self) {
        if self.phase != WorkerPhase::Stopping {
            warn!(app = %self.app.name, worker = %self.worker, phase = %self.phase, "worker went away");
        }
        self.phase = WorkerPhase::Dead;
    }

    /// Still accepting work: attached and neither stopping nor gone.
    pub fn is_live(&self) -> bool {
        !matches!(self.phase, WorkerPhase::Stopping | WorkerPhase::Dead) && self.link.is_some()
    }

    pub fn redraw(&mut self) {
        for record in &self.records {
            match borrow_mut(&record.object) {
                Ok(mut object) => object.redraw(),
                Err(e) => warn!(widget = ?record.id, "cannot redraw: {e}"),
            }
        }
    }

    // ── parameters ──────────────────────────────────────────────────

    pub fn params(&self) -> BTreeMap<String, Value> {
        self.records
            .iter()
            .filter(|r| r.save)
            .filter_map(|r| {
                let id = r.id.as_ref()?;
                let value = borrow(&r.object).ok()?.get_param()?;
                Some((id.clone(), value))
            })
            .collect()
    }

    /// Applies saved values. Returns the ids that matched no saved widget.
    pub fn apply_params(&mut self, params: BTreeMap<String, Value>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (id, value) in params {
            let Some(record) = self.records.iter().find(|r| r.save && r.id.as_deref() == Some(id.as_str())) else {
                error!(app = %self.app.name, widget = %id, "unknown parameter id, skipped");
                unknown.push(id);
                continue;
            };
            if let Err(e) = borrow_mut(&record.object).and_then(|mut o| o.set_param(value)) {
                error!(app = %self.app.name, widget = %id, "cannot restore parameter: {e}");
            }
        }
        unknown
    }

    // ── accessors ───────────────────────────────────────────────────

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn name(&self) -> &str {
        &self.app.name
    }

    pub fn app(&self) -> &LoadedApp {
        &self.app
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn records(&self) -> &[WidgetRecord] {
        &self.records
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id.as_deref() == Some(id))
    }

    pub fn widget(&self, id: &str) -> Option<ObjectRef> {
        self.index_of(id).map(|i| self.records[i].object.clone())
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }

    pub fn link(&self) -> Option<&WorkerLink> {
        self.link.as_ref()
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn on_init(&self) -> &[CallableRef] {
        &self.on_init
    }

    pub fn on_close(&self) -> &[CallableRef] {
        &self.on_close
    }

    pub fn prototype(&self, id: &str) -> Option<HandleRef> {
        self.widgets.get(id).map(|p| p.handle)
    }
}

fn parse_callables(app: &LoadedApp, names: &[String], what: &str) -> Vec<CallableRef> {
    names
        .iter()
        .filter_map(|name| match name.parse() {
            Ok(callable) => Some(callable),
            Err(e) => {
                error!(app = %app.name, "{what}: {e}");
                None
            }
        })
        .collect()
}
