//! The worker's main loop.
//!
//! Startup imports the app's modules and wraps each widget prototype in a
//! remote handle, attaching a specialty proxy where the prototype asks for
//! one. The loop then runs dispatches one at a time until `Stop`, and
//! shutdown stops the proxies and gives every handle back.

use std::sync::Arc;

use panel_protocol::{
    CallableRef, Dispatch, ProxyCall, ToSupervisor, ToWorker, WidgetPrototype, WireValue, WorkerInit, WorkerPhase,
};
use rhai::Dynamic;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::conduit::Conduit;
use super::marshal::Bridge;
use super::modules::{UserModules, Widgets};
use super::proxies::run_button::{ENDED, START, STEP};
use super::proxies::timer::TICK;
use super::proxies::{ProxyError, Special, TimerProxy};
use super::remote::RemoteHandle;
use super::{FrameSink, FrameSource, WorkerError, WorkerProbe, WorkerStats};

/// Waits for the init frame, then serves until told to stop or the
/// supervisor goes away.
pub fn serve(
    mut source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    probe: Option<WorkerProbe>,
) -> Result<(), WorkerError> {
    let init = match source.recv()? {
        Some(ToWorker::Init(init)) => init,
        Some(other) => return Err(WorkerError::UnexpectedFrame(frame_name(&other).to_string())),
        None => return Err(WorkerError::Disconnected),
    };
    serve_init(init, source, sink, probe)
}

pub fn serve_init(
    init: WorkerInit,
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    probe: Option<WorkerProbe>,
) -> Result<(), WorkerError> {
    let probe = probe.unwrap_or_else(|| WorkerProbe::new(init.permits));
    let (conduit, local) = Conduit::new(init.worker, sink, &probe);
    // the demux ends on its own once the downward stream closes
    conduit.spawn_demux(source)?;
    let mut main = MainLoop::start(init, conduit.clone(), local);
    main.run();
    main.finish();
    Ok(())
}

fn frame_name(frame: &ToWorker) -> &'static str {
    match frame {
        ToWorker::Init(_) => "init",
        ToWorker::Dispatch(_) => "dispatch",
        ToWorker::Reply(_) => "reply",
        ToWorker::Permit => "permit",
    }
}

struct MainLoop {
    conduit: Arc<Conduit>,
    bridge: Arc<Bridge>,
    modules: UserModules,
    widgets: Widgets,
    anonymous: Vec<RemoteHandle>,
    local: mpsc::UnboundedReceiver<Dispatch>,
}

impl MainLoop {
    fn start(init: WorkerInit, conduit: Arc<Conduit>, local: mpsc::UnboundedReceiver<Dispatch>) -> Self {
        let worker = init.worker;
        conduit.report_phase(WorkerPhase::Importing);
        let bridge = Bridge::new(conduit.clone());
        let mut modules = UserModules::new(bridge.clone(), &init.app_dir);
        for name in &init.modules {
            if let Err(e) = modules.import(name) {
                error!(%worker, module = %name, "import failed: {e}");
                let report = ToSupervisor::ImportFailed {
                    module: name.clone(),
                    message: e.to_string(),
                };
                if let Err(e) = conduit.report(report) {
                    debug!(%worker, "import failure report lost: {e}");
                }
            }
        }

        let adopt = |proto: &WidgetPrototype| {
            if let Some(special) = Special::create(proto.handle.id, &proto.proxy, &conduit) {
                debug!(%worker, handle = %proto.handle.id, kind = special.kind(), "proxy attached");
                bridge.add_special(proto.handle.id, special);
            }
            RemoteHandle::adopt(&bridge, proto.handle)
        };
        let widgets: Widgets = init.widgets.iter().map(|(id, proto)| (id.clone(), adopt(proto))).collect();
        let anonymous: Vec<RemoteHandle> = init.anonymous.iter().map(adopt).collect();

        for (_, special) in bridge.specials() {
            special.start_shell(&bridge, &init.app_dir, &widgets);
        }

        info!(
            %worker,
            modules = init.modules.len(),
            widgets = widgets.len(),
            proxies = bridge.specials().len(),
            "worker running"
        );
        conduit.report_phase(WorkerPhase::Running);
        Self {
            conduit,
            bridge,
            modules,
            widgets,
            anonymous,
            local,
        }
    }

    fn run(&mut self) {
        while let Some(dispatch) = self.local.blocking_recv() {
            match dispatch {
                Dispatch::Invoke(callable) => self.invoke(&callable),
                Dispatch::ProxyCall(call) => self.proxy_call(call),
                Dispatch::Stop => break,
            }
        }
    }

    fn invoke(&mut self, callable: &CallableRef) {
        debug!(worker = %self.conduit.worker(), %callable, "invoke");
        if let Err(e) = self.modules.call(callable, &self.widgets) {
            self.user_failure(callable, &e);
        }
    }

    fn user_failure(&self, callable: &CallableRef, e: &WorkerError) {
        WorkerStats::bump(&self.conduit.stats().user_failures);
        error!(worker = %self.conduit.worker(), %callable, "user code failed: {e}");
    }

    fn proxy_call(&mut self, call: ProxyCall) {
        let worker = self.conduit.worker();
        let Some(special) = self.bridge.special(call.handle) else {
            warn!(%worker, handle = %call.handle, method = %call.method, "proxy call for a handle without a proxy");
            return;
        };
        let result = match (&special, call.method.as_str()) {
            (Special::Timer(timer), TICK) => {
                self.tick(timer);
                Ok(())
            }
            (Special::RunButton(button), START) => button.begin(&mut self.modules, &self.widgets),
            (Special::RunButton(button), STEP) => {
                match call.args.first() {
                    Some(WireValue::Int(generation)) => button.step(&self.modules, *generation),
                    other => warn!(%worker, ?other, "step without a generation"),
                }
                Ok(())
            }
            (Special::RunButton(button), ENDED) => {
                match call.args.first() {
                    Some(WireValue::Int(generation)) => button.end(*generation),
                    other => warn!(%worker, ?other, "end without a generation"),
                }
                Ok(())
            }
            (Special::Shell(shell), "push_line") => match call.args.into_iter().next() {
                Some(WireValue::Str(line)) => shell.push_line(line).map_err(WorkerError::from),
                _ => Err(ProxyError::Argument("push_line needs a string".into()).into()),
            },
            (_, method) => {
                let args: Vec<Dynamic> = call.args.into_iter().map(|a| self.bridge.from_wire(a)).collect();
                special
                    .call(&self.bridge, method, &args)
                    .unwrap_or_else(|| {
                        Err(WorkerError::UnexpectedFrame(format!("{} has no `{method}`", special.kind())))
                    })
                    .map(drop)
            }
        };
        match result {
            Ok(()) => {}
            // a toggle released after the run finished by itself
            Err(WorkerError::Proxy(ProxyError::NotRunning(what))) => debug!(%worker, "{what} is not running"),
            Err(e) => error!(%worker, handle = %call.handle, method = %call.method, "proxy call failed: {e}"),
        }
    }

    fn tick(&mut self, timer: &TimerProxy) {
        match timer.begin_tick() {
            // stopped after this tick was queued
            None => return,
            Some(None) => debug!(handle = %timer.handle(), "timer has no action"),
            Some(Some(action)) => self.invoke(&action),
        }
        timer.end_tick();
    }

    fn finish(self) {
        let worker = self.conduit.worker();
        self.conduit.report_phase(WorkerPhase::Stopping);
        for (handle, special) in self.bridge.specials() {
            debug!(%worker, %handle, kind = special.kind(), "stopping proxy");
            special.shutdown();
        }
        self.bridge.clear_specials();

        let Self {
            conduit,
            modules,
            widgets,
            anonymous,
            local,
            ..
        } = self;
        drop(local);
        drop(widgets);
        drop(anonymous);
        drop(modules);

        let stats = conduit.stats();
        info!(
            %worker,
            requests = WorkerStats::get(&stats.requests),
            deletes = WorkerStats::get(&stats.deletes),
            failures = WorkerStats::get(&stats.user_failures),
            "worker stopped"
        );
        conduit.report_phase(WorkerPhase::Dead);
        conduit.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panel_protocol::{HandleId, HandleRef, LogLevel, ProxyKind, Reply, ReplyOutcome, Upward, UpwardOp, WorkerId};
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::Mutex;
    use std::thread;

    /// Stands in for the supervisor: records every frame and answers each
    /// request with `Null` and a permit.
    struct Fake {
        down: mpsc::UnboundedSender<ToWorker>,
        seen: Arc<Mutex<Vec<ToSupervisor>>>,
    }

    impl FrameSink for Fake {
        fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
            if let ToSupervisor::Request(Upward { seq, op }) = &frame {
                if op.expects_reply() {
                    let _ = self.down.send(ToWorker::Reply(Reply {
                        seq: *seq,
                        outcome: ReplyOutcome::Value(WireValue::Null),
                    }));
                }
                let _ = self.down.send(ToWorker::Permit);
            }
            self.seen.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn init(dir: &std::path::Path, widgets: BTreeMap<String, panel_protocol::WidgetPrototype>) -> WorkerInit {
        WorkerInit {
            worker: WorkerId(7),
            app_dir: dir.to_path_buf(),
            modules: vec!["main".into(), "absent".into()],
            widgets,
            anonymous: vec![],
            permits: 4,
            log_level: LogLevel::Info,
            log_dir: None,
        }
    }

    fn run_worker(init: WorkerInit, dispatches: Vec<Dispatch>) -> (Vec<ToSupervisor>, WorkerProbe) {
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Fake {
            down: down_tx.clone(),
            seen: seen.clone(),
        };
        down_tx.send(ToWorker::Init(init)).unwrap();
        for d in dispatches {
            down_tx.send(ToWorker::Dispatch(d)).unwrap();
        }
        let probe = WorkerProbe::new(4);
        let worker_probe = probe.clone();
        let worker = thread::spawn(move || serve(Box::new(down_rx), Box::new(sink), Some(worker_probe)));
        worker.join().unwrap().unwrap();
        let frames = seen.lock().unwrap().clone();
        (frames, probe)
    }

    fn phases(frames: &[ToSupervisor]) -> Vec<WorkerPhase> {
        frames
            .iter()
            .filter_map(|f| match f {
                ToSupervisor::Phase(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lifecycle_survives_failing_imports_and_calls() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("main.rhai"),
            "fn ok() { 1 }\nfn bad() { throw \"nope\"; }\n",
        )
        .unwrap();
        let (frames, probe) = run_worker(
            init(dir.path(), BTreeMap::new()),
            vec![
                Dispatch::Invoke(CallableRef::new("main", "ok")),
                Dispatch::Invoke(CallableRef::new("main", "bad")),
                Dispatch::Invoke(CallableRef::new("main", "ok")),
                Dispatch::Stop,
            ],
        );
        assert_eq!(
            phases(&frames),
            vec![
                WorkerPhase::Importing,
                WorkerPhase::Running,
                WorkerPhase::Stopping,
                WorkerPhase::Dead
            ]
        );
        assert!(frames.iter().any(|f| matches!(
            f,
            ToSupervisor::ImportFailed { module, .. } if module == "absent"
        )));
        assert_eq!(WorkerStats::get(&probe.stats.user_failures), 1);
        assert_eq!(WorkerStats::get(&probe.stats.dispatched), 4);
    }

    #[test]
    fn widget_handles_are_released_once_at_exit() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.rhai"), "fn touch(level) { level.value = 3; }\n").unwrap();
        let widgets = BTreeMap::from([(
            "level".to_string(),
            panel_protocol::WidgetPrototype {
                handle: HandleRef::new(HandleId(11)),
                proxy: ProxyKind::Generic,
            },
        )]);
        let (frames, probe) = run_worker(
            init(dir.path(), widgets),
            vec![Dispatch::Invoke(CallableRef::new("main", "touch")), Dispatch::Stop],
        );
        let ops: Vec<&UpwardOp> = frames
            .iter()
            .filter_map(|f| match f {
                ToSupervisor::Request(Upward { op, .. }) => Some(op),
                _ => None,
            })
            .collect();
        assert!(matches!(ops[0], UpwardOp::SetAttr { name, value: WireValue::Int(3), .. } if name == "value"));
        let deletes = ops
            .iter()
            .filter(|op| matches!(op, UpwardOp::DeleteHandle { handle } if *handle == HandleId(11)))
            .count();
        assert_eq!(deletes, 1);
        assert!(probe.flow.peak_in_flight() <= 4);
    }

    #[test]
    fn a_first_frame_other_than_init_is_refused() {
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        down_tx.send(ToWorker::Permit).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Fake { down: down_tx, seen };
        let err = serve(Box::new(down_rx), Box::new(sink), None).unwrap_err();
        assert!(matches!(err, WorkerError::UnexpectedFrame(ref f) if f == "permit"));
    }
}
