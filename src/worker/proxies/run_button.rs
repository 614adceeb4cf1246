//! Run button proxy: drives a step function while the button is pressed.
//!
//! Pressing calls the button's action once on the main loop. The action
//! returns a step function (usually a closure over its own state). A driver
//! thread then asks the main loop to call that step over and over. Each step
//! returns how many seconds to wait before the next one, or `()` when it is
//! done.
//!
//! When a run ends the driver hands back to the main loop, which joins it
//! before the button reads as stopped.
//!
//! `stop()` is cooperative: the run ends once the step in progress yields,
//! unless `resume()` comes first. `kill()` ends it at the next wake-up
//! without waiting for a yield.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use panel_protocol::{CallableRef, Dispatch, HandleId, ProxyCall, UpwardOp, WireValue};
use rhai::{Dynamic, FnPtr};
use tracing::{debug, error, info};

use super::ProxyError;
use crate::worker::{WorkerError, WorkerStats};
use crate::worker::conduit::Conduit;
use crate::worker::modules::{UserModules, Widgets};

pub const START: &str = "start";
pub const STEP: &str = "step";
pub const ENDED: &str = "ended";

/// What the main loop tells the driver about one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Yielded(f64),
    Finished,
    Failed(String),
}

enum Event {
    Step(StepOutcome),
    Wake,
}

struct Run {
    generation: u64,
    module: String,
    step: FnPtr,
    events: std_mpsc::Sender<Event>,
}

pub struct RunButtonProxy {
    handle: HandleId,
    conduit: Arc<Conduit>,
    action: Option<CallableRef>,
    fixed_cadence: bool,
    running: Arc<AtomicBool>,
    delayed: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    kill_requested: Arc<AtomicBool>,
    generation: AtomicU64,
    run: Mutex<Option<Run>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RunButtonProxy {
    pub fn new(handle: HandleId, conduit: Arc<Conduit>, action: Option<CallableRef>, fixed_cadence: bool) -> Self {
        Self {
            handle,
            conduit,
            action,
            fixed_cadence,
            running: Arc::new(AtomicBool::new(false)),
            delayed: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            kill_requested: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
            run: Mutex::new(None),
            driver: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_delayed(&self) -> bool {
        self.delayed.load(Ordering::Relaxed)
    }

    /// A start asked for from user code; the main loop runs it next.
    pub fn request_start(&self) -> Result<(), ProxyError> {
        if self.is_running() {
            return Err(ProxyError::AlreadyRunning("run button"));
        }
        let call = ProxyCall::new(self.handle, START, vec![]);
        if !self.conduit.enqueue(Dispatch::ProxyCall(call)) {
            return Err(ProxyError::NotRunning("worker"));
        }
        Ok(())
    }

    /// Calls the action and starts a driver for the step it returns. Runs on
    /// the main loop.
    pub fn begin(&self, modules: &mut UserModules, widgets: &Widgets) -> Result<(), WorkerError> {
        if self.is_running() {
            return Err(ProxyError::AlreadyRunning("run button").into());
        }
        self.join_driver();
        let result = self.launch(modules, widgets);
        if result.is_err() {
            self.publish_pressed(false);
        }
        result
    }

    fn launch(&self, modules: &mut UserModules, widgets: &Widgets) -> Result<(), WorkerError> {
        let action = self.action.as_ref().ok_or(ProxyError::NoAction("run button"))?;
        let step = modules
            .call(action, widgets)?
            .try_cast::<FnPtr>()
            .ok_or_else(|| WorkerError::Script(format!("{action} must return a step function")))?;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (events, rx) = std_mpsc::channel();
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(Run {
            generation,
            module: action.module.clone(),
            step,
            events,
        });
        self.stop_requested.store(false, Ordering::Release);
        self.kill_requested.store(false, Ordering::Release);
        self.delayed.store(false, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);

        let driver = Driver {
            handle: self.handle,
            generation,
            fixed_cadence: self.fixed_cadence,
            conduit: self.conduit.clone(),
            running: self.running.clone(),
            delayed: self.delayed.clone(),
            stop_requested: self.stop_requested.clone(),
            kill_requested: self.kill_requested.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("{}-run-{}", self.conduit.worker(), self.handle))
            .spawn(move || driver.run(rx));
        match spawned {
            Ok(thread) => {
                *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread);
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
                return Err(ProxyError::from(e).into());
            }
        }
        info!(handle = %self.handle, %action, generation, "run started");
        self.publish_pressed(true);
        Ok(())
    }

    /// Runs one step on the main loop and hands the outcome to the driver.
    /// Steps from an earlier run are ignored.
    pub fn step(&self, modules: &UserModules, generation: i64) {
        let (module, step, events) = {
            let run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
            match run.as_ref() {
                Some(r) if r.generation as i64 == generation => (r.module.clone(), r.step.clone(), r.events.clone()),
                _ => {
                    debug!(handle = %self.handle, generation, "stale step dropped");
                    return;
                }
            }
        };
        let outcome = match modules.call_ptr(&module, &step) {
            Ok(value) => step_outcome(&value),
            Err(e) => StepOutcome::Failed(e.to_string()),
        };
        if let StepOutcome::Failed(message) = &outcome {
            error!(handle = %self.handle, "run step failed: {message}");
            WorkerStats::bump(&self.conduit.stats().user_failures);
        }
        let _ = events.send(Event::Step(outcome));
    }

    /// Joins the driver of a run that has ended. Runs on the main loop.
    pub fn end(&self, generation: i64) {
        if self.generation.load(Ordering::Acquire) as i64 != generation {
            debug!(handle = %self.handle, generation, "stale end dropped");
            return;
        }
        self.join_driver();
        self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.running.store(false, Ordering::Release);
        debug!(handle = %self.handle, generation, "run ended");
    }

    pub fn stop(&self) -> Result<(), ProxyError> {
        if !self.is_running() {
            return Err(ProxyError::NotRunning("run button"));
        }
        self.stop_requested.store(true, Ordering::Release);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ProxyError> {
        self.stop_requested.store(false, Ordering::Release);
        Ok(())
    }

    pub fn kill(&self) -> Result<(), ProxyError> {
        if !self.is_running() {
            return Err(ProxyError::NotRunning("run button"));
        }
        self.kill_requested.store(true, Ordering::Release);
        if let Some(run) = self.run.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = run.events.send(Event::Wake);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        if self.is_running() {
            let _ = self.kill();
        }
        self.join_driver();
        self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.running.store(false, Ordering::Release);
    }

    fn join_driver(&self) {
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver {
            let _ = driver.join();
        }
    }

    fn publish_pressed(&self, pressed: bool) {
        publish_pressed(&self.conduit, self.handle, pressed);
    }
}

fn publish_pressed(conduit: &Conduit, handle: HandleId, pressed: bool) {
    let op = UpwardOp::SetAttr {
        handle,
        name: "pressed".into(),
        value: WireValue::Bool(pressed),
    };
    if let Err(e) = conduit.request(op) {
        debug!(%handle, "cannot publish button state: {e}");
    }
}

fn step_outcome(value: &Dynamic) -> StepOutcome {
    if value.is_unit() {
        return StepOutcome::Finished;
    }
    if let Ok(secs) = value.as_float() {
        return StepOutcome::Yielded(secs);
    }
    if let Ok(secs) = value.as_int() {
        return StepOutcome::Yielded(secs as f64);
    }
    StepOutcome::Failed(format!(
        "step must return a number of seconds or (), got {}",
        value.type_name()
    ))
}

struct Driver {
    handle: HandleId,
    generation: u64,
    fixed_cadence: bool,
    conduit: Arc<Conduit>,
    running: Arc<AtomicBool>,
    delayed: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    kill_requested: Arc<AtomicBool>,
}

impl Driver {
    fn run(self, events: std_mpsc::Receiver<Event>) {
        self.drive(&events);
        publish_pressed(&self.conduit, self.handle, false);
        let ended = ProxyCall::new(self.handle, ENDED, vec![WireValue::Int(self.generation as i64)]);
        if !self.conduit.enqueue(Dispatch::ProxyCall(ended)) {
            // no main loop left to join us; shutdown does
            self.running.store(false, Ordering::Release);
        }
    }

    fn killed(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    fn drive(&self, events: &std_mpsc::Receiver<Event>) {
        loop {
            if self.killed() {
                return;
            }
            let started = Instant::now();
            let step = ProxyCall::new(self.handle, STEP, vec![WireValue::Int(self.generation as i64)]);
            if !self.conduit.enqueue(Dispatch::ProxyCall(step)) {
                return;
            }
            let secs = loop {
                match events.recv() {
                    Ok(Event::Step(StepOutcome::Yielded(secs))) => break secs,
                    Ok(Event::Step(_)) | Err(_) => return,
                    Ok(Event::Wake) if self.killed() => return,
                    Ok(Event::Wake) => {}
                }
            };
            if self.killed() || self.stop_requested.load(Ordering::Acquire) {
                return;
            }
            let mut pause = Duration::from_secs_f64(secs.max(0.0));
            if self.fixed_cadence {
                match pause.checked_sub(started.elapsed()) {
                    Some(rest) => pause = rest,
                    None => {
                        self.delayed.store(true, Ordering::Relaxed);
                        pause = Duration::ZERO;
                    }
                }
            }
            if !self.sleep(events, pause) {
                return;
            }
        }
    }

    /// False when killed while sleeping.
    fn sleep(&self, events: &std_mpsc::Receiver<Event>, pause: Duration) -> bool {
        let deadline = Instant::now() + pause;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            match events.recv_timeout(left) {
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
                Ok(Event::Wake) if self.killed() => return false,
                Ok(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::marshal::Bridge;
    use crate::worker::{FrameSink, WorkerProbe};
    use panel_protocol::{ToSupervisor, Upward, WorkerId};
    use std::fs;
    use tokio::sync::mpsc;

    /// Keeps every upward op; nothing answers.
    struct Recorder(Arc<Mutex<Vec<UpwardOp>>>);

    impl FrameSink for Recorder {
        fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
            if let ToSupervisor::Request(Upward { op, .. }) = frame {
                self.0.lock().unwrap().push(op);
            }
            Ok(())
        }
    }

    const SCRIPT: &str = r#"
fn sweep() {
    let n = 0;
    || { n += 1; if n > 3 { () } else { 0.01 } }
}
fn forever() { || 0.01 }
fn once() { || () }
fn broken() { 42 }
"#;

    struct Rig {
        _dir: tempfile::TempDir,
        modules: UserModules,
        local: mpsc::UnboundedReceiver<Dispatch>,
        conduit: Arc<Conduit>,
        sent: Arc<Mutex<Vec<UpwardOp>>>,
    }

    fn rig() -> Rig {
        rig_with(false)
    }

    /// An open rig records what the button publishes.
    fn rig_with(open: bool) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.rhai"), SCRIPT).unwrap();
        let probe = WorkerProbe::new(4);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (conduit, local) = Conduit::new(WorkerId(1), Box::new(Recorder(sent.clone())), &probe);
        if !open {
            conduit.close();
        }
        let mut modules = UserModules::new(Bridge::new(conduit.clone()), dir.path());
        modules.import("main").unwrap();
        Rig {
            _dir: dir,
            modules,
            local,
            conduit,
            sent,
        }
    }

    fn button(rig: &Rig, function: &str) -> RunButtonProxy {
        RunButtonProxy::new(HandleId(8), rig.conduit.clone(), Some(CallableRef::new("main", function)), false)
    }

    /// Plays the main loop: runs queued steps until the driver stops asking.
    fn pump(rig: &mut Rig, button: &RunButtonProxy, limit: usize) -> usize {
        let mut steps = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while steps < limit && Instant::now() < deadline {
            match rig.local.try_recv() {
                Ok(Dispatch::ProxyCall(call)) if call.method == STEP => {
                    let generation = match call.args.first() {
                        Some(WireValue::Int(g)) => *g,
                        _ => panic!("step without generation"),
                    };
                    button.step(&rig.modules, generation);
                    steps += 1;
                }
                Ok(Dispatch::ProxyCall(call)) if call.method == ENDED => match call.args.first() {
                    Some(WireValue::Int(g)) => button.end(*g),
                    _ => panic!("end without generation"),
                },
                Ok(other) => panic!("unexpected {other:?}"),
                Err(_) if !button.is_running() => break,
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        steps
    }

    #[test]
    fn runs_until_the_step_finishes() {
        let mut rig = rig();
        let b = button(&rig, "sweep");
        b.begin(&mut rig.modules, &Widgets::new()).unwrap();
        assert!(b.is_running());
        let steps = pump(&mut rig, &b, 10);
        assert_eq!(steps, 4);
        assert!(!b.is_running());
        assert!(b.driver.lock().unwrap().is_none());
        assert!(b.run.lock().unwrap().is_none());
    }

    #[test]
    fn finishing_on_the_first_step_releases_the_toggle() {
        let mut rig = rig_with(true);
        let b = button(&rig, "once");
        b.begin(&mut rig.modules, &Widgets::new()).unwrap();
        assert_eq!(pump(&mut rig, &b, 10), 1);
        assert!(!b.is_running());
        assert!(b.driver.lock().unwrap().is_none());

        let pressed: Vec<WireValue> = rig
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match op {
                UpwardOp::SetAttr { name, value, .. } if name == "pressed" => Some(value.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(pressed, vec![WireValue::Bool(true), WireValue::Bool(false)]);
    }

    #[test]
    fn a_new_run_starts_once_the_last_one_is_joined() {
        let mut rig = rig();
        let b = button(&rig, "once");
        b.begin(&mut rig.modules, &Widgets::new()).unwrap();
        pump(&mut rig, &b, 10);
        b.begin(&mut rig.modules, &Widgets::new()).unwrap();
        assert_eq!(pump(&mut rig, &b, 10), 1);
        assert!(!b.is_running());
    }

    #[test]
    fn stop_lands_after_the_next_yield() {
        let mut rig = rig();
        let b = button(&rig, "forever");
        b.begin(&mut rig.modules, &Widgets::new()).unwrap();
        assert_eq!(pump(&mut rig, &b, 2), 2);
        b.stop().unwrap();
        let extra = pump(&mut rig, &b, 5);
        assert!(extra <= 1, "ran {extra} more steps");
        b.shutdown();
        assert!(!b.is_running());
        assert!(matches!(b.stop(), Err(ProxyError::NotRunning(_))));
    }

    #[test]
    fn kill_ends_without_a_yield() {
        let mut rig = rig();
        let b = button(&rig, "forever");
        b.begin(&mut rig.modules, &Widgets::new()).unwrap();
        // a step is queued but never run
        assert!(matches!(rig.local.blocking_recv(), Some(Dispatch::ProxyCall(_))));
        b.kill().unwrap();
        b.shutdown();
        assert!(!b.is_running());
    }

    #[test]
    fn action_must_return_a_step_function() {
        let mut rig = rig();
        let b = button(&rig, "broken");
        let err = b.begin(&mut rig.modules, &Widgets::new()).unwrap_err();
        assert!(err.to_string().contains("step function"));
        assert!(!b.is_running());
        let none = RunButtonProxy::new(HandleId(9), rig.conduit.clone(), None, false);
        assert!(matches!(
            none.begin(&mut rig.modules, &Widgets::new()),
            Err(WorkerError::Proxy(ProxyError::NoAction(_)))
        ));
    }

    #[test]
    fn stale_steps_are_ignored() {
        let mut rig = rig();
        let b = button(&rig, "forever");
        b.begin(&mut rig.modules, &Widgets::new()).unwrap();
        b.step(&rig.modules, 99);
        assert!(b.is_running());
        b.kill().unwrap();
        b.shutdown();
    }

    #[test]
    fn outcomes_follow_the_returned_value() {
        assert_eq!(step_outcome(&Dynamic::UNIT), StepOutcome::Finished);
        assert_eq!(step_outcome(&Dynamic::from_float(0.5)), StepOutcome::Yielded(0.5));
        assert_eq!(step_outcome(&Dynamic::from_int(2)), StepOutcome::Yielded(2.0));
        assert!(matches!(step_outcome(&Dynamic::from("x")), StepOutcome::Failed(_)));
    }
}
