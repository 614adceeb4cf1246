//! Timer proxy: a thread that wakes every `interval` and asks the main loop
//! to run the timer's action.
//!
//! At most one tick is queued at a time. A wake that finds the previous tick
//! still pending is skipped and marks the timer delayed. In retrigger mode the
//! thread also waits for the action to `ack()` before the next interval
//! starts, flagging a late acknowledgement the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use panel_protocol::{CallableRef, Dispatch, HandleId, ProxyCall, UpwardOp, WireValue};
use rhai::{Dynamic, Map};
use tracing::{debug, warn};

use super::{ProxyError, number};
use crate::worker::WorkerError;
use crate::worker::conduit::Conduit;
use crate::worker::marshal::Bridge;

pub const TICK: &str = "tick";

#[derive(Debug, Clone, PartialEq)]
pub struct TimerSettings {
    pub interval: Duration,
    pub action: Option<CallableRef>,
    /// Fire once immediately instead of waiting a full interval first.
    pub call_at_zero: bool,
    /// Wait for `ack()` between firings; late acks mark the timer delayed.
    pub retrigger: Option<Duration>,
}

enum Signal {
    Stop,
    Ack,
}

enum Wake {
    Elapsed,
    Ack,
    Stop,
}

struct Running {
    signals: std_mpsc::Sender<Signal>,
    thread: JoinHandle<()>,
    action: Option<CallableRef>,
}

pub struct TimerProxy {
    handle: HandleId,
    conduit: Arc<Conduit>,
    running: Mutex<Option<Running>>,
    pending: Arc<AtomicBool>,
    delayed: Arc<AtomicBool>,
}

impl TimerProxy {
    pub fn new(handle: HandleId, conduit: Arc<Conduit>) -> Self {
        Self {
            handle,
            conduit,
            running: Mutex::new(None),
            pending: Arc::new(AtomicBool::new(false)),
            delayed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.thread.is_finished())
    }

    pub fn is_delayed(&self) -> bool {
        self.delayed.load(Ordering::Relaxed)
    }

    /// `start()`, `start(interval)`, `start(interval, action)` or
    /// `start(#{interval, action, call_at_zero, retrigger})`. Missing
    /// settings come from the timer widget.
    pub fn start_with(&self, bridge: &Arc<Bridge>, args: &[Dynamic]) -> Result<(), WorkerError> {
        let mut options = Map::new();
        match args {
            [] => {}
            [first, ..] if first.is_map() => {
                options = first.clone().cast::<Map>();
            }
            [interval, rest @ ..] => {
                options.insert("interval".into(), interval.clone());
                if let Some(action) = rest.first() {
                    options.insert("action".into(), action.clone());
                }
            }
        }
        let interval = match options.get("interval") {
            Some(v) => number(v, "interval")?,
            None => match self.remote_attr("interval")? {
                WireValue::Float(f) => f,
                WireValue::Int(i) => i as f64,
                other => return Err(ProxyError::Argument(format!("timer interval is {other:?}")).into()),
            },
        };
        if !(interval > 0.0 && interval.is_finite()) {
            return Err(ProxyError::Argument(format!("interval must be positive, got {interval}")).into());
        }
        let action = match options.get("action") {
            Some(v) if !v.is_unit() => Some(bridge.callable_of(v)?),
            _ => match self.remote_attr("action")? {
                WireValue::Str(s) => Some(bridge.callable_of(&Dynamic::from(s))?),
                _ => None,
            },
        };
        let retrigger = match options.get("retrigger") {
            Some(v) if v.is_bool() => v.as_bool().unwrap_or(false).then_some(interval),
            Some(v) if !v.is_unit() => Some(number(v, "retrigger")?),
            _ => None,
        };
        let settings = TimerSettings {
            interval: Duration::from_secs_f64(interval),
            action,
            call_at_zero: options.get("call_at_zero").is_some_and(|v| v.as_bool().unwrap_or(false)),
            retrigger: retrigger.map(Duration::from_secs_f64),
        };
        self.start(settings)
    }

    pub fn start(&self, settings: TimerSettings) -> Result<(), WorkerError> {
        {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            if running.as_ref().is_some_and(|r| !r.thread.is_finished()) {
                return Err(ProxyError::AlreadyRunning("timer").into());
            }
            if let Some(old) = running.take() {
                let _ = old.thread.join();
            }
            self.pending.store(false, Ordering::Release);
            self.delayed.store(false, Ordering::Relaxed);
            let (signals, rx) = std_mpsc::channel();
            let ticker = Ticker {
                handle: self.handle,
                conduit: self.conduit.clone(),
                pending: self.pending.clone(),
                delayed: self.delayed.clone(),
                settings: settings.clone(),
            };
            let thread = thread::Builder::new()
                .name(format!("{}-timer-{}", self.conduit.worker(), self.handle))
                .spawn(move || ticker.run(rx))
                .map_err(ProxyError::from)?;
            *running = Some(Running {
                signals,
                thread,
                action: settings.action.clone(),
            });
        }
        debug!(handle = %self.handle, interval = ?settings.interval, "timer started");
        self.publish_running(true);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), ProxyError> {
        let run = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProxyError::NotRunning("timer"))?;
        let _ = run.signals.send(Signal::Stop);
        let _ = run.thread.join();
        self.pending.store(false, Ordering::Release);
        debug!(handle = %self.handle, "timer stopped");
        self.publish_running(false);
        Ok(())
    }

    pub fn ack(&self) -> Result<(), ProxyError> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let run = running.as_ref().ok_or(ProxyError::NotRunning("timer"))?;
        let _ = run.signals.send(Signal::Ack);
        Ok(())
    }

    /// Claims the queued tick. Returns the action to run, or `None` when the
    /// timer was stopped after the tick was queued.
    pub fn begin_tick(&self) -> Option<Option<CallableRef>> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        running.as_ref().map(|r| r.action.clone())
    }

    pub fn end_tick(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn shutdown(&self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    fn remote_attr(&self, name: &str) -> Result<WireValue, WorkerError> {
        self.conduit.request(UpwardOp::GetAttr {
            handle: self.handle,
            name: name.to_string(),
        })
    }

    fn publish_running(&self, running: bool) {
        let op = UpwardOp::SetAttr {
            handle: self.handle,
            name: "running".into(),
            value: WireValue::Bool(running),
        };
        if let Err(e) = self.conduit.request(op) {
            debug!(handle = %self.handle, "cannot publish timer state: {e}");
        }
    }
}

struct Ticker {
    handle: HandleId,
    conduit: Arc<Conduit>,
    pending: Arc<AtomicBool>,
    delayed: Arc<AtomicBool>,
    settings: TimerSettings,
}

impl Ticker {
    fn run(self, signals: std_mpsc::Receiver<Signal>) {
        let mut first = true;
        loop {
            if !(first && self.settings.call_at_zero) {
                match wait_until(&signals, Instant::now() + self.settings.interval, false) {
                    Wake::Elapsed => {}
                    Wake::Ack => continue,
                    Wake::Stop => break,
                }
            }
            first = false;
            if self.pending.swap(true, Ordering::AcqRel) {
                self.delayed.store(true, Ordering::Relaxed);
                continue;
            }
            let tick = Dispatch::ProxyCall(ProxyCall::new(self.handle, TICK, vec![]));
            if !self.conduit.enqueue(tick) {
                break;
            }
            if let Some(timeout) = self.settings.retrigger {
                if !self.await_ack(&signals, timeout) {
                    break;
                }
            }
        }
        debug!(handle = %self.handle, "timer thread exiting");
    }

    /// False when told to stop while waiting.
    fn await_ack(&self, signals: &std_mpsc::Receiver<Signal>, timeout: Duration) -> bool {
        match wait_until(signals, Instant::now() + timeout, true) {
            Wake::Ack => true,
            Wake::Stop => false,
            Wake::Elapsed => {
                warn!(handle = %self.handle, ?timeout, "timer action did not acknowledge in time");
                self.delayed.store(true, Ordering::Relaxed);
                loop {
                    match signals.recv() {
                        Ok(Signal::Ack) => return true,
                        Ok(Signal::Stop) | Err(_) => return false,
                    }
                }
            }
        }
    }
}

/// Sleeps until `deadline` unless a signal arrives first. Acks are only
/// reported when `want_ack`; otherwise they are stale and swallowed.
fn wait_until(signals: &std_mpsc::Receiver<Signal>, deadline: Instant, want_ack: bool) -> Wake {
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match signals.recv_timeout(left) {
            Err(RecvTimeoutError::Timeout) => return Wake::Elapsed,
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return Wake::Stop,
            Ok(Signal::Ack) if want_ack => return Wake::Ack,
            Ok(Signal::Ack) => {}
        }
    }
}
