//! Worker end of the transport.
//!
//! Any worker thread may issue requests. Each takes a flow-control permit,
//! is tagged with a sequence number and, if it expects a reply, parks on a
//! private rendezvous keyed by that number. A demux thread owns the downward
//! stream: replies wake their caller, permits refill the semaphore and
//! dispatches go to the main loop's queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use panel_protocol::{
    Dispatch, FlowControl, HandleId, ReplyOutcome, ToSupervisor, ToWorker, Upward, UpwardOp, WireValue, WorkerId,
    WorkerPhase,
};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::{FrameSink, FrameSource, WorkerError, WorkerProbe, WorkerStats};

pub struct Conduit {
    worker: WorkerId,
    sink: Box<dyn FrameSink>,
    flow: Arc<FlowControl>,
    stats: Arc<WorkerStats>,
    seq: AtomicU64,
    inflight: DashMap<u64, std_mpsc::SyncSender<ReplyOutcome>>,
    local: mpsc::UnboundedSender<Dispatch>,
}

impl Conduit {
    /// Returns the conduit and the receiving end of the main loop's queue.
    pub fn new(
        worker: WorkerId,
        sink: Box<dyn FrameSink>,
        probe: &WorkerProbe,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Dispatch>) {
        let (local, rx) = mpsc::unbounded_channel();
        let conduit = Arc::new(Self {
            worker,
            sink,
            flow: probe.flow.clone(),
            stats: probe.stats.clone(),
            seq: AtomicU64::new(0),
            inflight: DashMap::new(),
            local,
        });
        (conduit, rx)
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn flow(&self) -> &FlowControl {
        &self.flow
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Sends one upward request. Blocks for a permit, and for the reply when
    /// the op has one; other ops return `Null` as soon as they are queued.
    pub fn request(&self, op: UpwardOp) -> Result<WireValue, WorkerError> {
        let expects_reply = op.expects_reply();
        self.flow.acquire().map_err(|_| WorkerError::Disconnected)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = expects_reply.then(|| {
            let (tx, rx) = std_mpsc::sync_channel(1);
            self.inflight.insert(seq, tx);
            rx
        });
        WorkerStats::bump(&self.stats.requests);
        trace!(worker = %self.worker, seq, op = op.name(), "request");
        if let Err(e) = self.sink.send(ToSupervisor::Request(Upward { seq, op })) {
            // nothing will answer or hand the permit back
            self.inflight.remove(&seq);
            self.flow.release();
            return Err(e);
        }
        let Some(reply) = reply else {
            return Ok(WireValue::Null);
        };
        match reply.recv() {
            Ok(ReplyOutcome::Value(value)) => Ok(value),
            Ok(ReplyOutcome::Error(e)) => {
                WorkerStats::bump(&self.stats.remote_errors);
                Err(WorkerError::Remote(e))
            }
            Err(_) => Err(WorkerError::Disconnected),
        }
    }

    /// Drops one reference to `handle` on the supervisor. Never fails: the
    /// supervisor may already be gone.
    pub fn release_handle(&self, handle: HandleId) {
        if self.flow.is_closed() {
            return;
        }
        WorkerStats::bump(&self.stats.deletes);
        if let Err(e) = self.request(UpwardOp::DeleteHandle { handle }) {
            debug!(worker = %self.worker, %handle, "handle release lost: {e}");
        }
    }

    pub fn report_phase(&self, phase: WorkerPhase) {
        if let Err(e) = self.sink.send(ToSupervisor::Phase(phase)) {
            debug!(worker = %self.worker, %phase, "phase report lost: {e}");
        }
    }

    pub fn report(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
        self.sink.send(frame)
    }

    /// Queues work for the main loop. False once the loop has exited.
    pub fn enqueue(&self, dispatch: Dispatch) -> bool {
        self.local.send(dispatch).is_ok()
    }

    /// Fails every parked request and refuses new ones.
    pub fn close(&self) {
        self.flow.close();
        self.inflight.clear();
    }

    /// Starts the thread that owns the downward stream. On end of stream it
    /// closes the conduit and asks the main loop to stop.
    pub fn spawn_demux(self: &Arc<Self>, mut source: Box<dyn FrameSource>) -> Result<JoinHandle<()>, WorkerError> {
        let conduit = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-demux", self.worker))
            .spawn(move || {
                loop {
                    match source.recv() {
                        Ok(Some(frame)) => conduit.deliver(frame),
                        Ok(None) => {
                            debug!(worker = %conduit.worker, "downward stream ended");
                            break;
                        }
                        Err(e) => {
                            error!(worker = %conduit.worker, "downward stream failed: {e}");
                            break;
                        }
                    }
                }
                conduit.close();
                conduit.enqueue(Dispatch::Stop);
            })?;
        Ok(handle)
    }

    fn deliver(&self, frame: ToWorker) {
        match frame {
            ToWorker::Reply(reply) => match self.inflight.remove(&reply.seq) {
                Some((_, tx)) => {
                    WorkerStats::bump(&self.stats.replies);
                    let _ = tx.send(reply.outcome);
                }
                None => warn!(worker = %self.worker, seq = reply.seq, "reply for no pending request"),
            },
            ToWorker::Permit => self.flow.release(),
            ToWorker::Dispatch(dispatch) => {
                WorkerStats::bump(&self.stats.dispatched);
                if !self.enqueue(dispatch) {
                    debug!(worker = %self.worker, "main loop gone, dispatch dropped");
                }
            }
            ToWorker::Init(_) => warn!(worker = %self.worker, "second init frame ignored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panel_protocol::{Reply, RemoteError, RemoteErrorKind};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers every request on its own: getattr with the attribute name,
    /// everything else with a permit only.
    struct EchoSink {
        down: mpsc::UnboundedSender<ToWorker>,
        seen: Mutex<Vec<&'static str>>,
    }

    impl FrameSink for EchoSink {
        fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
            if let ToSupervisor::Request(Upward { seq, op }) = frame {
                self.seen.lock().unwrap().push(op.name());
                let outcome = match &op {
                    UpwardOp::GetAttr { name, .. } if name == "boom" => {
                        Some(ReplyOutcome::Error(RemoteError::new(RemoteErrorKind::Attribute, "boom")))
                    }
                    UpwardOp::GetAttr { name, .. } => Some(ReplyOutcome::Value(WireValue::Str(name.clone()))),
                    _ => None,
                };
                if let Some(outcome) = outcome {
                    let _ = self.down.send(ToWorker::Reply(Reply { seq, outcome }));
                }
                let _ = self.down.send(ToWorker::Permit);
            }
            Ok(())
        }
    }

    fn echo(permits: usize) -> (Arc<Conduit>, mpsc::UnboundedReceiver<Dispatch>, WorkerProbe) {
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let probe = WorkerProbe::new(permits);
        let sink = EchoSink {
            down: down_tx,
            seen: Mutex::new(Vec::new()),
        };
        let (conduit, local) = Conduit::new(WorkerId(1), Box::new(sink), &probe);
        conduit.spawn_demux(Box::new(down_rx)).unwrap();
        (conduit, local, probe)
    }

    #[test]
    fn replies_reach_their_callers() {
        let (conduit, _local, probe) = echo(2);
        let value = conduit
            .request(UpwardOp::GetAttr {
                handle: HandleId(1),
                name: "value".into(),
            })
            .unwrap();
        assert_eq!(value, WireValue::from("value"));
        // the permit frame follows the reply
        for _ in 0..100 {
            if probe.flow.available() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(probe.flow.available(), 2);
    }

    #[test]
    fn remote_errors_surface() {
        let (conduit, _local, probe) = echo(2);
        let err = conduit
            .request(UpwardOp::GetAttr {
                handle: HandleId(1),
                name: "boom".into(),
            })
            .unwrap_err();
        assert!(matches!(err, WorkerError::Remote(ref e) if e.kind == RemoteErrorKind::Attribute));
        assert_eq!(WorkerStats::get(&probe.stats.remote_errors), 1);
    }

    #[test]
    fn concurrent_callers_get_their_own_replies() {
        let (conduit, _local, probe) = echo(2);
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let conduit = conduit.clone();
                thread::spawn(move || {
                    for j in 0..50 {
                        let name = format!("t{i}-{j}");
                        let got = conduit
                            .request(UpwardOp::GetAttr {
                                handle: HandleId(1),
                                name: name.clone(),
                            })
                            .unwrap();
                        assert_eq!(got, WireValue::Str(name));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(probe.flow.peak_in_flight() <= 2);
    }

    struct NullSink;

    impl FrameSink for NullSink {
        fn send(&self, _frame: ToSupervisor) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl FrameSink for BrokenSink {
        fn send(&self, _frame: ToSupervisor) -> Result<(), WorkerError> {
            Err(WorkerError::Disconnected)
        }
    }

    #[test]
    fn failed_send_gives_the_permit_back() {
        let probe = WorkerProbe::new(1);
        let (conduit, _local) = Conduit::new(WorkerId(4), Box::new(BrokenSink), &probe);
        for _ in 0..3 {
            let err = conduit
                .request(UpwardOp::GetAttr {
                    handle: HandleId(1),
                    name: "value".into(),
                })
                .unwrap_err();
            assert!(matches!(err, WorkerError::Disconnected));
        }
        assert_eq!(probe.flow.available(), 1);
        assert!(conduit.inflight.is_empty());
    }

    #[test]
    fn end_of_stream_stops_the_main_loop() {
        let (down_tx, down_rx) = mpsc::unbounded_channel::<ToWorker>();
        let probe = WorkerProbe::new(2);
        let (conduit, mut local) = Conduit::new(WorkerId(3), Box::new(NullSink), &probe);
        let demux = conduit.spawn_demux(Box::new(down_rx)).unwrap();
        let invoke = Dispatch::Invoke(panel_protocol::CallableRef::new("m", "f"));
        down_tx.send(ToWorker::Dispatch(invoke.clone())).unwrap();
        drop(down_tx);
        demux.join().unwrap();

        assert_eq!(local.blocking_recv(), Some(invoke));
        assert_eq!(local.blocking_recv(), Some(Dispatch::Stop));
        assert!(probe.flow.is_closed());
        assert!(matches!(
            conduit.request(UpwardOp::DeleteHandle { handle: HandleId(1) }),
            Err(WorkerError::Disconnected)
        ));
    }
}
