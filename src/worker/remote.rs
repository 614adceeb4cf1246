//! Remote handles: what user code holds in place of a widget.
//!
//! Attribute reads, writes and method calls become upward requests. Names
//! starting with an underscore never leave the worker. Reads that come back
//! marked cacheable (bound methods, callables) are memoized per wrapper.
//! Dropping the last clone of a wrapper releases its reference on the
//! supervisor.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use panel_protocol::{HandleId, HandleRef, UpwardOp, WireValue};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position};

use super::WorkerError;
use super::marshal::{Bridge, Pinned};
use super::proxies::Special;

struct HandleInner {
    handle: HandleRef,
    bridge: Arc<Bridge>,
    cache: Mutex<HashMap<String, Dynamic>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // the cache may hold wrappers of its own; let them go first
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.bridge.conduit().release_handle(self.handle.id);
    }
}

#[derive(Clone)]
pub struct RemoteHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteHandle({})", self.inner.handle.id)
    }
}

impl RemoteHandle {
    /// Wraps a handle that arrived from the supervisor. The wrapper owns the
    /// reference the supervisor counted when it sent the handle.
    pub fn adopt(bridge: &Arc<Bridge>, handle: HandleRef) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                handle,
                bridge: Arc::clone(bridge),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn handle_id(&self) -> HandleId {
        self.inner.handle.id
    }

    pub fn is_cacheable(&self) -> bool {
        self.inner.handle.cacheable
    }

    fn bridge(&self) -> &Arc<Bridge> {
        &self.inner.bridge
    }

    fn special(&self) -> Option<Special> {
        self.bridge().special(self.handle_id())
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Dynamic>> {
        self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_attr(&self, name: &str) -> Result<Dynamic, WorkerError> {
        if name.starts_with('_') {
            return Err(WorkerError::Private(name.to_string()));
        }
        if let Some(value) = self.special().and_then(|s| s.property(name)) {
            return Ok(value);
        }
        if let Some(value) = self.cache().get(name) {
            return Ok(value.clone());
        }
        let wire = self.bridge().request(UpwardOp::GetAttr {
            handle: self.handle_id(),
            name: name.to_string(),
        })?;
        let cacheable = matches!(&wire, WireValue::Handle(h) if h.cacheable);
        let value = self.bridge().from_wire(wire);
        if cacheable {
            self.cache().insert(name.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Fire-and-forget; still takes a permit, so a later read sees the write.
    pub fn set_attr(&self, name: &str, value: Dynamic) -> Result<(), WorkerError> {
        if name.starts_with('_') {
            return Err(WorkerError::Private(name.to_string()));
        }
        let mut pinned = Pinned::new();
        let value = self.bridge().to_wire(value, &mut pinned)?;
        self.cache().remove(name);
        self.bridge().request(UpwardOp::SetAttr {
            handle: self.handle_id(),
            name: name.to_string(),
            value,
        })?;
        drop(pinned);
        Ok(())
    }

    pub fn call_method(&self, method: &str, args: Vec<Dynamic>, kwargs: Map) -> Result<Dynamic, WorkerError> {
        if let Some(result) = self.special().and_then(|s| s.call(self.bridge(), method, &args)) {
            return result;
        }
        let bridge = self.bridge();
        let mut pinned = Pinned::new();
        let wire = bridge.request(UpwardOp::CallMethod {
            handle: self.handle_id(),
            method: method.to_string(),
            args: bridge.args_to_wire(args, &mut pinned)?,
            kwargs: bridge.kwargs_to_wire(kwargs, &mut pinned)?,
        })?;
        drop(pinned);
        Ok(bridge.from_wire(wire))
    }

    /// Calls a method without waiting for (or receiving) its result.
    pub fn notify(&self, method: &str, args: Vec<Dynamic>, kwargs: Map) -> Result<(), WorkerError> {
        let bridge = self.bridge();
        let mut pinned = Pinned::new();
        bridge.request(UpwardOp::CallMethodNoReturn {
            handle: self.handle_id(),
            method: method.to_string(),
            args: bridge.args_to_wire(args, &mut pinned)?,
            kwargs: bridge.kwargs_to_wire(kwargs, &mut pinned)?,
        })?;
        drop(pinned);
        Ok(())
    }

    /// Calls the object itself.
    pub fn invoke(&self, args: Vec<Dynamic>, kwargs: Map) -> Result<Dynamic, WorkerError> {
        let bridge = self.bridge();
        let mut pinned = Pinned::new();
        let wire = bridge.request(UpwardOp::CallHandle {
            handle: self.handle_id(),
            args: bridge.args_to_wire(args, &mut pinned)?,
            kwargs: bridge.kwargs_to_wire(kwargs, &mut pinned)?,
        })?;
        drop(pinned);
        Ok(bridge.from_wire(wire))
    }

    pub fn get_item(&self, index: Dynamic) -> Result<Dynamic, WorkerError> {
        self.call_method("__getitem__", vec![index], Map::new())
    }

    pub fn set_item(&self, index: Dynamic, value: Dynamic) -> Result<(), WorkerError> {
        self.call_method("__setitem__", vec![index, value], Map::new())
            .map(|_| ())
    }

    pub fn len(&self) -> Result<i64, WorkerError> {
        let n = self.call_method("__len__", vec![], Map::new())?;
        n.as_int()
            .map_err(|t| WorkerError::Script(format!("__len__ returned {t}")))
    }

    pub fn items(&self) -> Result<Array, WorkerError> {
        let items = self.call_method("__iter__", vec![], Map::new())?;
        let type_name = items.type_name();
        items
            .try_cast::<Array>()
            .ok_or_else(|| WorkerError::Script(format!("__iter__ returned {type_name}")))
    }

    pub fn dir(&self) -> Result<Dynamic, WorkerError> {
        self.call_method("__dir__", vec![], Map::new())
    }

    pub fn str(&self) -> Result<String, WorkerError> {
        Ok(self.call_method("__str__", vec![], Map::new())?.to_string())
    }

    pub fn repr(&self) -> Result<String, WorkerError> {
        Ok(self.call_method("__repr__", vec![], Map::new())?.to_string())
    }

    pub fn drop_cache(&self) {
        self.cache().clear();
    }
}

/// Error raised into user code. Remote errors keep the supervisor's message.
pub fn script_error(e: impl fmt::Display) -> Box<EvalAltResult> {
    EvalAltResult::ErrorRuntime(Dynamic::from(e.to_string()), Position::NONE).into()
}

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

fn call(h: &RemoteHandle, method: &str, args: Vec<Dynamic>) -> ScriptResult<Dynamic> {
    h.call_method(method, args, Map::new()).map_err(script_error)
}

fn notify(h: &RemoteHandle, method: &str, args: Vec<Dynamic>) -> ScriptResult<()> {
    h.notify(method, args, Map::new()).map_err(script_error)
}

fn invoke(h: &RemoteHandle, args: Vec<Dynamic>) -> ScriptResult<Dynamic> {
    h.invoke(args, Map::new()).map_err(script_error)
}

/// Teaches `engine` the remote handle surface.
pub fn register_handle_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<RemoteHandle>("Handle")
        // attribute access; `h.name` falls back to these as well
        .register_indexer_get(|h: &mut RemoteHandle, name: ImmutableString| -> ScriptResult<Dynamic> {
            h.get_attr(&name).map_err(script_error)
        })
        .register_indexer_set(
            |h: &mut RemoteHandle, name: ImmutableString, value: Dynamic| -> ScriptResult<()> {
                h.set_attr(&name, value).map_err(script_error)
            },
        )
        // item access
        .register_indexer_get(|h: &mut RemoteHandle, index: i64| -> ScriptResult<Dynamic> {
            h.get_item(Dynamic::from_int(index)).map_err(script_error)
        })
        .register_indexer_set(|h: &mut RemoteHandle, index: i64, value: Dynamic| -> ScriptResult<()> {
            h.set_item(Dynamic::from_int(index), value).map_err(script_error)
        })
        .register_get("handle_id", |h: &mut RemoteHandle| h.handle_id().0 as i64)
        .register_fn("len", |h: &mut RemoteHandle| h.len().map_err(script_error))
        .register_fn("items", |h: &mut RemoteHandle| h.items().map_err(script_error))
        .register_fn("dir", |h: &mut RemoteHandle| h.dir().map_err(script_error))
        .register_fn("to_string", |h: &mut RemoteHandle| h.str().map_err(script_error))
        .register_fn("to_debug", |h: &mut RemoteHandle| h.repr().map_err(script_error))
        .register_fn("drop_cache", |h: &mut RemoteHandle| h.drop_cache())
        .register_fn("call_with", |h: &mut RemoteHandle, method: &str, args: Array, kwargs: Map| {
            h.call_method(method, args, kwargs).map_err(script_error)
        });

    engine
        .register_fn("call", |h: &mut RemoteHandle, m: &str| call(h, m, vec![]))
        .register_fn("call", |h: &mut RemoteHandle, m: &str, a: Dynamic| call(h, m, vec![a]))
        .register_fn("call", |h: &mut RemoteHandle, m: &str, a: Dynamic, b: Dynamic| {
            call(h, m, vec![a, b])
        })
        .register_fn("call", |h: &mut RemoteHandle, m: &str, a: Dynamic, b: Dynamic, c: Dynamic| {
            call(h, m, vec![a, b, c])
        })
        .register_fn(
            "call",
            |h: &mut RemoteHandle, m: &str, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                call(h, m, vec![a, b, c, d])
            },
        );

    engine
        .register_fn("notify", |h: &mut RemoteHandle, m: &str| notify(h, m, vec![]))
        .register_fn("notify", |h: &mut RemoteHandle, m: &str, a: Dynamic| notify(h, m, vec![a]))
        .register_fn("notify", |h: &mut RemoteHandle, m: &str, a: Dynamic, b: Dynamic| {
            notify(h, m, vec![a, b])
        })
        .register_fn("notify", |h: &mut RemoteHandle, m: &str, a: Dynamic, b: Dynamic, c: Dynamic| {
            notify(h, m, vec![a, b, c])
        });

    engine
        .register_fn("invoke", |h: &mut RemoteHandle| invoke(h, vec![]))
        .register_fn("invoke", |h: &mut RemoteHandle, a: Dynamic| invoke(h, vec![a]))
        .register_fn("invoke", |h: &mut RemoteHandle, a: Dynamic, b: Dynamic| invoke(h, vec![a, b]))
        .register_fn("invoke", |h: &mut RemoteHandle, a: Dynamic, b: Dynamic, c: Dynamic| {
            invoke(h, vec![a, b, c])
        });

    // worker-side proxies answer these locally; on a plain handle they are
    // ordinary method calls
    engine
        .register_fn("start", |h: &mut RemoteHandle| call(h, "start", vec![]))
        .register_fn("start", |h: &mut RemoteHandle, a: Dynamic| call(h, "start", vec![a]))
        .register_fn("start", |h: &mut RemoteHandle, a: Dynamic, b: Dynamic| call(h, "start", vec![a, b]))
        .register_fn("stop", |h: &mut RemoteHandle| call(h, "stop", vec![]))
        .register_fn("kill", |h: &mut RemoteHandle| call(h, "kill", vec![]))
        .register_fn("resume", |h: &mut RemoteHandle| call(h, "resume", vec![]))
        .register_fn("ack", |h: &mut RemoteHandle| call(h, "ack", vec![]))
        .register_fn(
            "display",
            |h: &mut RemoteHandle, pixels: Dynamic, width: i64, height: i64, mode: &str| {
                call(
                    h,
                    "display",
                    vec![pixels, Dynamic::from_int(width), Dynamic::from_int(height), Dynamic::from(mode.to_string())],
                )
            },
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::conduit::Conduit;
    use crate::worker::{FrameSink, WorkerProbe, WorkerStats};
    use panel_protocol::{Reply, ReplyOutcome, ToSupervisor, ToWorker, Upward, WorkerId};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// Plays a tiny supervisor: one text widget (handle 1) with a `value`
    /// attribute, and a method `fmt` that reads back as a cacheable handle.
    struct Fake {
        down: mpsc::UnboundedSender<ToWorker>,
        value: StdMutex<WireValue>,
        log: Arc<StdMutex<Vec<String>>>,
    }

    impl FrameSink for Fake {
        fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
            let ToSupervisor::Request(Upward { seq, op }) = frame else {
                return Ok(());
            };
            self.log.lock().unwrap().push(op.name().to_string());
            let outcome = match op {
                UpwardOp::SetAttr { value, .. } => {
                    *self.value.lock().unwrap() = value;
                    None
                }
                UpwardOp::GetAttr { name, .. } if name == "value" => {
                    Some(ReplyOutcome::Value(self.value.lock().unwrap().clone()))
                }
                UpwardOp::GetAttr { name, .. } if name == "fmt" => {
                    Some(ReplyOutcome::Value(WireValue::Handle(HandleRef::cacheable(HandleId(50)))))
                }
                UpwardOp::GetAttr { name, .. } => Some(ReplyOutcome::Error(panel_protocol::RemoteError::new(
                    panel_protocol::RemoteErrorKind::Attribute,
                    format!("text has no attribute `{name}`"),
                ))),
                UpwardOp::CallMethod { method, .. } if method == "__len__" => {
                    Some(ReplyOutcome::Value(WireValue::Int(7)))
                }
                _ => None,
            };
            if let Some(outcome) = outcome {
                let _ = self.down.send(ToWorker::Reply(Reply { seq, outcome }));
            }
            let _ = self.down.send(ToWorker::Permit);
            Ok(())
        }
    }

    fn setup() -> (Arc<Bridge>, Arc<StdMutex<Vec<String>>>, WorkerProbe) {
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let fake = Fake {
            down: down_tx,
            value: StdMutex::new(WireValue::Null),
            log: log.clone(),
        };
        let probe = WorkerProbe::new(2);
        let (conduit, _local) = Conduit::new(WorkerId(1), Box::new(fake), &probe);
        conduit.spawn_demux(Box::new(down_rx)).unwrap();
        (Bridge::new(conduit), log, probe)
    }

    fn engine_with(h: RemoteHandle) -> (Engine, rhai::Scope<'static>) {
        let mut engine = Engine::new();
        register_handle_api(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push("t", h);
        (engine, scope)
    }

    #[test]
    fn property_syntax_goes_through_the_transport() {
        let (bridge, log, _probe) = setup();
        let (engine, mut scope) = engine_with(RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1))));
        let got: String = engine
            .eval_with_scope(&mut scope, r#"t.value = "hi"; t.value"#)
            .unwrap();
        assert_eq!(got, "hi");
        assert_eq!(*log.lock().unwrap(), vec!["set_attr", "get_attr"]);
    }

    #[test]
    fn remote_errors_raise_with_the_original_message() {
        let (bridge, _log, _probe) = setup();
        let (engine, mut scope) = engine_with(RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1))));
        let caught: String = engine
            .eval_with_scope(
                &mut scope,
                r#"let caught = "no"; try { t.nonexistent_attr; } catch (e) { caught = e; } caught"#,
            )
            .unwrap();
        assert!(caught.contains("nonexistent_attr"), "{caught}");
        assert!(caught.starts_with("attribute error"), "{caught}");
    }

    #[test]
    fn private_names_stay_local() {
        let (bridge, log, _probe) = setup();
        let h = RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1)));
        assert!(matches!(h.get_attr("_secret"), Err(WorkerError::Private(_))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn cacheable_reads_are_memoized() {
        let (bridge, log, _probe) = setup();
        let h = RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1)));
        h.get_attr("fmt").unwrap();
        h.get_attr("fmt").unwrap();
        assert_eq!(log.lock().unwrap().iter().filter(|op| *op == "get_attr").count(), 1);
        h.drop_cache();
        h.get_attr("fmt").unwrap();
        assert_eq!(log.lock().unwrap().iter().filter(|op| *op == "get_attr").count(), 2);
    }

    #[test]
    fn dropping_the_last_clone_releases_once() {
        let (bridge, log, probe) = setup();
        let h = RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1)));
        let copies: Vec<_> = (0..5).map(|_| h.clone()).collect();
        drop(copies);
        assert!(log.lock().unwrap().is_empty());
        drop(h);
        assert_eq!(*log.lock().unwrap(), vec!["delete_handle"]);
        assert_eq!(WorkerStats::get(&probe.stats.deletes), 1);
    }

    #[test]
    fn a_temporary_handle_is_released_after_the_write_that_names_it() {
        let (bridge, log, _probe) = setup();
        let h = RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1)));
        let temporary = RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(77)));
        h.set_attr("value", Dynamic::from(temporary)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["set_attr", "delete_handle"]);
    }

    #[test]
    fn handles_in_arguments_outlive_the_call() {
        let (bridge, log, _probe) = setup();
        let (engine, mut scope) = engine_with(RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1))));
        scope.push("axes", RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(77))));
        engine
            .run_with_scope(&mut scope, "t.notify(\"attach\", axes); axes = ();")
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["call_method_no_return", "delete_handle"]);
    }

    #[test]
    fn len_is_a_dunder_call() {
        let (bridge, _log, _probe) = setup();
        let (engine, mut scope) = engine_with(RemoteHandle::adopt(&bridge, HandleRef::new(HandleId(1))));
        let n: i64 = engine.eval_with_scope(&mut scope, "len(t)").unwrap();
        assert_eq!(n, 7);
    }
}
