//! Objects that live on the UI thread and can be reached from workers.
//!
//! Everything a worker touches through a handle is an [`ObjectRef`]: widgets,
//! their sub-objects, bound methods, callable shims. The `Rc<RefCell<..>>`
//! makes these `!Send`, so the compiler keeps them on the UI thread.

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use panel_protocol::{CallableRef, HandleId, ProxyCall, ProxyKind, RemoteError, RemoteErrorKind, WorkerId};
use thiserror::Error;

use super::bus::SharedBus;
use super::marshal::MarshalError;
use super::registry::RegistryError;
use super::value::{Kwargs, Value};

pub type ObjectRef = Rc<RefCell<dyn HostObject>>;

pub fn new_object<T: HostObject + 'static>(object: T) -> ObjectRef {
    Rc::new(RefCell::new(object))
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{type_name} has no attribute `{name}`")]
    Attribute { type_name: &'static str, name: String },

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    Value(String),

    #[error("index {index} out of range for length {len}")]
    Index { index: i64, len: usize },

    #[error("no such key `{0}`")]
    Lookup(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),

    #[error("{0}")]
    Runtime(String),
}

impl HostError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            HostError::Attribute { .. } => RemoteErrorKind::Attribute,
            HostError::Type(_) => RemoteErrorKind::Type,
            HostError::Value(_) => RemoteErrorKind::Value,
            HostError::Index { .. } => RemoteErrorKind::Index,
            HostError::Lookup(_) | HostError::Registry(_) => RemoteErrorKind::Lookup,
            HostError::Marshal(_) => RemoteErrorKind::Marshal,
            HostError::Runtime(_) => RemoteErrorKind::Runtime,
        }
    }

    /// The envelope sent back to the worker: kind and rendered message only.
    pub fn to_remote(&self) -> RemoteError {
        RemoteError::new(self.kind(), self.to_string())
    }
}

pub fn no_attr(type_name: &'static str, name: &str) -> HostError {
    HostError::Attribute {
        type_name,
        name: name.to_string(),
    }
}

// -----------------------------------------------------------------------------
// Side effects requested while servicing a call
// -----------------------------------------------------------------------------

/// Work a call wants done after it returns, possibly on another app.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Run a user function in `worker`.
    Invoke { worker: WorkerId, callable: CallableRef },
    /// Run a method of a specialty proxy inside `worker`.
    ProxyCall { worker: WorkerId, call: ProxyCall },
    /// A widget fired `signal`; its actions run on its own worker.
    Emit {
        worker: WorkerId,
        handle: HandleId,
        signal: String,
    },
    /// Fan out to every global action registered under `name`.
    Trigger { name: String },
}

pub struct CallCtx {
    pub worker: WorkerId,
    effects: Vec<Effect>,
}

impl CallCtx {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            effects: Vec::new(),
        }
    }

    pub fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn emit(&mut self, handle: HandleId, signal: &str) {
        self.push(Effect::Emit {
            worker: self.worker,
            handle,
            signal: signal.to_string(),
        });
    }

    pub fn proxy_call(&mut self, call: ProxyCall) {
        self.push(Effect::ProxyCall {
            worker: self.worker,
            call,
        });
    }

    pub fn trigger(&mut self, name: &str) {
        self.push(Effect::Trigger {
            name: name.to_string(),
        });
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }
}

/// What a widget sees when its app is started.
pub struct Registration<'a> {
    pub worker: WorkerId,
    pub id: Option<&'a str>,
    pub handle: HandleId,
    pub modules: &'a mut Vec<String>,
    pub on_init: &'a mut Vec<CallableRef>,
    pub on_close: &'a mut Vec<CallableRef>,
    pub bus: &'a SharedBus,
}

// -----------------------------------------------------------------------------
// The object contract
// -----------------------------------------------------------------------------

/// Behaviour of an object reachable through a handle.
///
/// Only `type_name` is required. Attribute and method names form the open
/// surface seen by user code; the item/len/iter/repr hooks back the special
/// methods (`__getitem__`, `__len__`, ...). The widget hooks at the bottom are
/// the optional part of the widget contract.
pub trait HostObject {
    fn type_name(&self) -> &'static str;

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        Err(no_attr(self.type_name(), name))
    }

    fn set_attr(&mut self, name: &str, _value: Value) -> Result<(), HostError> {
        Err(no_attr(self.type_name(), name))
    }

    /// Readable attribute names, for `dir`.
    fn attributes(&self) -> Vec<String> {
        Vec::new()
    }

    fn methods(&self) -> &'static [&'static str] {
        &[]
    }

    fn has_method(&self, name: &str) -> bool {
        self.methods().contains(&name)
    }

    fn call_method(
        &mut self,
        _ctx: &mut CallCtx,
        name: &str,
        _args: Vec<Value>,
        _kwargs: Kwargs,
    ) -> Result<Value, HostError> {
        Err(no_attr(self.type_name(), name))
    }

    fn is_callable(&self) -> bool {
        false
    }

    fn call(&mut self, _ctx: &mut CallCtx, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, HostError> {
        Err(HostError::Type(format!("{} is not callable", self.type_name())))
    }

    fn get_item(&self, _key: &Value) -> Result<Value, HostError> {
        Err(HostError::Type(format!("{} is not subscriptable", self.type_name())))
    }

    fn set_item(&mut self, _key: Value, _value: Value) -> Result<(), HostError> {
        Err(HostError::Type(format!(
            "{} does not support item assignment",
            self.type_name()
        )))
    }

    fn len(&self) -> Result<usize, HostError> {
        Err(HostError::Type(format!("{} has no length", self.type_name())))
    }

    fn iter(&self) -> Result<Vec<Value>, HostError> {
        Err(HostError::Type(format!("{} is not iterable", self.type_name())))
    }

    fn repr(&self) -> String {
        format!("<{}>", self.type_name())
    }

    fn str(&self) -> String {
        self.repr()
    }

    fn dir(&self) -> Vec<String> {
        let mut names = self.attributes();
        names.extend(self.methods().iter().map(|m| m.to_string()));
        names.sort();
        names.dedup();
        names
    }

    // ── widget contract ─────────────────────────────────────────────

    /// Called once when the app starts, before the worker is spawned.
    fn register(&mut self, _reg: &mut Registration<'_>) {}

    /// A UI-side signal (user input, or a fan-out from another app).
    fn on_signal(&mut self, _ctx: &mut CallCtx, _signal: &str, _args: &[Value]) -> Result<(), HostError> {
        Ok(())
    }

    fn get_param(&self) -> Option<Value> {
        None
    }

    fn set_param(&mut self, _value: Value) -> Result<(), HostError> {
        Err(HostError::Type(format!("{} has no parameter", self.type_name())))
    }

    /// The containing tab became visible.
    fn redraw(&mut self) {}

    /// Which worker-side wrapper this widget wants.
    fn proxy_kind(&self) -> ProxyKind {
        ProxyKind::Generic
    }
}

// -----------------------------------------------------------------------------
// Access helpers
// -----------------------------------------------------------------------------

pub fn borrow(object: &ObjectRef) -> Result<Ref<'_, dyn HostObject>, HostError> {
    object
        .try_borrow()
        .map_err(|_| HostError::Runtime("object is busy in another call".into()))
}

pub fn borrow_mut(object: &ObjectRef) -> Result<RefMut<'_, dyn HostObject + 'static>, HostError> {
    object
        .try_borrow_mut()
        .map_err(|_| HostError::Runtime("object is busy in another call".into()))
}

/// Attribute read. A name that is a method rather than an attribute yields a
/// callable bound method.
pub fn read_attr(object: &ObjectRef, name: &str) -> Result<Value, HostError> {
    let obj = borrow(object)?;
    match obj.get_attr(name) {
        Err(HostError::Attribute { .. }) if obj.has_method(name) => {
            Ok(Value::Object(new_object(BoundMethod::new(object.clone(), name))))
        }
        other => other,
    }
}

/// Method call by name; special names map onto the trait's hooks.
pub fn invoke_method(
    object: &ObjectRef,
    ctx: &mut CallCtx,
    name: &str,
    args: Vec<Value>,
    kwargs: Kwargs,
) -> Result<Value, HostError> {
    match name {
        "__getitem__" => {
            let key = required(&args, &kwargs, 0, "key")?.clone();
            borrow(object)?.get_item(&key)
        }
        "__setitem__" => {
            let key = required(&args, &kwargs, 0, "key")?.clone();
            let value = required(&args, &kwargs, 1, "value")?.clone();
            borrow_mut(object)?.set_item(key, value).map(|_| Value::Null)
        }
        "__len__" => Ok(Value::Int(borrow(object)?.len()? as i64)),
        "__repr__" => Ok(Value::Str(borrow(object)?.repr())),
        "__str__" => Ok(Value::Str(borrow(object)?.str())),
        "__iter__" => Ok(Value::List(borrow(object)?.iter()?)),
        "__dir__" => Ok(Value::List(
            borrow(object)?.dir().into_iter().map(Value::Str).collect(),
        )),
        "__call__" => call_object(object, ctx, args, kwargs),
        _ => {
            let mut obj = borrow_mut(object)?;
            if !obj.has_method(name) {
                return Err(no_attr(obj.type_name(), name));
            }
            obj.call_method(ctx, name, args, kwargs)
        }
    }
}

pub fn call_object(object: &ObjectRef, ctx: &mut CallCtx, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
    let mut obj = borrow_mut(object)?;
    if !obj.is_callable() {
        return Err(HostError::Type(format!("{} is not callable", obj.type_name())));
    }
    obj.call(ctx, args, kwargs)
}

/// Positional-or-keyword argument lookup.
pub fn arg<'a>(args: &'a [Value], kwargs: &'a Kwargs, index: usize, name: &str) -> Option<&'a Value> {
    kwargs.get(name).or_else(|| args.get(index))
}

pub fn required<'a>(args: &'a [Value], kwargs: &'a Kwargs, index: usize, name: &str) -> Result<&'a Value, HostError> {
    arg(args, kwargs, index, name).ok_or_else(|| HostError::Type(format!("missing argument `{name}`")))
}

pub fn required_f64(args: &[Value], kwargs: &Kwargs, index: usize, name: &str) -> Result<f64, HostError> {
    let value = required(args, kwargs, index, name)?;
    value
        .as_f64()
        .ok_or_else(|| HostError::Type(format!("`{name}` must be a number, got {}", value.type_name())))
}

// -----------------------------------------------------------------------------
// Built-in objects
// -----------------------------------------------------------------------------

/// `widget.method` read as an attribute.
pub struct BoundMethod {
    target: ObjectRef,
    name: String,
}

impl BoundMethod {
    pub fn new(target: ObjectRef, name: &str) -> Self {
        Self {
            target,
            name: name.to_string(),
        }
    }
}

impl HostObject for BoundMethod {
    fn type_name(&self) -> &'static str {
        "bound_method"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "name" => Ok(Value::Str(self.name.clone())),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&mut self, ctx: &mut CallCtx, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
        invoke_method(&self.target, ctx, &self.name, args, kwargs)
    }

    fn repr(&self) -> String {
        let owner = self
            .target
            .try_borrow()
            .map(|t| t.type_name())
            .unwrap_or("object");
        format!("<bound method {owner}.{}>", self.name)
    }
}

/// Stand-in for a user function received from a worker. Calling it on the UI
/// side schedules the function to run in that worker.
pub struct CallableShim {
    worker: WorkerId,
    callable: CallableRef,
}

impl CallableShim {
    pub fn new(worker: WorkerId, callable: CallableRef) -> Self {
        Self { worker, callable }
    }

    pub fn callable(&self) -> &CallableRef {
        &self.callable
    }
}

impl HostObject for CallableShim {
    fn type_name(&self) -> &'static str {
        "callable"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "module" => Ok(Value::Str(self.callable.module.clone())),
            "function" => Ok(Value::Str(self.callable.function.clone())),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        vec!["module".into(), "function".into()]
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&mut self, ctx: &mut CallCtx, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, HostError> {
        ctx.push(Effect::Invoke {
            worker: self.worker,
            callable: self.callable.clone(),
        });
        Ok(Value::Null)
    }

    fn repr(&self) -> String {
        format!("<callable {} in {}>", self.callable, self.worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        n: i64,
    }

    impl HostObject for Counter {
        fn type_name(&self) -> &'static str {
            "counter"
        }

        fn get_attr(&self, name: &str) -> Result<Value, HostError> {
            match name {
                "n" => Ok(Value::Int(self.n)),
                _ => Err(no_attr(self.type_name(), name)),
            }
        }

        fn methods(&self) -> &'static [&'static str] {
            &["bump"]
        }

        fn call_method(&mut self, _ctx: &mut CallCtx, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
            match name {
                "bump" => {
                    let by = arg(&args, &kwargs, 0, "by").and_then(Value::as_i64).unwrap_or(1);
                    self.n += by;
                    Ok(Value::Int(self.n))
                }
                _ => Err(no_attr(self.type_name(), name)),
            }
        }
    }

    #[test]
    fn method_read_as_attribute_is_callable() {
        let obj = new_object(Counter { n: 0 });
        let bound = read_attr(&obj, "bump").unwrap();
        let bound = bound.as_object().unwrap().clone();
        assert!(borrow(&bound).unwrap().is_callable());

        let mut ctx = CallCtx::new(WorkerId(1));
        let r = call_object(&bound, &mut ctx, vec![Value::Int(5)], Kwargs::new()).unwrap();
        assert_eq!(r, Value::Int(5));
        assert_eq!(read_attr(&obj, "n").unwrap(), Value::Int(5));
    }

    #[test]
    fn unknown_attribute_is_an_attribute_error() {
        let obj = new_object(Counter { n: 0 });
        let err = read_attr(&obj, "nope").unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Attribute);
        assert_eq!(err.to_remote().message, "counter has no attribute `nope`");
    }

    #[test]
    fn special_methods_fall_back_to_type_errors() {
        let obj = new_object(Counter { n: 0 });
        let mut ctx = CallCtx::new(WorkerId(1));
        let err = invoke_method(&obj, &mut ctx, "__len__", vec![], Kwargs::new()).unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Type);
        let dir = invoke_method(&obj, &mut ctx, "__dir__", vec![], Kwargs::new()).unwrap();
        assert_eq!(dir, Value::List(vec![Value::str("bump")]));
    }

    #[test]
    fn shim_call_schedules_the_worker() {
        let shim = new_object(CallableShim::new(WorkerId(4), CallableRef::new("m", "f")));
        let mut ctx = CallCtx::new(WorkerId(1));
        call_object(&shim, &mut ctx, vec![], Kwargs::new()).unwrap();
        assert_eq!(
            ctx.take_effects(),
            vec![Effect::Invoke {
                worker: WorkerId(4),
                callable: CallableRef::new("m", "f")
            }]
        );
    }

    #[test]
    fn busy_object_is_reported_not_panicking() {
        let obj = new_object(Counter { n: 0 });
        let _held = obj.borrow_mut();
        assert!(matches!(read_attr(&obj, "n"), Err(HostError::Runtime(_))));
    }
}
