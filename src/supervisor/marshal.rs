//! Rewriting between UI-side values and wire values.
//!
//! Only leaves change; list, tuple and dict shapes are kept. Dict keys are
//! plain strings and are never rewritten.

use panel_protocol::{HandleId, WireValue, WorkerId};
use thiserror::Error;

use super::object::{CallableShim, new_object};
use super::registry::HandleRegistry;
use super::value::{Kwargs, Value};

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unknown handle {0} in argument")]
    UnknownHandle(HandleId),
}

/// Outbound: every object becomes a freshly allocated handle copy. Callable
/// objects carry the cacheable hint.
pub fn objects_to_handles(value: Value, registry: &mut HandleRegistry) -> WireValue {
    match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(b),
        Value::Int(i) => WireValue::Int(i),
        Value::Float(f) => WireValue::Float(f),
        Value::Str(s) => WireValue::Str(s),
        Value::Bytes(b) => WireValue::Bytes(b),
        Value::Array(a) => WireValue::Array(a),
        Value::List(items) => WireValue::List(
            items
                .into_iter()
                .map(|v| objects_to_handles(v, registry))
                .collect(),
        ),
        Value::Tuple(items) => WireValue::Tuple(
            items
                .into_iter()
                .map(|v| objects_to_handles(v, registry))
                .collect(),
        ),
        Value::Dict(map) => WireValue::Dict(
            map.into_iter()
                .map(|(k, v)| (k, objects_to_handles(v, registry)))
                .collect(),
        ),
        Value::Object(object) => {
            let callable = object.try_borrow().map(|o| o.is_callable()).unwrap_or(false);
            WireValue::Handle(registry.allocate(&object, callable))
        }
    }
}

/// Inbound: handles resolve to their objects, callable references become
/// shims that schedule the function back on `worker`.
pub fn handles_to_objects(value: WireValue, registry: &HandleRegistry, worker: WorkerId) -> Result<Value, MarshalError> {
    Ok(match value {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(i) => Value::Int(i),
        WireValue::Float(f) => Value::Float(f),
        WireValue::Str(s) => Value::Str(s),
        WireValue::Bytes(b) => Value::Bytes(b),
        WireValue::Array(a) => Value::Array(a),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|v| handles_to_objects(v, registry, worker))
                .collect::<Result<_, _>>()?,
        ),
        WireValue::Tuple(items) => Value::Tuple(
            items
                .into_iter()
                .map(|v| handles_to_objects(v, registry, worker))
                .collect::<Result<_, _>>()?,
        ),
        WireValue::Dict(map) => Value::Dict(
            map.into_iter()
                .map(|(k, v)| handles_to_objects(v, registry, worker).map(|v| (k, v)))
                .collect::<Result<_, _>>()?,
        ),
        WireValue::Handle(h) => Value::Object(
            registry
                .resolve(h.id)
                .map_err(|_| MarshalError::UnknownHandle(h.id))?,
        ),
        WireValue::Callable(c) => Value::Object(new_object(CallableShim::new(worker, c))),
    })
}

pub fn args_to_objects(args: Vec<WireValue>, registry: &HandleRegistry, worker: WorkerId) -> Result<Vec<Value>, MarshalError> {
    args.into_iter()
        .map(|v| handles_to_objects(v, registry, worker))
        .collect()
}

pub fn kwargs_to_objects(
    kwargs: std::collections::BTreeMap<String, WireValue>,
    registry: &HandleRegistry,
    worker: WorkerId,
) -> Result<Kwargs, MarshalError> {
    kwargs
        .into_iter()
        .map(|(k, v)| handles_to_objects(v, registry, worker).map(|v| (k, v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::object::{CallCtx, Effect, HostObject, call_object};
    use panel_protocol::{CallableRef, HandleRef, NdArray};
    use std::collections::BTreeMap;
    use std::rc::Rc;

    struct Thing;

    impl HostObject for Thing {
        fn type_name(&self) -> &'static str {
            "thing"
        }
    }

    struct Func;

    impl HostObject for Func {
        fn type_name(&self) -> &'static str {
            "func"
        }

        fn is_callable(&self) -> bool {
            true
        }
    }

    #[test]
    fn plain_values_pass_through() {
        let mut reg = HandleRegistry::new();
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), Value::Array(NdArray::vector(vec![1.0, 2.0])));
        let v = Value::List(vec![Value::Int(1), Value::str("s"), Value::Dict(dict)]);
        let wire = objects_to_handles(v.clone(), &mut reg);
        assert!(wire.is_plain());
        assert!(reg.is_empty());
        assert_eq!(handles_to_objects(wire, &reg, WorkerId(1)).unwrap(), v);
    }

    #[test]
    fn objects_become_handles_and_back() {
        let mut reg = HandleRegistry::new();
        let obj = new_object(Thing);
        let wire = objects_to_handles(Value::Tuple(vec![Value::Object(obj.clone()), Value::Null]), &mut reg);
        let handles = wire.handles();
        assert_eq!(handles.len(), 1);
        assert!(!handles[0].cacheable);
        assert_eq!(reg.refcount(handles[0].id), 1);

        let back = handles_to_objects(wire, &reg, WorkerId(1)).unwrap();
        let Value::Tuple(items) = back else { panic!("tuple expected") };
        assert!(Rc::ptr_eq(items[0].as_object().unwrap(), &obj));
    }

    #[test]
    fn callables_are_cacheable() {
        let mut reg = HandleRegistry::new();
        let wire = objects_to_handles(Value::Object(new_object(Func)), &mut reg);
        let WireValue::Handle(h) = wire else { panic!("handle expected") };
        assert!(h.cacheable);
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let reg = HandleRegistry::new();
        let wire = WireValue::Handle(HandleRef::new(HandleId(99)));
        assert!(matches!(
            handles_to_objects(wire, &reg, WorkerId(1)),
            Err(MarshalError::UnknownHandle(HandleId(99)))
        ));
    }

    #[test]
    fn callable_ref_becomes_shim_for_origin_worker() {
        let reg = HandleRegistry::new();
        let wire = WireValue::Callable(CallableRef::new("main", "tick"));
        let shim = handles_to_objects(wire, &reg, WorkerId(7)).unwrap();
        let mut ctx = CallCtx::new(WorkerId(1));
        call_object(shim.as_object().unwrap(), &mut ctx, vec![], Kwargs::new()).unwrap();
        assert_eq!(
            ctx.take_effects(),
            vec![Effect::Invoke {
                worker: WorkerId(7),
                callable: CallableRef::new("main", "tick")
            }]
        );
    }
}
