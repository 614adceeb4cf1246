//! Conversion between script values and wire values.
//!
//! Going up, remote handles become their handle ids and function pointers
//! become `module.function` references. Coming down, every handle id becomes
//! a fresh [`RemoteHandle`] that owns one reference on the supervisor.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use panel_protocol::{CallableRef, HandleId, HandleRef, NdArray, UpwardOp, WireValue};
use rhai::{Array, Blob, Dynamic, FnPtr, Map};

use super::WorkerError;
use super::conduit::Conduit;
use super::proxies::Special;
use super::remote::RemoteHandle;

/// Wrappers named by an upward request that is still being built or sent.
pub type Pinned = Vec<RemoteHandle>;

/// What every remote handle shares: the transport, the function index used
/// to name callables, and the worker-local proxies keyed by handle.
pub struct Bridge {
    conduit: Arc<Conduit>,
    functions: RwLock<HashMap<String, String>>,
    specials: RwLock<HashMap<HandleId, Special>>,
}

impl Bridge {
    pub fn new(conduit: Arc<Conduit>) -> Arc<Self> {
        Arc::new(Self {
            conduit,
            functions: RwLock::new(HashMap::new()),
            specials: RwLock::new(HashMap::new()),
        })
    }

    pub fn conduit(&self) -> &Arc<Conduit> {
        &self.conduit
    }

    pub fn request(&self, op: UpwardOp) -> Result<WireValue, WorkerError> {
        self.conduit.request(op)
    }

    /// Records the functions a module defines. A name already claimed by an
    /// earlier module keeps pointing there.
    pub fn index_functions(&self, module: &str, names: impl IntoIterator<Item = String>) {
        let mut functions = self.functions.write().unwrap_or_else(PoisonError::into_inner);
        for name in names {
            functions.entry(name).or_insert_with(|| module.to_string());
        }
    }

    pub fn module_of(&self, function: &str) -> Option<String> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(function)
            .cloned()
    }

    pub fn add_special(&self, handle: HandleId, special: Special) {
        self.specials
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, special);
    }

    pub fn special(&self, handle: HandleId) -> Option<Special> {
        self.specials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    pub fn specials(&self) -> Vec<(HandleId, Special)> {
        self.specials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(h, s)| (*h, s.clone()))
            .collect()
    }

    pub fn clear_specials(&self) {
        self.specials.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// A callable reference from a function pointer or a `module.function`
    /// string. Closures carry state that cannot cross and are refused.
    pub fn callable_of(&self, value: &Dynamic) -> Result<CallableRef, WorkerError> {
        if let Some(f) = value.clone().try_cast::<FnPtr>() {
            return self.callable_of_ptr(&f);
        }
        if value.is_string() {
            let text = value.to_string();
            return match text.parse::<CallableRef>() {
                Ok(callable) => Ok(callable),
                Err(_) => self
                    .module_of(&text)
                    .map(|module| CallableRef::new(module, text.clone()))
                    .ok_or_else(|| WorkerError::Marshal(format!("no imported module defines `{text}`"))),
            };
        }
        Err(WorkerError::Marshal(format!(
            "expected a function, got {}",
            value.type_name()
        )))
    }

    pub fn callable_of_ptr(&self, f: &FnPtr) -> Result<CallableRef, WorkerError> {
        let name = f.fn_name();
        if f.is_curried() || f.is_anonymous() {
            return Err(WorkerError::Marshal(format!(
                "closure `{name}` has no module-level name and cannot be passed to the supervisor"
            )));
        }
        self.module_of(name)
            .map(|module| CallableRef::new(module, name))
            .ok_or_else(|| WorkerError::Marshal(format!("no imported module defines `{name}`")))
    }

    /// Converts a script value for an upward request. Every wrapper met on
    /// the way is moved into `pinned`; the caller holds `pinned` until the
    /// request is sent, so no delete for those handles can overtake it.
    pub fn to_wire(&self, value: Dynamic, pinned: &mut Pinned) -> Result<WireValue, WorkerError> {
        let value = value.flatten();
        if value.is_unit() {
            return Ok(WireValue::Null);
        }
        if let Ok(b) = value.as_bool() {
            return Ok(WireValue::Bool(b));
        }
        if let Ok(i) = value.as_int() {
            return Ok(WireValue::Int(i));
        }
        if let Ok(f) = value.as_float() {
            return Ok(WireValue::Float(f));
        }
        if let Ok(c) = value.as_char() {
            return Ok(WireValue::Str(c.to_string()));
        }
        if value.is_string() {
            return Ok(WireValue::Str(value.to_string()));
        }
        let type_name = value.type_name();
        if value.is::<RemoteHandle>() {
            let handle = value.try_cast::<RemoteHandle>().ok_or_else(|| mismatch(type_name))?;
            let wire = WireValue::Handle(HandleRef::new(handle.handle_id()));
            pinned.push(handle);
            return Ok(wire);
        }
        if value.is::<FnPtr>() {
            let f = value.try_cast::<FnPtr>().ok_or_else(|| mismatch(type_name))?;
            return self.callable_of_ptr(&f).map(WireValue::Callable);
        }
        if value.is::<Blob>() {
            return value
                .try_cast::<Blob>()
                .map(WireValue::Bytes)
                .ok_or_else(|| mismatch(type_name));
        }
        if value.is::<Array>() {
            let items = value.try_cast::<Array>().ok_or_else(|| mismatch(type_name))?;
            return items
                .into_iter()
                .map(|item| self.to_wire(item, pinned))
                .collect::<Result<Vec<_>, _>>()
                .map(WireValue::List);
        }
        if value.is::<Map>() {
            let map = value.try_cast::<Map>().ok_or_else(|| mismatch(type_name))?;
            let mut dict = BTreeMap::new();
            for (key, item) in map {
                dict.insert(key.to_string(), self.to_wire(item, pinned)?);
            }
            return Ok(WireValue::Dict(dict));
        }
        Err(WorkerError::Marshal(format!("values of type {type_name} cannot cross")))
    }

    pub fn from_wire(self: &Arc<Self>, value: WireValue) -> Dynamic {
        match value {
            WireValue::Null => Dynamic::UNIT,
            WireValue::Bool(b) => Dynamic::from_bool(b),
            WireValue::Int(i) => Dynamic::from_int(i),
            WireValue::Float(f) => Dynamic::from_float(f),
            WireValue::Str(s) => Dynamic::from(s),
            WireValue::Bytes(b) => Dynamic::from_blob(b),
            WireValue::Array(nd) => nd_to_dynamic(&nd),
            WireValue::List(items) | WireValue::Tuple(items) => {
                Dynamic::from_array(items.into_iter().map(|v| self.from_wire(v)).collect())
            }
            WireValue::Dict(dict) => {
                let map: Map = dict.into_iter().map(|(k, v)| (k.into(), self.from_wire(v))).collect();
                Dynamic::from_map(map)
            }
            WireValue::Handle(handle) => Dynamic::from(RemoteHandle::adopt(self, handle)),
            WireValue::Callable(callable) => match FnPtr::new(callable.function.as_str()) {
                Ok(f) => Dynamic::from(f),
                Err(_) => Dynamic::from(callable.to_string()),
            },
        }
    }

    pub fn args_to_wire(&self, args: Vec<Dynamic>, pinned: &mut Pinned) -> Result<Vec<WireValue>, WorkerError> {
        args.into_iter().map(|a| self.to_wire(a, pinned)).collect()
    }

    pub fn kwargs_to_wire(&self, kwargs: Map, pinned: &mut Pinned) -> Result<BTreeMap<String, WireValue>, WorkerError> {
        kwargs
            .into_iter()
            .map(|(k, v)| Ok((k.to_string(), self.to_wire(v, pinned)?)))
            .collect()
    }
}

fn mismatch(type_name: &str) -> WorkerError {
    WorkerError::Marshal(format!("value of type {type_name} changed while marshalling"))
}

/// Nested arrays of floats, outermost dimension first.
fn nd_to_dynamic(nd: &NdArray) -> Dynamic {
    fn build(shape: &[usize], data: &[f64]) -> Dynamic {
        match shape {
            [] => data.first().map_or(Dynamic::UNIT, |x| Dynamic::from_float(*x)),
            [_] => Dynamic::from_array(data.iter().map(|x| Dynamic::from_float(*x)).collect()),
            [rows, rest @ ..] => {
                let stride: usize = rest.iter().product();
                let items = (0..*rows)
                    .map(|r| {
                        let start = (r * stride).min(data.len());
                        let end = (start + stride).min(data.len());
                        build(rest, &data[start..end])
                    })
                    .collect();
                Dynamic::from_array(items)
            }
        }
    }
    build(&nd.shape, &nd.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{FrameSink, WorkerProbe};
    use panel_protocol::{ToSupervisor, WorkerId};

    struct Discard;

    impl FrameSink for Discard {
        fn send(&self, _frame: ToSupervisor) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    fn bridge() -> Arc<Bridge> {
        let probe = WorkerProbe::new(2);
        let (conduit, _rx) = Conduit::new(WorkerId(1), Box::new(Discard), &probe);
        conduit.close();
        Bridge::new(conduit)
    }

    #[test]
    fn plain_values_pass_through() {
        let b = bridge();
        let mut dict = BTreeMap::new();
        dict.insert("gain".to_string(), WireValue::Float(1.5));
        let wire = WireValue::List(vec![
            WireValue::Null,
            WireValue::Bool(true),
            WireValue::Int(-3),
            WireValue::Str("x".into()),
            WireValue::Bytes(vec![1, 2]),
            WireValue::Dict(dict),
        ]);
        let back = b.to_wire(b.from_wire(wire.clone()), &mut Pinned::new()).unwrap();
        assert_eq!(back, wire);
    }

    #[test]
    fn handles_round_trip_by_id() {
        let b = bridge();
        let wire = WireValue::Dict(BTreeMap::from([(
            "axes".to_string(),
            WireValue::Handle(HandleRef::new(HandleId(77))),
        )]));
        let mut pinned = Pinned::new();
        assert_eq!(b.to_wire(b.from_wire(wire.clone()), &mut pinned).unwrap(), wire);
        assert_eq!(pinned.len(), 1);
        assert_eq!(pinned[0].handle_id(), HandleId(77));
    }

    #[test]
    fn arrays_come_down_nested() {
        let b = bridge();
        let nd = NdArray::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let value = b.from_wire(WireValue::Array(nd));
        let rows = value.try_cast::<Array>().unwrap();
        assert_eq!(rows.len(), 2);
        let second = rows[1].clone().try_cast::<Array>().unwrap();
        assert_eq!(second[2].as_float().unwrap(), 6.0);
    }

    #[test]
    fn function_pointers_need_an_owning_module() {
        let b = bridge();
        let f = Dynamic::from(FnPtr::new("on_tick").unwrap());
        assert!(matches!(b.to_wire(f.clone(), &mut Pinned::new()), Err(WorkerError::Marshal(_))));
        b.index_functions("main", ["on_tick".to_string()]);
        assert_eq!(
            b.to_wire(f, &mut Pinned::new()).unwrap(),
            WireValue::Callable(CallableRef::new("main", "on_tick"))
        );
    }

    #[test]
    fn strings_name_callables() {
        let b = bridge();
        b.index_functions("main", ["go".to_string()]);
        assert_eq!(b.callable_of(&Dynamic::from("other.run")).unwrap(), CallableRef::new("other", "run"));
        assert_eq!(b.callable_of(&Dynamic::from("go")).unwrap(), CallableRef::new("main", "go"));
        assert!(b.callable_of(&Dynamic::from_int(3)).is_err());
    }

    #[test]
    fn unsupported_types_are_refused() {
        let b = bridge();
        #[derive(Clone)]
        struct Local;
        assert!(matches!(b.to_wire(Dynamic::from(Local), &mut Pinned::new()), Err(WorkerError::Marshal(_))));
    }
}
