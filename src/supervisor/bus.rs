//! Process-wide shared state: named namespaces and the trigger → action table.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use panel_protocol::{HandleId, WorkerId};
use tracing::debug;

use super::object::{CallCtx, HostError, HostObject, ObjectRef, new_object, no_attr, required};
use super::value::{Kwargs, Value};

pub type SharedBus = Rc<RefCell<GlobalBus>>;

#[derive(Default)]
pub struct GlobalBus {
    namespaces: HashMap<String, ObjectRef>,
    actions: HashMap<String, Vec<(WorkerId, HandleId)>>,
}

impl GlobalBus {
    pub fn shared() -> SharedBus {
        Rc::new(RefCell::new(Self::default()))
    }

    /// The record named `name`, created on first request.
    pub fn namespace(&mut self, name: &str) -> ObjectRef {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(namespace = name, "creating global namespace");
                new_object(NamespaceRecord::default())
            })
            .clone()
    }

    pub fn register_action(&mut self, name: &str, worker: WorkerId, handle: HandleId) {
        let entries = self.actions.entry(name.to_string()).or_default();
        if !entries.contains(&(worker, handle)) {
            entries.push((worker, handle));
        }
    }

    /// Receivers of trigger `name`. Entries whose worker is gone are dropped
    /// from the table on the way.
    pub fn targets(&mut self, name: &str, is_live: impl Fn(WorkerId) -> bool) -> Vec<(WorkerId, HandleId)> {
        let Some(entries) = self.actions.get_mut(name) else {
            return Vec::new();
        };
        entries.retain(|(worker, handle)| {
            let live = is_live(*worker);
            if !live {
                debug!(trigger = name, %worker, %handle, "pruning stale action");
            }
            live
        });
        entries.clone()
    }

    pub fn action_count(&self, name: &str) -> usize {
        self.actions.get(name).map_or(0, Vec::len)
    }
}

/// Open key/value record shared by every app naming it.
#[derive(Default)]
pub struct NamespaceRecord {
    entries: BTreeMap<String, Value>,
}

impl NamespaceRecord {
    fn key(value: &Value) -> Result<&str, HostError> {
        value
            .as_str()
            .ok_or_else(|| HostError::Type(format!("namespace keys are strings, got {}", value.type_name())))
    }
}

impl HostObject for NamespaceRecord {
    fn type_name(&self) -> &'static str {
        "namespace"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| no_attr(self.type_name(), name))
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        self.entries.insert(name.to_string(), value);
        Ok(())
    }

    fn attributes(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["keys", "get", "remove"]
    }

    fn call_method(&mut self, _ctx: &mut CallCtx, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "keys" => Ok(Value::List(self.entries.keys().cloned().map(Value::Str).collect())),
            "get" => {
                let key = Self::key(required(&args, &kwargs, 0, "key")?)?;
                let default = args.get(1).or_else(|| kwargs.get("default")).cloned();
                Ok(self.entries.get(key).cloned().or(default).unwrap_or(Value::Null))
            }
            "remove" => {
                let key = Self::key(required(&args, &kwargs, 0, "key")?)?.to_string();
                self.entries.remove(&key).ok_or(HostError::Lookup(key))
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn get_item(&self, key: &Value) -> Result<Value, HostError> {
        let key = Self::key(key)?;
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| HostError::Lookup(key.to_string()))
    }

    fn set_item(&mut self, key: Value, value: Value) -> Result<(), HostError> {
        let key = Self::key(&key)?.to_string();
        self.entries.insert(key, value);
        Ok(())
    }

    fn len(&self) -> Result<usize, HostError> {
        Ok(self.entries.len())
    }

    fn iter(&self) -> Result<Vec<Value>, HostError> {
        Ok(self.entries.keys().cloned().map(Value::Str).collect())
    }

    fn repr(&self) -> String {
        format!("<namespace with {} entries>", self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::object::{invoke_method, read_attr};

    #[test]
    fn namespace_is_created_once() {
        let bus = GlobalBus::shared();
        let a = bus.borrow_mut().namespace("shared");
        let b = bus.borrow_mut().namespace("shared");
        assert!(Rc::ptr_eq(&a, &b));
        let c = bus.borrow_mut().namespace("other");
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn namespace_attributes_are_open() {
        let bus = GlobalBus::shared();
        let ns = bus.borrow_mut().namespace("shared");
        ns.borrow_mut().set_attr("wavelength", Value::Float(532.0)).unwrap();
        assert_eq!(read_attr(&ns, "wavelength").unwrap(), Value::Float(532.0));
        assert!(read_attr(&ns, "missing").is_err());

        let mut ctx = CallCtx::new(WorkerId(1));
        let keys = invoke_method(&ns, &mut ctx, "keys", vec![], Kwargs::new()).unwrap();
        assert_eq!(keys, Value::List(vec![Value::str("wavelength")]));
        let got = invoke_method(&ns, &mut ctx, "get", vec![Value::str("nope"), Value::Int(3)], Kwargs::new()).unwrap();
        assert_eq!(got, Value::Int(3));
    }

    #[test]
    fn stale_actions_are_pruned_in_place() {
        let mut bus = GlobalBus::default();
        bus.register_action("go", WorkerId(1), HandleId(10));
        bus.register_action("go", WorkerId(2), HandleId(20));
        bus.register_action("go", WorkerId(2), HandleId(20));
        assert_eq!(bus.action_count("go"), 2);

        let live = bus.targets("go", |w| w == WorkerId(2));
        assert_eq!(live, vec![(WorkerId(2), HandleId(20))]);
        assert_eq!(bus.action_count("go"), 1);
        assert!(bus.targets("nothing", |_| true).is_empty());
    }
}
