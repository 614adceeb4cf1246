use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Opaque name of a live object owned by the supervisor.
///
/// Ids are only meaningful to the worker they were handed to; the supervisor
/// never resolves an id that arrived from a different worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{:x}", self.0)
    }
}

/// A handle as it travels on the wire: the id plus the "cacheable" hint.
///
/// A cacheable handle names an object whose identity will not change for the
/// lifetime of the worker (bound methods, user callables), so the worker may
/// memoize the attribute that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleRef {
    pub id: HandleId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cacheable: bool,
}

impl HandleRef {
    pub fn new(id: HandleId) -> Self {
        Self { id, cacheable: false }
    }

    pub fn cacheable(id: HandleId) -> Self {
        Self { id, cacheable: true }
    }
}

/// Identity of one open app and its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// By-name reference to a function of a user module, written `module.function`.
///
/// Holding a reference pins nothing: it is resolved again every time it is
/// invoked, inside the worker that owns the module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallableRef {
    pub module: String,
    pub function: String,
}

impl CallableRef {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for CallableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

impl FromStr for CallableRef {
    type Err = ProtocolError;

    /// Splits on the last dot so dotted module paths survive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.rsplit_once('.') {
            Some((module, function)) if !module.is_empty() && !function.is_empty() => {
                Ok(Self::new(module, function))
            }
            _ => Err(ProtocolError::BadCallable(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callable_ref_parses_module_and_function() {
        let c: CallableRef = "scan.on_start".parse().unwrap();
        assert_eq!(c.module, "scan");
        assert_eq!(c.function, "on_start");
        assert_eq!(c.to_string(), "scan.on_start");
    }

    #[test]
    fn callable_ref_keeps_dotted_module_path() {
        let c: CallableRef = "lab.optics.align".parse().unwrap();
        assert_eq!(c.module, "lab.optics");
        assert_eq!(c.function, "align");
    }

    #[test]
    fn callable_ref_rejects_bare_names() {
        assert!("align".parse::<CallableRef>().is_err());
        assert!(".align".parse::<CallableRef>().is_err());
        assert!("scan.".parse::<CallableRef>().is_err());
    }

    #[test]
    fn cacheable_hint_is_omitted_when_false() {
        let plain = serde_json::to_string(&HandleRef::new(HandleId(7))).unwrap();
        assert_eq!(plain, r#"{"id":7}"#);
        let cached: HandleRef = serde_json::from_str(r#"{"id":7,"cacheable":true}"#).unwrap();
        assert!(cached.cacheable);
    }
}
