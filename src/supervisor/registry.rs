use std::collections::HashMap;
use std::rc::Rc;

use panel_protocol::{HandleId, HandleRef};
use thiserror::Error;
use tracing::trace;

use super::object::ObjectRef;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown handle {0}")]
    Unknown(HandleId),
}

struct Entry {
    refcount: usize,
    object: ObjectRef,
}

/// Live objects handed to one worker, keyed by handle id.
///
/// The id is the address of the `Rc` allocation. The registry holds a strong
/// reference for as long as the entry exists, so the address cannot be reused
/// by another object while the id is live.
#[derive(Default)]
pub struct HandleRegistry {
    entries: HashMap<HandleId, Entry>,
}

pub fn handle_of(object: &ObjectRef) -> HandleId {
    HandleId(Rc::as_ptr(object) as *const () as usize as u64)
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out one more copy of the handle for `object`.
    pub fn allocate(&mut self, object: &ObjectRef, cacheable: bool) -> HandleRef {
        let id = handle_of(object);
        let entry = self.entries.entry(id).or_insert_with(|| Entry {
            refcount: 0,
            object: object.clone(),
        });
        entry.refcount += 1;
        trace!(handle = %id, refcount = entry.refcount, "allocate");
        HandleRef { id, cacheable }
    }

    pub fn resolve(&self, id: HandleId) -> Result<ObjectRef, RegistryError> {
        self.entries
            .get(&id)
            .map(|e| e.object.clone())
            .ok_or(RegistryError::Unknown(id))
    }

    /// Drops one copy; the entry goes away with the last one.
    pub fn release(&mut self, id: HandleId) -> Result<(), RegistryError> {
        let entry = self.entries.get_mut(&id).ok_or(RegistryError::Unknown(id))?;
        entry.refcount -= 1;
        trace!(handle = %id, refcount = entry.refcount, "release");
        if entry.refcount == 0 {
            self.entries.remove(&id);
        }
        Ok(())
    }

    pub fn refcount(&self, id: HandleId) -> usize {
        self.entries.get(&id).map_or(0, |e| e.refcount)
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::object::{HostObject, new_object};

    struct Dummy;

    impl HostObject for Dummy {
        fn type_name(&self) -> &'static str {
            "dummy"
        }
    }

    #[test]
    fn same_object_same_id() {
        let mut reg = HandleRegistry::new();
        let obj = new_object(Dummy);
        let a = reg.allocate(&obj, false);
        let b = reg.allocate(&obj, true);
        assert_eq!(a.id, b.id);
        assert!(b.cacheable);
        assert_eq!(reg.refcount(a.id), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn distinct_objects_distinct_ids() {
        let mut reg = HandleRegistry::new();
        let a = reg.allocate(&new_object(Dummy), false);
        let b = reg.allocate(&new_object(Dummy), false);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn resolves_until_last_release() {
        let mut reg = HandleRegistry::new();
        let obj = new_object(Dummy);
        let h = reg.allocate(&obj, false);
        reg.allocate(&obj, false);

        reg.release(h.id).unwrap();
        assert!(Rc::ptr_eq(&reg.resolve(h.id).unwrap(), &obj));
        reg.release(h.id).unwrap();
        assert!(matches!(reg.resolve(h.id), Err(RegistryError::Unknown(_))));
        assert!(reg.release(h.id).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn registry_keeps_object_alive() {
        let mut reg = HandleRegistry::new();
        let h = reg.allocate(&new_object(Dummy), false);
        assert_eq!(reg.resolve(h.id).unwrap().borrow().type_name(), "dummy");
    }

    #[test]
    fn n_copies_then_n_releases_restores_state() {
        let mut reg = HandleRegistry::new();
        let obj = new_object(Dummy);
        let base = reg.allocate(&obj, false);
        for _ in 0..10 {
            reg.allocate(&obj, false);
        }
        for _ in 0..10 {
            reg.release(base.id).unwrap();
        }
        assert_eq!(reg.refcount(base.id), 1);
        assert_eq!(reg.len(), 1);
    }
}
