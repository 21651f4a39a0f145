//! Small type-keyed "opaque attachment" store.
//!
//! Per-rank auxiliary slots and per-future auxiliary attachments both need a
//! `key -> value` map where the value is opaque to the core and destroyed
//! with its owner. A C-style API would need a `(void *, destructor)` pair
//! keyed by a string; in Rust, ownership and `Drop` already give us the
//! destructor for free, so `Aux` is keyed by [`std::any::TypeId`] for the
//! common "bundle typed state with a handle" use, plus a string-keyed slot
//! for callers that really do want a name (`rank_aux_set`/`rank_aux_get`).
use std::any::{Any, TypeId};
use std::collections::HashMap;

#[derive(Default)]
pub struct Aux {
    by_type: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    by_name: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Aux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.by_type
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.by_type.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.by_type
            .remove(&TypeId::of::<T>())
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn set_named(&mut self, name: impl Into<String>, value: impl Any + Send + Sync) {
        self.by_name.insert(name.into(), Box::new(value));
    }

    pub fn get_named<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.by_name.get(name).and_then(|v| v.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for Aux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aux")
            .field("typed_slots", &self.by_type.len())
            .field("named_slots", &self.by_name.len())
            .finish()
    }
}
