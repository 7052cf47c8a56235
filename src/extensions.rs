use std::any::{Any, TypeId};

use dashmap::DashMap;

/// A type map of socket-scoped state.
///
/// Lets applications share data through the lifetime of a socket (a nickname,
/// a session handle, ...) without wrapping the socket themselves. One value
/// per type; values are cloned out on access.
#[derive(Default)]
pub struct Extensions(DashMap<TypeId, Box<dyn Any + Send + Sync>>);

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.0.len()).finish()
    }
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type if any.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, val: T) -> Option<T> {
        self.0
            .insert(TypeId::of::<T>(), Box::new(val))
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.0
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value().downcast_ref::<T>().cloned())
    }

    pub fn remove<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.0
            .remove(&TypeId::of::<T>())
            .and_then(|(_, boxed)| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}
