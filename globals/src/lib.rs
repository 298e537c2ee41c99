//! Reactive store of named, typed dashboard variables.
//!
//! The session owns the only writer. Readers (the worker pool, binding
//! strategies) go through [`SharedGlobals`] and copy out what they need.

mod error;
mod store;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

pub use error::GlobalsError;
pub use store::{GlobalStore, Subscriber};

/// Shared handle to a [`GlobalStore`].
///
/// Subscribers are notified after the write lock is released.
#[derive(Debug, Clone)]
pub struct SharedGlobals(Arc<RwLock<GlobalStore>>);

impl SharedGlobals {
    #[must_use]
    pub fn new(mut store: GlobalStore) -> Self {
        store.defer_notifications();
        Self(Arc::new(RwLock::new(store)))
    }

    /// Recovers from poisoning left by a panicking update.
    pub fn read(&self) -> RwLockReadGuard<'_, GlobalStore> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the store, then notify subscribers of every change `f` made.
    pub fn update<R>(&self, f: impl FnOnce(&mut GlobalStore) -> R) -> R {
        let (result, notifications) = {
            let mut store = self.0.write().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut store);
            (result, store.take_notifications())
        };
        notifications.deliver();
        result
    }
}

impl Default for SharedGlobals {
    fn default() -> Self {
        Self::new(GlobalStore::new())
    }
}

impl From<GlobalStore> for SharedGlobals {
    fn from(store: GlobalStore) -> Self {
        Self::new(store)
    }
}
