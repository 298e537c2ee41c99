//! Global store: the named, typed values dashboards bind against.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use tessera_types::{Global, GlobalChange, GlobalsMap, SubscriptionId, TypeTag, deep_equal};

use crate::error::GlobalsError;

/// Callback invoked for every change, in subscription order.
///
/// A store used on its own notifies inside the mutator. Behind
/// [`SharedGlobals`](crate::SharedGlobals) notification waits until the write
/// lock is released, so a subscriber may read the store or evaluate bindings.
pub type Subscriber = Box<dyn Fn(&GlobalChange) + Send + Sync>;

type Listener = Arc<dyn Fn(&GlobalChange) + Send + Sync>;

/// Changes held back until the writer lets go of the store.
pub(crate) struct Notifications {
    changes: Vec<GlobalChange>,
    listeners: Vec<Listener>,
}

impl Notifications {
    pub(crate) fn deliver(self) {
        for change in &self.changes {
            for listener in &self.listeners {
                listener(change);
            }
        }
    }
}

/// Records are held behind `Arc` so snapshots are cheap and never observe a
/// half-applied update.
pub struct GlobalStore {
    globals: BTreeMap<String, Arc<Global>>,
    subscribers: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
    dirty: bool,
    deferred: bool,
    outbox: Vec<GlobalChange>,
}

impl Default for GlobalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GlobalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalStore")
            .field("globals", &self.globals)
            .field("subscribers", &self.subscribers.len())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl GlobalStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            globals: BTreeMap::new(),
            subscribers: Vec::new(),
            next_subscription: 1,
            dirty: false,
            deferred: false,
            outbox: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Result<&Arc<Global>, GlobalsError> {
        self.globals
            .get(name)
            .ok_or_else(|| GlobalsError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<&Value, GlobalsError> {
        Ok(self.lookup(name)?.value())
    }

    pub fn get_type(&self, name: &str) -> Result<TypeTag, GlobalsError> {
        Ok(self.lookup(name)?.type_tag())
    }

    /// The full record, shared with the store.
    pub fn get_global(&self, name: &str) -> Result<Arc<Global>, GlobalsError> {
        self.lookup(name).cloned()
    }

    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.globals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.globals.is_empty()
    }

    /// All current globals in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Global> {
        self.globals.values().map(AsRef::as_ref)
    }

    /// Replace the value of an existing global.
    ///
    /// The value is coerced through the global's type. A value deep-equal to
    /// the current one leaves the store untouched: no event, no dirty flag.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), GlobalsError> {
        let current = self.lookup(name)?;
        let coerced = current
            .type_tag()
            .convert(&value)
            .map_err(|source| GlobalsError::Conversion {
                name: name.to_string(),
                source,
            })?;
        if deep_equal(current.value(), &coerced) {
            tracing::trace!(global = name, "set skipped: value unchanged");
            return Ok(());
        }

        let next = Arc::new(current.with_value(coerced));
        let old = self.globals.insert(name.to_string(), Arc::clone(&next));
        let old_value = old.map_or(Value::Null, |g| g.value().clone());
        self.commit(GlobalChange::updated(&next, old_value));
        Ok(())
    }

    pub fn add_global(
        &mut self,
        name: &str,
        type_tag: TypeTag,
        value: Value,
    ) -> Result<(), GlobalsError> {
        if self.has(name) {
            return Err(GlobalsError::AlreadyExists(name.to_string()));
        }
        let coerced = type_tag
            .convert(&value)
            .map_err(|source| GlobalsError::Conversion {
                name: name.to_string(),
                source,
            })?;

        let global = Arc::new(Global::new(name, type_tag, coerced));
        self.globals.insert(name.to_string(), Arc::clone(&global));
        self.commit(GlobalChange::added(&global));
        Ok(())
    }

    pub fn remove_global(&mut self, name: &str) -> Result<(), GlobalsError> {
        let removed = self
            .globals
            .remove(name)
            .ok_or_else(|| GlobalsError::NotFound(name.to_string()))?;
        self.commit(GlobalChange::deleted(&removed));
        Ok(())
    }

    /// Cast a global to `new_type`.
    ///
    /// A value that does not survive the conversion becomes the type's null
    /// instead of failing the cast.
    pub fn change_type(&mut self, name: &str, new_type: TypeTag) -> Result<(), GlobalsError> {
        let current = self.lookup(name)?;
        let old_type = current.type_tag();
        let old_value = current.value().clone();

        let value = match new_type.convert(&old_value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(global = name, error = %e, "cast degraded value to null");
                new_type.null_value()
            }
        };

        let next = Arc::new(Global::new(name, new_type, value));
        self.globals.insert(name.to_string(), Arc::clone(&next));
        self.commit(GlobalChange::cast(&next, old_type, old_value));
        Ok(())
    }

    pub fn rename_global(&mut self, name: &str, new_name: &str) -> Result<(), GlobalsError> {
        self.lookup(name)?;
        if name == new_name {
            return Ok(());
        }
        if self.has(new_name) {
            return Err(GlobalsError::AlreadyExists(new_name.to_string()));
        }

        let old = self
            .globals
            .remove(name)
            .ok_or_else(|| GlobalsError::NotFound(name.to_string()))?;
        let next = Arc::new(old.with_name(new_name));
        self.globals.insert(new_name.to_string(), Arc::clone(&next));
        self.commit(GlobalChange::renamed(&next, name.to_string()));
        Ok(())
    }

    /// Remove every global, emitting one `delete` per record in name order.
    pub fn clear_all(&mut self) {
        let removed = std::mem::take(&mut self.globals);
        for global in removed.values() {
            self.commit(GlobalChange::deleted(global));
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_clean(&mut self) {
        self.dirty = false;
    }

    pub fn subscribe(&mut self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId::new(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Arc::from(subscriber)));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Serialize the named globals for shipping to a worker.
    ///
    /// Unknown names are skipped; dependency extraction over-approximates.
    #[must_use]
    pub fn snapshot<S: AsRef<str>>(&self, names: &[S]) -> GlobalsMap {
        names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                self.globals
                    .get(name)
                    .map(|g| (name.to_string(), g.to_serialized()))
            })
            .collect()
    }

    /// Hold notifications back until [`take_notifications`](Self::take_notifications).
    pub(crate) fn defer_notifications(&mut self) {
        self.deferred = true;
    }

    pub(crate) fn take_notifications(&mut self) -> Notifications {
        let changes = std::mem::take(&mut self.outbox);
        let listeners = if changes.is_empty() {
            Vec::new()
        } else {
            self.subscribers.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        Notifications { changes, listeners }
    }

    fn commit(&mut self, change: GlobalChange) {
        self.dirty = true;
        tracing::debug!(action = ?change.action, global = %change.name, "global changed");
        if self.deferred {
            self.outbox.push(change);
        } else {
            for (_, subscriber) in &self.subscribers {
                subscriber(&change);
            }
        }
    }
}
