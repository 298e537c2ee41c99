//! In-memory key/value store with advisory per-key read/write locks.
//!
//! The store never blocks a thread. Requests that cannot be served yet are
//! parked in the key's FIFO queue together with a caller-supplied ticket, and
//! come back as [`Completion`]s from whichever later call admits them.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;

use serde_json::Value;

use tessera_types::LockId;

use crate::command::{CacheCommand, CacheReply, WILDCARD_KEY};

/// A reply that is ready to be delivered to `owner` for request `ticket`.
#[derive(Debug, PartialEq)]
pub struct Completion<O, T> {
    pub owner: O,
    pub ticket: T,
    pub key: String,
    pub reply: CacheReply,
}

#[derive(Debug)]
struct Holder {
    lock_id: LockId,
    is_write: bool,
}

#[derive(Debug)]
enum Pending {
    Lock { lock_id: LockId, is_write: bool },
    Op(CacheCommand),
}

#[derive(Debug)]
struct Waiter<O, T> {
    owner: O,
    ticket: T,
    pending: Pending,
}

#[derive(Debug)]
struct KeyState<O, T> {
    holders: Vec<Holder>,
    queue: VecDeque<Waiter<O, T>>,
}

impl<O, T> KeyState<O, T> {
    fn new() -> Self {
        Self {
            holders: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    fn holds(&self, lock_id: LockId) -> bool {
        self.holders.iter().any(|h| h.lock_id == lock_id)
    }

    /// Whether `pending` is compatible with the current holders.
    fn admits(&self, pending: &Pending) -> bool {
        match pending {
            Pending::Lock { is_write: true, .. } => self.holders.is_empty(),
            Pending::Lock {
                is_write: false, ..
            } => !self.holders.iter().any(|h| h.is_write),
            Pending::Op(CacheCommand::Get { lock_id, .. }) => !self
                .holders
                .iter()
                .any(|h| h.is_write && Some(h.lock_id) != *lock_id),
            Pending::Op(
                CacheCommand::Put { lock_id, .. } | CacheCommand::Delete { lock_id, .. },
            ) => self.holders.iter().all(|h| Some(h.lock_id) == *lock_id),
            Pending::Op(_) => true,
        }
    }
}

pub struct SharedCache<O, T> {
    entries: HashMap<String, Value>,
    keys: HashMap<String, KeyState<O, T>>,
    next_lock_id: u64,
}

impl<O, T> Default for SharedCache<O, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O, T> SharedCache<O, T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            keys: HashMap::new(),
            next_lock_id: 1,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of locks currently held on `key`.
    #[must_use]
    pub fn holder_count(&self, key: &str) -> usize {
        self.keys.get(key).map_or(0, |s| s.holders.len())
    }

    /// Number of requests parked behind `key`'s holders.
    #[must_use]
    pub fn queued_count(&self, key: &str) -> usize {
        self.keys.get(key).map_or(0, |s| s.queue.len())
    }
}

impl<O: Copy + Eq + Debug, T> SharedCache<O, T> {
    /// Run one command for `owner`.
    ///
    /// The returned completions may include the requester's own reply (when it
    /// could be served at once) and replies for other owners whose parked
    /// requests were admitted as a consequence.
    pub fn execute(&mut self, owner: O, ticket: T, command: CacheCommand) -> Vec<Completion<O, T>> {
        let key = command.key().to_string();
        if key == WILDCARD_KEY {
            let reply = if matches!(command, CacheCommand::Delete { .. }) {
                self.entries.clear();
                tracing::debug!("cache cleared");
                CacheReply::Ok
            } else {
                CacheReply::InvalidKey { key: key.clone() }
            };
            return vec![Completion {
                owner,
                ticket,
                key,
                reply,
            }];
        }

        match command {
            CacheCommand::Unlock { lock_id, .. } => {
                let (released, mut completions) = self.force_release(&key, lock_id);
                if !released {
                    tracing::warn!(key = %key, lock_id = %lock_id, "unlock of unknown lock ignored");
                }
                completions.insert(
                    0,
                    Completion {
                        owner,
                        ticket,
                        key,
                        reply: CacheReply::Unlocked { released },
                    },
                );
                completions
            }
            CacheCommand::Lock { is_write, .. } => {
                let lock_id = LockId::new(self.next_lock_id);
                self.next_lock_id += 1;
                self.enqueue_or_run(owner, ticket, key, Pending::Lock { lock_id, is_write })
            }
            op @ (CacheCommand::Get { blocking: true, .. }
            | CacheCommand::Put { blocking: true, .. }
            | CacheCommand::Delete { blocking: true, .. }) => {
                self.enqueue_or_run(owner, ticket, key, Pending::Op(op))
            }
            op => {
                let reply = apply(&mut self.entries, op);
                vec![Completion {
                    owner,
                    ticket,
                    key,
                    reply,
                }]
            }
        }
    }

    /// Drop the lock `lock_id` on `key` regardless of who holds it.
    ///
    /// Returns whether a lock was released and the completions of requests
    /// admitted as a result.
    pub fn force_release(&mut self, key: &str, lock_id: LockId) -> (bool, Vec<Completion<O, T>>) {
        let Some(state) = self.keys.get_mut(key) else {
            return (false, Vec::new());
        };
        let before = state.holders.len();
        state.holders.retain(|h| h.lock_id != lock_id);
        if state.holders.len() == before {
            return (false, Vec::new());
        }
        tracing::debug!(key, lock_id = %lock_id, "lock released");
        (true, self.advance(key))
    }

    /// Withdraw every request `owner` still has parked in any queue.
    pub fn withdraw_waiters(&mut self, owner: O) -> Vec<Completion<O, T>> {
        let touched: Vec<String> = self
            .keys
            .iter_mut()
            .filter_map(|(key, state)| {
                let before = state.queue.len();
                state.queue.retain(|w| w.owner != owner);
                (state.queue.len() != before).then(|| key.clone())
            })
            .collect();

        let mut completions = Vec::new();
        for key in touched {
            tracing::debug!(key = %key, owner = ?owner, "withdrew queued cache requests");
            completions.extend(self.advance(&key));
        }
        completions
    }

    fn enqueue_or_run(
        &mut self,
        owner: O,
        ticket: T,
        key: String,
        pending: Pending,
    ) -> Vec<Completion<O, T>> {
        let Self { entries, keys, .. } = self;
        let state = keys.entry(key.clone()).or_insert_with(KeyState::new);

        // An operation made under a lock the caller already holds must not
        // queue behind requests that are themselves waiting on that lock.
        let under_own_lock = matches!(
            &pending,
            Pending::Op(
                CacheCommand::Get { lock_id: Some(id), .. }
                | CacheCommand::Put { lock_id: Some(id), .. }
                | CacheCommand::Delete { lock_id: Some(id), .. }
            ) if state.holds(*id)
        );

        if (state.queue.is_empty() || under_own_lock) && state.admits(&pending) {
            let reply = admit(entries, state, pending);
            if state.is_idle() {
                keys.remove(&key);
            }
            return vec![Completion {
                owner,
                ticket,
                key,
                reply,
            }];
        }

        tracing::debug!(key = %key, owner = ?owner, "cache request queued");
        state.queue.push_back(Waiter {
            owner,
            ticket,
            pending,
        });
        Vec::new()
    }

    /// Admit parked requests from the front of `key`'s queue while they fit.
    fn advance(&mut self, key: &str) -> Vec<Completion<O, T>> {
        let Self { entries, keys, .. } = self;
        let mut completions = Vec::new();
        let idle = match keys.get_mut(key) {
            Some(state) => {
                while state
                    .queue
                    .front()
                    .is_some_and(|front| state.admits(&front.pending))
                {
                    let Some(waiter) = state.queue.pop_front() else {
                        break;
                    };
                    let reply = admit(entries, state, waiter.pending);
                    completions.push(Completion {
                        owner: waiter.owner,
                        ticket: waiter.ticket,
                        key: key.to_string(),
                        reply,
                    });
                }
                state.is_idle()
            }
            None => false,
        };
        if idle {
            keys.remove(key);
        }
        completions
    }
}

fn admit<O, T>(
    entries: &mut HashMap<String, Value>,
    state: &mut KeyState<O, T>,
    pending: Pending,
) -> CacheReply {
    match pending {
        Pending::Lock { lock_id, is_write } => {
            state.holders.push(Holder { lock_id, is_write });
            CacheReply::Locked { lock_id }
        }
        Pending::Op(op) => apply(entries, op),
    }
}

fn apply(entries: &mut HashMap<String, Value>, op: CacheCommand) -> CacheReply {
    match op {
        CacheCommand::Get { key, .. } => match entries.get(&key) {
            Some(value) => CacheReply::Value {
                value: value.clone(),
            },
            None => CacheReply::Miss,
        },
        CacheCommand::Put { key, value, .. } => {
            entries.insert(key, value);
            CacheReply::Ok
        }
        CacheCommand::Delete { key, .. } => {
            entries.remove(&key);
            CacheReply::Ok
        }
        CacheCommand::Lock { .. } | CacheCommand::Unlock { .. } => CacheReply::UnknownCommand {
            detail: "lock commands are not data operations".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Cache = SharedCache<u32, &'static str>;

    fn lock(key: &str, is_write: bool) -> CacheCommand {
        CacheCommand::Lock {
            key: key.to_string(),
            is_write,
        }
    }

    fn unlock(key: &str, lock_id: LockId) -> CacheCommand {
        CacheCommand::Unlock {
            key: key.to_string(),
            lock_id,
        }
    }

    fn get(key: &str) -> CacheCommand {
        CacheCommand::Get {
            key: key.to_string(),
            blocking: false,
            lock_id: None,
        }
    }

    fn put(key: &str, value: Value) -> CacheCommand {
        CacheCommand::Put {
            key: key.to_string(),
            value,
            blocking: false,
            lock_id: None,
        }
    }

    fn granted(completions: &[Completion<u32, &'static str>]) -> LockId {
        match completions {
            [Completion {
                reply: CacheReply::Locked { lock_id },
                ..
            }] => *lock_id,
            other => panic!("expected a single grant, got {other:?}"),
        }
    }

    #[test]
    fn put_then_get() {
        let mut cache = Cache::new();
        cache.execute(1, "p", put("k", json!("v")));
        let out = cache.execute(1, "g", get("k"));
        assert_eq!(out[0].reply, CacheReply::Value { value: json!("v") });
    }

    #[test]
    fn get_unset_key_is_miss() {
        let mut cache = Cache::new();
        let out = cache.execute(1, "g", get("nothing"));
        assert_eq!(out[0].reply, CacheReply::Miss);
    }

    #[test]
    fn delete_wildcard_clears_everything() {
        let mut cache = Cache::new();
        cache.execute(1, "a", put("a", json!(1)));
        cache.execute(1, "b", put("b", json!(2)));
        let out = cache.execute(
            1,
            "d",
            CacheCommand::Delete {
                key: WILDCARD_KEY.to_string(),
                blocking: true,
                lock_id: None,
            },
        );
        assert_eq!(out[0].reply, CacheReply::Ok);
        assert!(cache.is_empty());
    }

    #[test]
    fn wildcard_rejected_outside_delete() {
        let mut cache = Cache::new();
        let out = cache.execute(1, "g", get(WILDCARD_KEY));
        assert_eq!(
            out[0].reply,
            CacheReply::InvalidKey {
                key: "*".to_string()
            }
        );
        let out = cache.execute(1, "l", lock(WILDCARD_KEY, true));
        assert!(matches!(out[0].reply, CacheReply::InvalidKey { .. }));
    }

    #[test]
    fn read_locks_share() {
        let mut cache = Cache::new();
        granted(&cache.execute(1, "r1", lock("k", false)));
        granted(&cache.execute(2, "r2", lock("k", false)));
        assert_eq!(cache.holder_count("k"), 2);
    }

    #[test]
    fn write_lock_waits_for_unlock() {
        let mut cache = Cache::new();
        let first = granted(&cache.execute(1, "w1", lock("k", true)));
        assert!(cache.execute(2, "w2", lock("k", true)).is_empty());
        assert_eq!(cache.queued_count("k"), 1);

        let out = cache.execute(1, "u1", unlock("k", first));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].reply, CacheReply::Unlocked { released: true });
        assert_eq!(out[1].owner, 2);
        assert_eq!(out[1].ticket, "w2");
        assert!(matches!(out[1].reply, CacheReply::Locked { .. }));
    }

    #[test]
    fn force_release_hands_lock_to_next_waiter() {
        let mut cache = Cache::new();
        let first = granted(&cache.execute(1, "w1", lock("k", true)));
        cache.execute(2, "w2", lock("k", true));

        let (released, out) = cache.force_release("k", first);
        assert!(released);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].owner, 2);
        assert_eq!(cache.holder_count("k"), 1);
    }

    #[test]
    fn queue_is_fifo_even_for_compatible_readers() {
        let mut cache = Cache::new();
        let r1 = granted(&cache.execute(1, "r1", lock("k", false)));
        assert!(cache.execute(2, "w", lock("k", true)).is_empty());
        // A read lock would be compatible with r1 but must not overtake the writer.
        assert!(cache.execute(3, "r3", lock("k", false)).is_empty());

        let out = cache.execute(1, "u", unlock("k", r1));
        let tickets: Vec<&str> = out.iter().map(|c| c.ticket).collect();
        assert_eq!(tickets, ["u", "w"]);
        assert_eq!(cache.queued_count("k"), 1);
    }

    #[test]
    fn consecutive_readers_are_admitted_together() {
        let mut cache = Cache::new();
        let w = granted(&cache.execute(1, "w", lock("k", true)));
        cache.execute(2, "r2", lock("k", false));
        cache.execute(3, "r3", lock("k", false));

        let out = cache.execute(1, "u", unlock("k", w));
        assert_eq!(out.len(), 3);
        assert_eq!(cache.holder_count("k"), 2);
    }

    #[test]
    fn unknown_unlock_is_a_no_op() {
        let mut cache = Cache::new();
        let out = cache.execute(1, "u", unlock("k", LockId::new(99)));
        assert_eq!(out[0].reply, CacheReply::Unlocked { released: false });
    }

    #[test]
    fn blocking_get_waits_for_foreign_writer() {
        let mut cache = Cache::new();
        cache.execute(9, "seed", put("k", json!(1)));
        let w = granted(&cache.execute(1, "w", lock("k", true)));

        let blocking_get = CacheCommand::Get {
            key: "k".to_string(),
            blocking: true,
            lock_id: None,
        };
        assert!(cache.execute(2, "g", blocking_get).is_empty());

        // The writer updates under its own lock without queueing.
        let out = cache.execute(
            1,
            "p",
            CacheCommand::Put {
                key: "k".to_string(),
                value: json!(2),
                blocking: true,
                lock_id: Some(w),
            },
        );
        assert_eq!(out[0].reply, CacheReply::Ok);

        let out = cache.execute(1, "u", unlock("k", w));
        assert_eq!(out[1].ticket, "g");
        assert_eq!(out[1].reply, CacheReply::Value { value: json!(2) });
        assert_eq!(cache.queued_count("k"), 0);
    }

    #[test]
    fn non_blocking_ops_ignore_locks() {
        let mut cache = Cache::new();
        granted(&cache.execute(1, "w", lock("k", true)));
        let out = cache.execute(2, "p", put("k", json!("sneaky")));
        assert_eq!(out[0].reply, CacheReply::Ok);
    }

    #[test]
    fn withdraw_waiters_unblocks_followers() {
        let mut cache = Cache::new();
        let r = granted(&cache.execute(1, "r1", lock("k", false)));
        cache.execute(2, "w2", lock("k", true));
        cache.execute(3, "r3", lock("k", false));

        let out = cache.withdraw_waiters(2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ticket, "r3");

        let (released, _) = cache.force_release("k", r);
        assert!(released);
        assert_eq!(cache.holder_count("k"), 1);
    }

    #[test]
    fn idle_keys_are_forgotten() {
        let mut cache = Cache::new();
        let id = granted(&cache.execute(1, "l", lock("k", true)));
        cache.execute(1, "u", unlock("k", id));
        assert!(cache.keys.is_empty());
    }
}
