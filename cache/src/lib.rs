//! Cross-worker key/value cache with advisory read/write locks.
//!
//! [`SharedCache`] is a plain data structure owned by a single scheduler
//! task. It has no notion of time or threads: callers feed it
//! [`CacheCommand`]s and deliver the [`Completion`]s it hands back.

mod command;
mod error;
mod store;

pub use command::{CacheCommand, CacheReply, WILDCARD_KEY};
pub use error::CacheError;
pub use store::{Completion, SharedCache};
