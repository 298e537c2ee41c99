//! Core domain types for Tessera.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the workspace.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod error;
mod global;
mod ids;
mod value;

pub use error::{EvalError, TaskFailure};
pub use global::{ChangeAction, Global, GlobalChange};
pub use ids::{LockId, MessageId, SubscriptionId, TaskId, WorkerId};
pub use value::{ConversionError, SerializedGlobal, TypeTag, deep_equal};

/// Flat name → serialized value map handed to a worker with each task.
pub type GlobalsMap = std::collections::BTreeMap<String, SerializedGlobal>;
