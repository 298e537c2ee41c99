//! Binding evaluation strategies and the registry that picks between them.
//!
//! A [`Binding`] names a strategy by kind and carries the text it evaluates.
//! [`EvaluatorRegistry`] resolves the kind, works out which globals the text
//! reads, and evaluates it, delegating to the worker pool or the host kernel
//! where needed.

mod binding;
mod config;
mod deps;
mod registry;
mod strategy;

pub use binding::{Binding, kind};
pub use config::BindingsConfig;
pub use deps::{CommentStyle, DependencyScanner, ScanMode};
pub use registry::{EvaluatorRegistry, RegistryBuilder};
pub use strategy::{
    BindingEvaluator, ErrorStrategy, GlobalStrategy, KernelStrategy, NoneStrategy, ScriptStrategy,
};
