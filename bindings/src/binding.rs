use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Built-in binding kinds.
pub mod kind {
    pub const GLOBAL: &str = "global";
    pub const NONE: &str = "none";
    pub const SCRIPT_JS: &str = "script-js";
    pub const SCRIPT_QUERY: &str = "script-query";
    pub const KERNEL: &str = "kernel";
}

/// How one input value of a dashboard part is computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Strategy discriminator, e.g. `script-query`.
    pub kind: String,
    pub text: String,
    /// Declared dependencies. Empty means "extract them from `text`".
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub globals: BTreeSet<String>,
}

impl Binding {
    #[must_use]
    pub fn new(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: text.into(),
            globals: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_globals<I, S>(mut self, globals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.globals = globals.into_iter().map(Into::into).collect();
        self
    }
}
