use serde::{Deserialize, Serialize};

use crate::deps::CommentStyle;

/// Magic-comment delimiters per binding language.
///
/// Deserialized from the `[bindings]` table of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingsConfig {
    #[serde(default = "CommentStyle::query")]
    pub query: CommentStyle,
    #[serde(default = "CommentStyle::script")]
    pub script: CommentStyle,
    #[serde(default = "CommentStyle::kernel")]
    pub kernel: CommentStyle,
}

impl Default for BindingsConfig {
    fn default() -> Self {
        Self {
            query: CommentStyle::query(),
            script: CommentStyle::script(),
            kernel: CommentStyle::kernel(),
        }
    }
}
