//! Cache command and reply shapes as exchanged with workers.
//!
//! Both travel as JSON so runners written against any language can build
//! them: `{"cmd": "LOCK", "key": "k", "isWrite": true}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tessera_types::LockId;

use crate::error::CacheError;

/// Key that addresses the whole cache. Only valid for `DELETE`.
pub const WILDCARD_KEY: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "UPPERCASE")]
pub enum CacheCommand {
    Get {
        key: String,
        #[serde(default)]
        blocking: bool,
        #[serde(default, rename = "lockId", skip_serializing_if = "Option::is_none")]
        lock_id: Option<LockId>,
    },
    Put {
        key: String,
        value: Value,
        #[serde(default)]
        blocking: bool,
        #[serde(default, rename = "lockId", skip_serializing_if = "Option::is_none")]
        lock_id: Option<LockId>,
    },
    Delete {
        key: String,
        #[serde(default)]
        blocking: bool,
        #[serde(default, rename = "lockId", skip_serializing_if = "Option::is_none")]
        lock_id: Option<LockId>,
    },
    Lock {
        key: String,
        #[serde(default, rename = "isWrite")]
        is_write: bool,
    },
    Unlock {
        key: String,
        #[serde(rename = "lockId")]
        lock_id: LockId,
    },
}

impl CacheCommand {
    /// Decode a worker-supplied command.
    pub fn from_json(data: &Value) -> Result<Self, CacheError> {
        let Some(cmd) = data.get("cmd").and_then(Value::as_str) else {
            return Err(CacheError::UnknownCommand("missing 'cmd' field".to_string()));
        };
        if !matches!(cmd, "GET" | "PUT" | "DELETE" | "LOCK" | "UNLOCK") {
            return Err(CacheError::UnknownCommand(cmd.to_string()));
        }
        serde_json::from_value(data.clone())
            .map_err(|e| CacheError::UnknownCommand(format!("{cmd}: {e}")))
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            CacheCommand::Get { key, .. }
            | CacheCommand::Put { key, .. }
            | CacheCommand::Delete { key, .. }
            | CacheCommand::Lock { key, .. }
            | CacheCommand::Unlock { key, .. } => key,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            CacheCommand::Get { .. } => "GET",
            CacheCommand::Put { .. } => "PUT",
            CacheCommand::Delete { .. } => "DELETE",
            CacheCommand::Lock { .. } => "LOCK",
            CacheCommand::Unlock { .. } => "UNLOCK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CacheReply {
    Value {
        value: Value,
    },
    Miss,
    Ok,
    Locked {
        #[serde(rename = "lockId")]
        lock_id: LockId,
    },
    Unlocked {
        released: bool,
    },
    UnknownCommand {
        detail: String,
    },
    InvalidKey {
        key: String,
    },
}

impl From<CacheError> for CacheReply {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::UnknownCommand(detail) => CacheReply::UnknownCommand { detail },
            CacheError::InvalidKey(key) => CacheReply::InvalidKey { key },
        }
    }
}
