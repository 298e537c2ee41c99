use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::{SerializedGlobal, TypeTag};

/// One version of a named, typed dashboard variable.
///
/// Fields are private; a new version is a new record. The store replaces
/// records wholesale and never mutates one in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Global {
    name: String,
    #[serde(rename = "type")]
    type_tag: TypeTag,
    value: Value,
}

impl Global {
    #[must_use]
    pub fn new(name: impl Into<String>, type_tag: TypeTag, value: Value) -> Self {
        Self {
            name: name.into(),
            type_tag,
            value,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn with_value(&self, value: Value) -> Self {
        Self::new(self.name.clone(), self.type_tag, value)
    }

    #[must_use]
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self::new(name, self.type_tag, self.value.clone())
    }

    #[must_use]
    pub fn to_serialized(&self) -> SerializedGlobal {
        SerializedGlobal::new(self.type_tag, self.value.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Rename,
    Update,
    Delete,
    Cast,
}

/// Notification emitted after the store's map has been updated.
///
/// `name`, `type_tag` and `value` always describe the record as it is after
/// the change (for `Delete`, the record that was removed). The `old_*`
/// fields carry whatever the action replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalChange {
    pub action: ChangeAction,
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_type: Option<TypeTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
}

impl GlobalChange {
    #[must_use]
    pub fn added(global: &Global) -> Self {
        Self::plain(ChangeAction::Add, global)
    }

    #[must_use]
    pub fn deleted(global: &Global) -> Self {
        Self::plain(ChangeAction::Delete, global)
    }

    #[must_use]
    pub fn updated(global: &Global, old_value: Value) -> Self {
        Self {
            old_value: Some(old_value),
            ..Self::plain(ChangeAction::Update, global)
        }
    }

    #[must_use]
    pub fn renamed(global: &Global, old_name: String) -> Self {
        Self {
            old_name: Some(old_name),
            ..Self::plain(ChangeAction::Rename, global)
        }
    }

    #[must_use]
    pub fn cast(global: &Global, old_type: TypeTag, old_value: Value) -> Self {
        Self {
            old_type: Some(old_type),
            old_value: Some(old_value),
            ..Self::plain(ChangeAction::Cast, global)
        }
    }

    fn plain(action: ChangeAction, global: &Global) -> Self {
        Self {
            action,
            name: global.name().to_string(),
            type_tag: global.type_tag(),
            value: global.value().clone(),
            old_name: None,
            old_type: None,
            old_value: None,
        }
    }
}
