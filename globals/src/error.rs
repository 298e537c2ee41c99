use thiserror::Error;

use tessera_types::ConversionError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GlobalsError {
    #[error("global '{0}' not found")]
    NotFound(String),

    #[error("global '{0}' already exists")]
    AlreadyExists(String),

    #[error("global '{name}': {source}")]
    Conversion {
        name: String,
        #[source]
        source: ConversionError,
    },
}
