use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("unknown cache command: {0}")]
    UnknownCommand(String),

    #[error("key '{0}' is not valid for this command")]
    InvalidKey(String),
}
