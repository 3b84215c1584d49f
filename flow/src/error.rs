use thiserror::Error;

use crate::filter::FilterId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid cascade configuration: {message}")]
    Config { message: String },

    #[error("dirty notification from an unrecognized input")]
    UnknownDirtySource,

    #[error("filter {filter:?} failed: {message}")]
    Filter { filter: FilterId, message: String },

    #[error("upstream read failed: {message}")]
    UpstreamRead { message: String },

    #[error("chunk store failure: {message}")]
    Store { message: String },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config {
            message: message.into(),
        }
    }

    pub fn filter(filter: FilterId, message: impl Into<String>) -> Self {
        EngineError::Filter {
            filter,
            message: message.into(),
        }
    }

    pub fn store(message: impl std::fmt::Display) -> Self {
        EngineError::Store {
            message: message.to_string(),
        }
    }

    pub fn upstream(message: impl std::fmt::Display) -> Self {
        EngineError::UpstreamRead {
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::store(err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::store(err)
    }
}
