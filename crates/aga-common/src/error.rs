//! Errors shared by the protocol codec and configuration helpers.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A signaling frame could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An environment setting is present but malformed.
    #[error("configuration error: {name}: {reason}")]
    Config { name: String, reason: String },
}

impl Error {
    pub fn config(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Config {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
