use thiserror::Error;

use crate::common::error::GridError::GenericError;

#[derive(Debug, Error)]
pub enum GridError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Credential error: {0}")]
    CredentialError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<toml::de::Error> for GridError {
    fn from(error: toml::de::Error) -> Self {
        Self::ConfigError(error.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(error: serde_json::Error) -> Self {
        Self::CredentialError(error.to_string())
    }
}

impl From<anyhow::Error> for GridError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<String> for GridError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
