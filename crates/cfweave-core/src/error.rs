//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid GUID '{value}' for {attribute}")]
    InvalidGuid { attribute: String, value: String },

    #[error("Invalid import specifier: {message}")]
    InvalidImport { message: String },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Schema error: {message}")]
    Schema { message: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
