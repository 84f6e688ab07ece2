use std::io;
use thiserror::Error;

/// Errors raised while turning wire bytes or stored strings into typed values.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The bytes could not be decoded at all
    #[error("Malformed encoding: {0}")]
    Malformed(String),

    /// The bytes decoded but the result violates a structural rule
    #[error("Invalid block structure: {0}")]
    InvalidStructure(String),

    /// A JSON document stored alongside a row could not be read or written
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A binary column value was not valid hex
    #[error("Hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl From<bincode::Error> for CodecError {
    fn from(error: bincode::Error) -> Self {
        CodecError::Malformed(error.to_string())
    }
}

/// Errors related to loading and validating node configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
