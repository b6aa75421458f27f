use std::path::PathBuf;
use thiserror::Error;

use super::codec::CodecError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("configuration directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config file '{path}': {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unsupported file format '{extension}', supported formats: {}", .supported.join(", "))]
    UnsupportedFormat {
        extension: String,
        supported: Vec<String>,
    },

    #[error("failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        source: CodecError,
    },

    #[error("failed to serialize config to '{path}': {source}")]
    EncodeError {
        path: PathBuf,
        source: CodecError,
    },

    #[error("unknown environment '{name}', supported values: {}", .supported.join(", "))]
    InvalidEnvironment {
        name: String,
        supported: Vec<&'static str>,
    },

    #[error("unknown built-in rule '{name}', available rules: {}", .available.join(", "))]
    UnknownRule {
        name: String,
        available: Vec<&'static str>,
    },

    #[error("invalid validation pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("configuration validation failed: {}", .errors.join(", "))]
    ValidationFailed { errors: Vec<String> },

    #[error("failed to deserialize config: {0}")]
    DeserializeError(#[from] serde_json::Error),
}
