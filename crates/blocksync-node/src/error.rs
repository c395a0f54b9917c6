//! Errors surfaced by the node composition layer.

use blocksync_core::error::StorageError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")] Load(String),
    #[error("invalid configuration: {0}")] Invalid(String),
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)] Config(#[from] ConfigError),
    #[error(transparent)] Storage(#[from] StorageError),
    #[error("logging: {0}")] Logging(String),
    #[error("io: {0}")] Io(#[from] std::io::Error),
}
