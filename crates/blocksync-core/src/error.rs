//! Error types for block synchronization.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("unknown block: {0}")] UnknownBlock(String),
    #[error("unknown segment: {0}")] UnknownSegment(String),
    #[error("orphan header: parent {0} is not indexed")] OrphanHeader(String),
    #[error("block body missing: {0}")] MissingBody(String),
    #[error("output not found: {0}")] MissingOutput(String),
    #[error("block {0} does not extend the committed head")] NotConnectable(String),
    #[error("empty chain: no blocks connected")] EmptyChain,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("backend: {0}")] Backend(String),
    #[error("codec: {0}")] Codec(String),
    #[error(transparent)] Chain(#[from] ChainError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("peer disconnected: {0}")] PeerDisconnected(String),
    #[error("timeout")] Timeout,
    #[error("request rejected: {0}")] Rejected(String),
    #[error("unexpected block: requested {requested}, got {received}")] UnexpectedBlock { requested: String, received: String },
}
