//! Error types for framing and JSON-RPC operations.

use crate::jsonrpc::ResponseError;
use thiserror::Error;

/// Errors from the `Content-Length` framing layer.
///
/// Any of these is fatal to the stream it was raised on: the decoder never
/// scans forward to resynchronize.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Bad header: {0}")]
    BadHeader(String),

    #[error("Content length {length} exceeds maximum {max}")]
    TooLarge { length: usize, max: usize },

    #[error("Stream ended mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the RPC endpoint.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("JSON-RPC error (code {}): {}", .0.code, .0.message)]
    Remote(ResponseError),

    #[error("Received id mismatch: got {id}, no pending request matches (pending: {pending:?})")]
    UnmatchedResponse { id: String, pending: Vec<i64> },

    #[error("Unclassifiable frame: {0}")]
    Unclassifiable(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Endpoint already has a reader attached")]
    AlreadyAttached,

    #[error("Failed to spawn server '{command}': {source}")]
    SpawnFailed {
        command: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
