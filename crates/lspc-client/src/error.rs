//! Error types for LSP client calls.

use lspc_rpc::RpcError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from [`LspClient`](crate::LspClient) operations.
#[derive(Debug, Error)]
pub enum LspError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("Cannot convert '{}' to a file URI", .0.display())]
    InvalidPath(PathBuf),
}

impl LspError {
    /// The server's error object, if the server answered with one.
    pub fn as_response_error(&self) -> Option<&lspc_rpc::ResponseError> {
        match self {
            Self::Rpc(RpcError::Remote(err)) => Some(err),
            _ => None,
        }
    }
}
