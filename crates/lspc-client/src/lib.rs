//! Language Server Protocol client.
//!
//! [`LspClient`] maps LSP methods onto an [`lspc_rpc::RpcEndpoint`]; the
//! [`types`] module holds the payloads it sends and receives.

mod client;
pub mod error;
pub mod types;

pub use client::LspClient;
pub use error::LspError;
pub use lspc_rpc::{Incoming, RequestId, ResponseError, RpcEndpoint, RpcError};
pub use types::path_to_uri;
