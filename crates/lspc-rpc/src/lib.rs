//! Client-side JSON-RPC transport for language servers.
//!
//! Messages travel as `Content-Length: <n>\r\n\r\n<n bytes of JSON>` over any
//! duplex byte stream (process stdio, sockets, in-memory pipes). The
//! [`codec`] layer turns raw bytes into frames; the [`endpoint`] layer
//! correlates responses with our requests and surfaces the peer's own
//! requests and notifications to registered handlers.

pub mod codec;
pub mod endpoint;
pub mod error;
pub mod jsonrpc;
mod transport;

pub use codec::{DecoderState, Frame, FrameDecoder, FrameStream, encode_frame};
pub use endpoint::{Incoming, RpcEndpoint};
pub use error::{FramingError, RpcError};
pub use jsonrpc::{Message, RequestId, ResponseError};
pub use transport::ServerProcess;
