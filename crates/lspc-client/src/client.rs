//! LSP client: typed calls over one server connection.
//!
//! Maps LSP method names to their params and result types. Everything on
//! the wire goes through the wrapped [`RpcEndpoint`], so handlers for
//! server-initiated messages can be registered here or on the endpoint.

use crate::error::LspError;
use crate::types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DocumentSymbolParams, DocumentSymbolResponse, GotoResult, Hover, InitializeParams,
    InitializeResult, Location, ReferenceParams, SignatureHelp, SignatureHelpParams,
    TextDocumentPositionParams,
};
use futures_util::future::BoxFuture;
use lspc_rpc::{Incoming, RequestId, ResponseError, RpcEndpoint, RpcError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Client for a single language server.
#[derive(Debug, Clone)]
pub struct LspClient {
    endpoint: RpcEndpoint,
    request_timeout: Option<Duration>,
}

impl LspClient {
    /// Wrap an endpoint. Requests wait indefinitely unless a timeout is set.
    pub fn new(endpoint: RpcEndpoint) -> Self {
        Self {
            endpoint,
            request_timeout: None,
        }
    }

    /// Fail requests that get no response within `timeout`.
    ///
    /// A response that arrives after the deadline no longer matches a
    /// pending call and is reported through the endpoint's error handlers.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// The underlying JSON-RPC endpoint.
    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    async fn request<R>(&self, method: &str, params: impl Serialize) -> Result<R, LspError>
    where
        R: DeserializeOwned,
    {
        let call = self.endpoint.call::<R>(method, params);
        let result = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call).await.map_err(|_| {
                tracing::warn!("'{method}' timed out after {}ms", timeout.as_millis());
                LspError::Timeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            })?,
            None => call.await,
        };
        Ok(result?)
    }

    async fn notify(&self, method: &str, params: impl Serialize) -> Result<(), LspError> {
        Ok(self.endpoint.notify(method, params).await?)
    }

    // -- Lifecycle ----------------------------------------------------------

    pub async fn initialize(&self, params: &InitializeParams) -> Result<InitializeResult, LspError> {
        let result: InitializeResult = self.request("initialize", params).await?;
        if let Some(info) = &result.server_info {
            tracing::info!(
                "Initialized '{}' {}",
                info.name,
                info.version.as_deref().unwrap_or("")
            );
        }
        Ok(result)
    }

    pub async fn initialized(&self) -> Result<(), LspError> {
        self.notify("initialized", ()).await
    }

    /// Ask the server to shut down. Servers answer with `null` or `{}`.
    pub async fn shutdown(&self) -> Result<Value, LspError> {
        self.request("shutdown", ()).await
    }

    pub async fn exit(&self) -> Result<(), LspError> {
        self.notify("exit", ()).await
    }

    // -- Document sync ------------------------------------------------------

    pub async fn did_open(&self, params: &DidOpenTextDocumentParams) -> Result<(), LspError> {
        self.notify("textDocument/didOpen", params).await
    }

    pub async fn did_change(&self, params: &DidChangeTextDocumentParams) -> Result<(), LspError> {
        self.notify("textDocument/didChange", params).await
    }

    pub async fn did_close(&self, params: &DidCloseTextDocumentParams) -> Result<(), LspError> {
        self.notify("textDocument/didClose", params).await
    }

    // -- Language features --------------------------------------------------

    pub async fn document_symbol(
        &self,
        params: &DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>, LspError> {
        self.request("textDocument/documentSymbol", params).await
    }

    pub async fn references(&self, params: &ReferenceParams) -> Result<Option<Vec<Location>>, LspError> {
        self.request("textDocument/references", params).await
    }

    pub async fn definition(
        &self,
        params: &TextDocumentPositionParams,
    ) -> Result<Option<GotoResult>, LspError> {
        self.request("textDocument/definition", params).await
    }

    pub async fn type_definition(
        &self,
        params: &TextDocumentPositionParams,
    ) -> Result<Option<GotoResult>, LspError> {
        self.request("textDocument/typeDefinition", params).await
    }

    pub async fn declaration(
        &self,
        params: &TextDocumentPositionParams,
    ) -> Result<Option<GotoResult>, LspError> {
        self.request("textDocument/declaration", params).await
    }

    pub async fn signature_help(
        &self,
        params: &SignatureHelpParams,
    ) -> Result<Option<SignatureHelp>, LspError> {
        self.request("textDocument/signatureHelp", params).await
    }

    pub async fn hover(&self, params: &TextDocumentPositionParams) -> Result<Option<Hover>, LspError> {
        self.request("textDocument/hover", params).await
    }

    // -- Server-initiated messages ------------------------------------------

    /// Wait for the next message named `method`, e.g.
    /// `textDocument/publishDiagnostics`.
    pub fn once(&self, method: &str) -> BoxFuture<'static, Result<Incoming, RpcError>> {
        self.endpoint.once(method)
    }

    /// Handle server requests named `method`. The handler gets the params
    /// and the id to pass to [`respond_to_server_request`](Self::respond_to_server_request).
    pub fn on_request<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>, RequestId) + Send + Sync + 'static,
    {
        self.endpoint.on_request(method, move |incoming: &Incoming| {
            if let Some(id) = &incoming.id {
                handler(incoming.params.clone(), id.clone());
            }
        });
    }

    /// Handle server notifications named `method`.
    pub fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.endpoint.on_notification(method, move |incoming: &Incoming| {
            handler(incoming.params.clone());
        });
    }

    pub async fn respond_to_server_request(
        &self,
        id: RequestId,
        result: impl Serialize,
    ) -> Result<(), LspError> {
        Ok(self.endpoint.respond(id, result).await?)
    }

    pub async fn reject_server_request(
        &self,
        id: RequestId,
        error: ResponseError,
    ) -> Result<(), LspError> {
        Ok(self.endpoint.respond_error(id, error).await?)
    }
}
