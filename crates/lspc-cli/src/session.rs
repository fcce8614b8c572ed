//! One language server session: spawn, handshake, open a document, tear down.

use anyhow::{Context, Result};
use lspc_client::types::{
    ClientInfo, ConfigurationParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    InitializeParams, TextDocumentIdentifier, TextDocumentItem, WorkspaceFolder,
};
use lspc_client::{LspClient, ResponseError, path_to_uri};
use lspc_config::ServerConfig;
use lspc_rpc::ServerProcess;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;

/// Peer requests answered with `null`: acknowledgements the server needs
/// before it makes progress, with nothing for a one-shot client to do.
const ACKNOWLEDGED_REQUESTS: [&str; 2] = ["client/registerCapability", "window/workDoneProgress/create"];

pub struct Session {
    name: String,
    process: ServerProcess,
    client: LspClient,
}

impl Session {
    /// Spawn the server in `root` and complete the initialize handshake.
    pub async fn start(name: &str, server: &ServerConfig, root: &Path) -> Result<Self> {
        let mut process = ServerProcess::spawn(&server.command, &server.args, &server.env, Some(root))
            .with_context(|| format!("Failed to start server '{name}'"))?;
        let client = LspClient::new(process.endpoint().clone())
            .with_request_timeout(Duration::from_millis(server.request_timeout_ms));

        register_handlers(&client);
        process.start()?;

        let session = Self {
            name: name.to_string(),
            process,
            client,
        };
        match session.initialize(root).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.process.shutdown().await;
                Err(e)
            }
        }
    }

    async fn initialize(&self, root: &Path) -> Result<()> {
        let root_uri = path_to_uri(root)?;
        let folder_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root_uri.clone());

        let params = InitializeParams {
            process_id: Some(i64::from(std::process::id())),
            client_info: Some(ClientInfo {
                name: "lspc".into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            }),
            root_uri: Some(root_uri.clone()),
            capabilities: client_capabilities(),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri,
                name: folder_name,
            }]),
            ..Default::default()
        };

        self.client
            .initialize(&params)
            .await
            .with_context(|| format!("Server '{}' failed to initialize", self.name))?;
        self.client.initialized().await?;
        Ok(())
    }

    pub fn client(&self) -> &LspClient {
        &self.client
    }

    pub async fn open(&self, uri: &str, language_id: &str, text: String) -> Result<()> {
        self.client
            .did_open(&DidOpenTextDocumentParams {
                text_document: TextDocumentItem {
                    uri: uri.to_string(),
                    language_id: language_id.to_string(),
                    version: 1,
                    text,
                },
            })
            .await?;
        Ok(())
    }

    /// Close the document and run the shutdown/exit sequence. Failures are
    /// logged: the process is killed regardless.
    pub async fn close(self, uri: &str) {
        let close = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier::new(uri),
        };
        if let Err(e) = self.client.did_close(&close).await {
            tracing::debug!("didClose failed: {e}");
        }
        match self.client.shutdown().await {
            Ok(_) => {
                if let Err(e) = self.client.exit().await {
                    tracing::debug!("exit failed: {e}");
                }
            }
            Err(e) => tracing::warn!("Server '{}' did not shut down cleanly: {e}", self.name),
        }
        self.process.shutdown().await;
    }
}

fn client_capabilities() -> Value {
    json!({
        "textDocument": {
            "synchronization": {"didSave": false, "dynamicRegistration": false},
            "hover": {"contentFormat": ["markdown", "plaintext"]},
            "definition": {"linkSupport": true},
            "typeDefinition": {"linkSupport": true},
            "declaration": {"linkSupport": true},
            "references": {},
            "documentSymbol": {"hierarchicalDocumentSymbolSupport": true},
            "signatureHelp": {"signatureInformation": {"documentationFormat": ["markdown", "plaintext"]}}
        },
        "workspace": {"configuration": true, "workspaceFolders": true},
        "window": {"workDoneProgress": true}
    })
}

/// One `null` per requested item: the server falls back to its own defaults.
fn configuration_reply(params: Option<Value>) -> Vec<Value> {
    let items = params
        .and_then(|p| serde_json::from_value::<ConfigurationParams>(p).ok())
        .map_or(0, |p| p.items.len());
    vec![Value::Null; items]
}

fn register_handlers(client: &LspClient) {
    let responder = client.clone();
    client.on_request("workspace/configuration", move |params, id| {
        let responder = responder.clone();
        let reply = configuration_reply(params);
        tokio::spawn(async move {
            if let Err(e) = responder.respond_to_server_request(id, reply).await {
                tracing::warn!("Failed to answer workspace/configuration: {e}");
            }
        });
    });

    for method in ACKNOWLEDGED_REQUESTS {
        let responder = client.clone();
        client.on_request(method, move |_, id| {
            let responder = responder.clone();
            tokio::spawn(async move {
                if let Err(e) = responder.respond_to_server_request(id, Value::Null).await {
                    tracing::warn!("Failed to acknowledge {method}: {e}");
                }
            });
        });
    }

    let rejecter = client.clone();
    client.endpoint().on_unhandled_request(move |incoming| {
        let Some(id) = incoming.id.clone() else {
            return;
        };
        tracing::debug!("Rejecting unsupported server request '{}'", incoming.method);
        let error = ResponseError::method_not_found(&incoming.method);
        let rejecter = rejecter.clone();
        tokio::spawn(async move {
            if let Err(e) = rejecter.reject_server_request(id, error).await {
                tracing::warn!("Failed to reject server request: {e}");
            }
        });
    });

    client.on_notification("window/logMessage", |params| {
        if let Some(message) = params.as_ref().and_then(|p| p["message"].as_str()) {
            tracing::debug!("server: {message}");
        }
    });

    client.endpoint().on_error(|e| tracing::warn!("{e}"));
}
