//! lspc CLI: ask a language server about one file and print the answer as JSON.

mod session;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use lspc_client::types::{
    DocumentSymbolParams, Position, ReferenceContext, ReferenceParams, TextDocumentIdentifier,
    TextDocumentPositionParams,
};
use lspc_client::{LspClient, path_to_uri};
use lspc_config::{CliOverrides, LspcConfig};
use serde_json::Value;
use session::Session;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "lspc", version, about = "Query a language server from the command line")]
struct Cli {
    /// Extra config file, layered above ./.lspc.toml and ~/.lspc/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server to use (defaults to the one configured for the file's extension)
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the symbols defined in a file
    Symbols { file: PathBuf },
    /// Show hover information at a position
    Hover(PositionArgs),
    /// Find where the symbol at a position is defined
    Definition(PositionArgs),
    /// Find references to the symbol at a position
    References {
        #[command(flatten)]
        position: PositionArgs,

        /// Include the declaration itself in the results
        #[arg(long)]
        include_declaration: bool,
    },
}

#[derive(Args)]
struct PositionArgs {
    file: PathBuf,
    /// Zero-based line
    line: u32,
    /// Zero-based UTF-16 character offset
    character: u32,
}

impl PositionArgs {
    fn params(&self, uri: &str) -> TextDocumentPositionParams {
        TextDocumentPositionParams::new(uri, Position::new(self.line, self.character))
    }
}

impl Command {
    fn file(&self) -> &Path {
        match self {
            Command::Symbols { file } => file,
            Command::Hover(pos) | Command::Definition(pos) => &pos.file,
            Command::References { position, .. } => &position.file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        config_file: cli.config.clone(),
        log_level: cli.verbose.then(|| "debug".to_string()),
        log_json: cli.log_json.then_some(true),
    };

    // Config warnings are emitted before the configured subscriber exists.
    let bootstrap = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let config = tracing::subscriber::with_default(bootstrap, || LspcConfig::load(overrides))?;

    init_logging(&config.log_level, config.log_json);

    let output = run(&cli, &config).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: &Cli, config: &LspcConfig) -> Result<Value> {
    let file = cli.command.file();
    let (name, server) = match &cli.server {
        Some(name) => (name.as_str(), config.server(name)?),
        None => config.server_for_path(file).with_context(|| {
            format!(
                "No server configured for {}; pass --server or add its extension to a server's `extensions`",
                file.display()
            )
        })?,
    };

    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let uri = path_to_uri(file)?;
    let root = std::env::current_dir().context("Failed to determine the working directory")?;

    tracing::info!("Using server '{name}' ({}) for {uri}", server.command);
    let session = Session::start(name, server, &root).await?;

    let result = async {
        session.open(&uri, server.language_id(name), text).await?;
        query(session.client(), &cli.command, &uri).await
    }
    .await;

    session.close(&uri).await;
    result
}

async fn query(client: &LspClient, command: &Command, uri: &str) -> Result<Value> {
    let value = match command {
        Command::Symbols { .. } => {
            let params = DocumentSymbolParams {
                text_document: TextDocumentIdentifier::new(uri),
            };
            serde_json::to_value(client.document_symbol(&params).await?)?
        }
        Command::Hover(pos) => serde_json::to_value(client.hover(&pos.params(uri)).await?)?,
        Command::Definition(pos) => {
            serde_json::to_value(client.definition(&pos.params(uri)).await?)?
        }
        Command::References {
            position,
            include_declaration,
        } => {
            let params = ReferenceParams {
                text_document: TextDocumentIdentifier::new(uri),
                position: Position::new(position.line, position.character),
                context: ReferenceContext {
                    include_declaration: *include_declaration,
                },
            };
            serde_json::to_value(client.references(&params).await?)?
        }
    };
    Ok(value)
}
