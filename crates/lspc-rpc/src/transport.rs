//! Stdio transport for language server processes.
//!
//! Spawns a child process and wires its stdin/stdout into an [`RpcEndpoint`].

use crate::endpoint::RpcEndpoint;
use crate::error::RpcError;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// How long `shutdown` waits for the child to exit before killing it.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A running server process and the endpoint talking to it.
pub struct ServerProcess {
    command: String,
    endpoint: RpcEndpoint,
    stdout: Option<ChildStdout>,
    reader_handle: Option<JoinHandle<()>>,
    child: Child,
}

impl ServerProcess {
    /// Spawn `command` with piped stdin/stdout.
    ///
    /// Nothing is read from the server until [`start`](Self::start), so
    /// handlers can be registered on [`endpoint`](Self::endpoint) first.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, RpcError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| RpcError::SpawnFailed {
            command: command.to_string(),
            source: e,
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RpcError::SpawnFailed {
                command: command.to_string(),
                source: std::io::Error::other("child stdio was not piped"),
            });
        };

        tracing::info!("Spawned server '{}' (pid {:?})", command, child.id());

        Ok(Self {
            command: command.to_string(),
            endpoint: RpcEndpoint::new(stdin),
            stdout: Some(stdout),
            reader_handle: None,
            child,
        })
    }

    /// Begin reading the server's stdout.
    pub fn start(&mut self) -> Result<(), RpcError> {
        let stdout = self.stdout.take().ok_or(RpcError::AlreadyAttached)?;
        self.reader_handle = Some(self.endpoint.attach(stdout)?);
        Ok(())
    }

    /// The endpoint connected to the server.
    pub fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    /// The OS process id, if the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Close the connection, give the child a grace period to exit, then kill it.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.endpoint.close().await {
            tracing::debug!("Closing stdin of '{}' failed: {e}", self.command);
        }

        match tokio::time::timeout(EXIT_GRACE_PERIOD, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("Server '{}' exited with {status}", self.command),
            Ok(Err(e)) => tracing::warn!("Waiting for server '{}' failed: {e}", self.command),
            Err(_) => {
                tracing::warn!("Server '{}' did not exit; killing it", self.command);
                let _ = self.child.kill().await;
            }
        }

        if let Some(handle) = self.reader_handle.take() {
            handle.abort();
        }
    }
}
