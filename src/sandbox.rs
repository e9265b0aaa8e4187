//! Sandbox runtime abstraction
//!
//! Isolated, ephemeral execution environments for the coding agent. The
//! production implementation drives the `docker` CLI; tests substitute a
//! scripted mock behind the same trait.

mod docker;
pub mod pool;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command exited with code {exit_code}: {output}")]
    CommandFailed { exit_code: i64, output: String },
    #[error("Container not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Stream of stdout+stderr lines from a container or exec'd command.
/// Ends when the process exits or the receiver is dropped.
pub type LogStream = mpsc::Receiver<String>;

/// Options for starting a sandbox
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub session_id: String,
    pub repo: String,
    pub prompt: String,
    pub branch: String,
    pub image: String,
    /// Extra KEY=VALUE entries beyond the session metadata
    pub env: Vec<String>,
    /// Docker network to join (empty = default bridge)
    pub network: String,
    /// Persistent sandboxes idle awaiting `exec`; non-persistent ones run
    /// an entrypoint that self-terminates after its work is done.
    pub persistent: bool,
}

/// Lifecycle of isolated execution environments
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create and start an environment, returning its handle.
    async fn start(&self, options: &StartOptions) -> SandboxResult<String>;

    /// Terminate and remove. Idempotent: stopping an already-gone
    /// container succeeds.
    async fn stop(&self, container_id: &str) -> SandboxResult<()>;

    /// Block until the environment exits; returns the exit code.
    async fn wait(&self, container_id: &str) -> SandboxResult<i64>;

    /// Stdout+stderr lines until the environment exits.
    async fn stream_logs(&self, container_id: &str) -> SandboxResult<LogStream>;

    /// Run a command inside; yields output lines.
    async fn exec(&self, container_id: &str, argv: &[String]) -> SandboxResult<LogStream>;

    /// Run a command inside, returning full combined output. Non-zero exit
    /// maps to `SandboxError::CommandFailed` carrying the output.
    async fn exec_collect(&self, container_id: &str, argv: &[String]) -> SandboxResult<String>;

    /// Idempotent network creation.
    async fn ensure_network(&self, name: &str) -> SandboxResult<()>;

    /// Liveness probe (used by the pool's refill pass).
    async fn is_running(&self, container_id: &str) -> bool;
}

#[async_trait]
impl<T: SandboxRuntime + ?Sized> SandboxRuntime for Arc<T> {
    async fn start(&self, options: &StartOptions) -> SandboxResult<String> {
        (**self).start(options).await
    }

    async fn stop(&self, container_id: &str) -> SandboxResult<()> {
        (**self).stop(container_id).await
    }

    async fn wait(&self, container_id: &str) -> SandboxResult<i64> {
        (**self).wait(container_id).await
    }

    async fn stream_logs(&self, container_id: &str) -> SandboxResult<LogStream> {
        (**self).stream_logs(container_id).await
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> SandboxResult<LogStream> {
        (**self).exec(container_id, argv).await
    }

    async fn exec_collect(&self, container_id: &str, argv: &[String]) -> SandboxResult<String> {
        (**self).exec_collect(container_id, argv).await
    }

    async fn ensure_network(&self, name: &str) -> SandboxResult<()> {
        (**self).ensure_network(name).await
    }

    async fn is_running(&self, container_id: &str) -> bool {
        (**self).is_running(container_id).await
    }
}
