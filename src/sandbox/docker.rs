//! Docker-CLI-backed sandbox runtime
//!
//! Shells out to `docker` rather than speaking the daemon API: the
//! orchestrator only needs run/exec/logs/wait/rm, and the CLI keeps the
//! dependency surface to a child process.

use super::{LogStream, SandboxError, SandboxResult, SandboxRuntime, StartOptions};
use async_trait::async_trait;
use rand::Rng;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

const LOG_CHANNEL_CAPACITY: usize = 256;

pub struct DockerRuntime {
    docker_bin: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }

    async fn docker_output(&self, args: &[String]) -> SandboxResult<std::process::Output> {
        Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SandboxError::Spawn {
                command: format!("{} {}", self.docker_bin, args.join(" ")),
                source: e,
            })
    }

    /// Run a docker command, failing on non-zero exit with combined output.
    async fn docker_checked(&self, args: &[String]) -> SandboxResult<String> {
        let output = self.docker_output(args).await?;
        let combined = combine_output(&output);
        if output.status.success() {
            Ok(combined)
        } else {
            Err(SandboxError::CommandFailed {
                exit_code: i64::from(output.status.code().unwrap_or(-1)),
                output: combined,
            })
        }
    }

    /// Spawn a docker command and pump its stdout lines into a channel.
    /// The child is killed when the receiver (and thus the pump) goes away.
    fn spawn_line_stream(&self, args: Vec<String>) -> SandboxResult<LogStream> {
        let mut child = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                command: format!("{} {}", self.docker_bin, args.join(" ")),
                source: e,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            // Keep the child alive for the duration of the pump; dropping
            // it here would kill the process mid-stream.
            let _child = child;

            let stderr_tx = tx.clone();
            let stderr_pump = stderr.map(|err| {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(err).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if stderr_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                })
            });

            if let Some(out) = stdout {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }

            if let Some(pump) = stderr_pump {
                let _ = pump.await;
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn start(&self, options: &StartOptions) -> SandboxResult<String> {
        let suffix: u32 = rand::thread_rng().gen_range(0x1000..0xffff);
        let name = format!("telecoder-{}-{suffix:x}", options.session_id);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name,
            "--label".into(),
            "telecoder=1".into(),
        ];

        if !options.network.is_empty() {
            args.push("--network".into());
            args.push(options.network.clone());
        }

        for entry in sandbox_env(options) {
            args.push("-e".into());
            args.push(entry);
        }

        if options.persistent {
            // Hold the container open; work arrives through `exec`.
            args.push("--entrypoint".into());
            args.push("sleep".into());
            args.push(options.image.clone());
            args.push("infinity".into());
        } else {
            args.push(options.image.clone());
        }

        let stdout = self.docker_checked(&args).await?;
        let container_id = stdout
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        if container_id.is_empty() {
            return Err(SandboxError::Other("docker run returned no container id".into()));
        }

        tracing::info!(
            session_id = %options.session_id,
            container_id = %container_id,
            image = %options.image,
            persistent = options.persistent,
            "Started sandbox"
        );
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str) -> SandboxResult<()> {
        let args: Vec<String> = vec!["rm".into(), "-f".into(), container_id.to_string()];
        match self.docker_checked(&args).await {
            Ok(_) => Ok(()),
            // Already gone counts as stopped
            Err(SandboxError::CommandFailed { output, .. })
                if output.contains("No such container") =>
            {
                Ok(())
            }
            Err(e) => {
                tracing::warn!(container_id, error = %e, "Failed to remove container");
                Ok(())
            }
        }
    }

    async fn wait(&self, container_id: &str) -> SandboxResult<i64> {
        let args: Vec<String> = vec!["wait".into(), container_id.to_string()];
        let stdout = self.docker_checked(&args).await?;
        stdout
            .trim()
            .parse()
            .map_err(|_| SandboxError::Other(format!("unparseable docker wait output: {stdout}")))
    }

    async fn stream_logs(&self, container_id: &str) -> SandboxResult<LogStream> {
        self.spawn_line_stream(vec![
            "logs".into(),
            "-f".into(),
            container_id.to_string(),
        ])
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> SandboxResult<LogStream> {
        let mut args: Vec<String> = vec!["exec".into(), container_id.to_string()];
        args.extend(argv.iter().cloned());
        self.spawn_line_stream(args)
    }

    async fn exec_collect(&self, container_id: &str, argv: &[String]) -> SandboxResult<String> {
        let mut args: Vec<String> = vec!["exec".into(), container_id.to_string()];
        args.extend(argv.iter().cloned());
        self.docker_checked(&args).await
    }

    async fn ensure_network(&self, name: &str) -> SandboxResult<()> {
        let args: Vec<String> = vec!["network".into(), "create".into(), name.to_string()];
        match self.docker_checked(&args).await {
            Ok(_) => Ok(()),
            Err(SandboxError::CommandFailed { output, .. }) if output.contains("already exists") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, container_id: &str) -> bool {
        let args: Vec<String> = vec![
            "inspect".into(),
            "-f".into(),
            "{{.State.Running}}".into(),
            container_id.to_string(),
        ];
        matches!(self.docker_checked(&args).await, Ok(out) if out.trim() == "true")
    }
}

/// Entrypoint contract env plus caller extras.
fn sandbox_env(options: &StartOptions) -> Vec<String> {
    let mut env = vec![
        format!("TELECODER_SESSION_ID={}", options.session_id),
        format!("TELECODER_REPO={}", options.repo),
        format!("TELECODER_PROMPT={}", options.prompt),
        format!("TELECODER_BRANCH={}", options.branch),
    ];
    env.extend(options.env.iter().cloned());
    env
}

fn combine_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.is_empty() {
        stdout.into_owned()
    } else if stdout.is_empty() {
        stderr.into_owned()
    } else {
        format!("{stdout}{stderr}")
    }
}
