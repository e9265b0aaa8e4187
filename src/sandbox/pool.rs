//! Pre-warming sandbox pool
//!
//! Keeps `size` idle sandboxes started ahead of demand so a claim returns
//! in milliseconds instead of a cold `docker run`. Pre-warmed containers
//! are started with placeholder session metadata and
//! `TELECODER_WAIT_ENV=/telecoder/run.env`: the entrypoint blocks until
//! that file appears, sources it (overriding the placeholders), then
//! proceeds as if it had been started fresh with the claimer's options.
//! Claiming writes the file; that is the whole reconfiguration step.

use super::{SandboxResult, SandboxRuntime, StartOptions};
use async_trait::async_trait;
use base64::Engine as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Path inside the container the env-wait entrypoint watches.
const RUN_ENV_PATH: &str = "/telecoder/run.env";

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub image: String,
    pub network: String,
    pub refill_interval: Duration,
}

/// Cheap-clone handle: clones share the idle list and cancellation token.
pub struct WarmPool<R: SandboxRuntime> {
    inner: Arc<R>,
    config: PoolConfig,
    idle: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

impl<R: SandboxRuntime> Clone for WarmPool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
            idle: Arc::clone(&self.idle),
            cancel: self.cancel.clone(),
        }
    }
}

impl<R: SandboxRuntime + 'static> WarmPool<R> {
    pub fn new(inner: Arc<R>, config: PoolConfig) -> Self {
        Self {
            inner,
            config,
            idle: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the background refill loop. Runs until `shutdown`.
    pub fn spawn_refill(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.refill_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = pool.refill_once().await {
                            tracing::warn!(error = %e, "Pool refill pass failed");
                        }
                    }
                }
            }
            tracing::debug!("Pool refill loop stopped");
        });
    }

    /// One refill pass: drop dead idle containers, then top up to size.
    /// Runs concurrently with claims; both contend on the idle list.
    pub async fn refill_once(&self) -> SandboxResult<()> {
        let snapshot: Vec<String> = self.idle.lock().unwrap().clone();
        for container_id in snapshot {
            if !self.inner.is_running(&container_id).await {
                tracing::warn!(container_id = %container_id, "Dropping dead pooled sandbox");
                self.idle.lock().unwrap().retain(|id| id != &container_id);
                let _ = self.inner.stop(&container_id).await;
            }
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.idle_count() >= self.config.size {
                return Ok(());
            }
            let container_id = self.inner.start(&self.warm_options()).await?;
            self.idle.lock().unwrap().push(container_id);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Cancel the refill loop and stop every remaining idle sandbox.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let drained: Vec<String> = std::mem::take(&mut *self.idle.lock().unwrap());
        for container_id in drained {
            let _ = self.inner.stop(&container_id).await;
        }
    }

    fn warm_options(&self) -> StartOptions {
        StartOptions {
            session_id: "warm".to_string(),
            repo: "warm/warm".to_string(),
            prompt: String::new(),
            branch: "warm".to_string(),
            image: self.config.image.clone(),
            env: vec![format!("TELECODER_WAIT_ENV={RUN_ENV_PATH}")],
            network: self.config.network.clone(),
            persistent: false,
        }
    }

    fn claim(&self) -> Option<String> {
        self.idle.lock().unwrap().pop()
    }

    /// Overwrite the placeholder metadata with the claimer's real env.
    /// Content goes through base64 so values never meet shell quoting;
    /// the temp-file rename keeps the entrypoint from reading a partial
    /// file.
    async fn reconfigure(&self, container_id: &str, options: &StartOptions) -> SandboxResult<()> {
        let mut lines = vec![
            format!("export TELECODER_SESSION_ID={}", shell_quote(&options.session_id)),
            format!("export TELECODER_REPO={}", shell_quote(&options.repo)),
            format!("export TELECODER_PROMPT={}", shell_quote(&options.prompt)),
            format!("export TELECODER_BRANCH={}", shell_quote(&options.branch)),
        ];
        for entry in &options.env {
            if let Some((key, value)) = entry.split_once('=') {
                lines.push(format!("export {key}={}", shell_quote(value)));
            }
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(lines.join("\n"));
        let script = format!(
            "mkdir -p /telecoder && printf '%s' '{encoded}' | base64 -d > {RUN_ENV_PATH}.tmp \
             && mv {RUN_ENV_PATH}.tmp {RUN_ENV_PATH}"
        );

        self.inner
            .exec_collect(
                container_id,
                &["sh".to_string(), "-c".to_string(), script],
            )
            .await
            .map(|_| ())
    }

    fn eligible(&self, options: &StartOptions) -> bool {
        self.config.size > 0
            && !options.persistent
            && options.image == self.config.image
            && options.network == self.config.network
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl<R: SandboxRuntime + 'static> SandboxRuntime for WarmPool<R> {
    /// Satisfy from the pool when possible; cold-start otherwise. Under
    /// pressure (idle exhausted, refill pending) claimers never block.
    async fn start(&self, options: &StartOptions) -> SandboxResult<String> {
        if self.eligible(options) {
            while let Some(container_id) = self.claim() {
                match self.reconfigure(&container_id, options).await {
                    Ok(()) => {
                        tracing::info!(
                            session_id = %options.session_id,
                            container_id = %container_id,
                            "Claimed pre-warmed sandbox"
                        );
                        return Ok(container_id);
                    }
                    Err(e) => {
                        tracing::warn!(
                            container_id = %container_id,
                            error = %e,
                            "Reconfiguration failed, discarding pooled sandbox"
                        );
                        let _ = self.inner.stop(&container_id).await;
                    }
                }
            }
        }
        self.inner.start(options).await
    }

    async fn stop(&self, container_id: &str) -> SandboxResult<()> {
        self.inner.stop(container_id).await
    }

    async fn wait(&self, container_id: &str) -> SandboxResult<i64> {
        self.inner.wait(container_id).await
    }

    async fn stream_logs(&self, container_id: &str) -> SandboxResult<super::LogStream> {
        self.inner.stream_logs(container_id).await
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> SandboxResult<super::LogStream> {
        self.inner.exec(container_id, argv).await
    }

    async fn exec_collect(&self, container_id: &str, argv: &[String]) -> SandboxResult<String> {
        self.inner.exec_collect(container_id, argv).await
    }

    async fn ensure_network(&self, name: &str) -> SandboxResult<()> {
        self.inner.ensure_network(name).await
    }

    async fn is_running(&self, container_id: &str) -> bool {
        self.inner.is_running(container_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockSandbox;

    fn pool_with(size: usize, interval_ms: u64) -> (Arc<MockSandbox>, WarmPool<MockSandbox>) {
        let inner = Arc::new(MockSandbox::new());
        let pool = WarmPool::new(
            Arc::clone(&inner),
            PoolConfig {
                size,
                image: "sandbox:latest".to_string(),
                network: String::new(),
                refill_interval: Duration::from_millis(interval_ms),
            },
        );
        (inner, pool)
    }

    fn task_options() -> StartOptions {
        StartOptions {
            session_id: "s1".to_string(),
            repo: "acme/app".to_string(),
            prompt: "do it".to_string(),
            branch: "telecoder/s1".to_string(),
            image: "sandbox:latest".to_string(),
            env: vec!["GITHUB_TOKEN=tok".to_string()],
            network: String::new(),
            persistent: false,
        }
    }

    #[tokio::test]
    async fn test_prewarm_then_claim_skips_inner_start() {
        let (inner, pool) = pool_with(2, 10);
        pool.refill_once().await.unwrap();
        assert_eq!(pool.idle_count(), 2);
        let starts_after_warm = inner.start_count();

        let container_id = pool.start(&task_options()).await.unwrap();
        assert_eq!(pool.idle_count(), 1);
        // The claim consumed a pre-warmed sandbox; no cold start happened
        assert_eq!(inner.start_count(), starts_after_warm);

        // Reconfiguration wrote the claimer's env into the container
        let execs = inner.exec_collect_calls();
        let (target, argv) = execs.last().unwrap();
        assert_eq!(target, &container_id);
        assert!(argv.join(" ").contains("/telecoder/run.env"));
    }

    #[tokio::test]
    async fn test_refill_restores_pool_size() {
        let (_inner, pool) = pool_with(2, 10);
        pool.spawn_refill();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.idle_count(), 2);

        let _ = pool.start(&task_options()).await.unwrap();
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.idle_count(), 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_persistent_and_foreign_image_bypass_pool() {
        let (inner, pool) = pool_with(1, 10);
        pool.refill_once().await.unwrap();
        let warm_starts = inner.start_count();

        let mut persistent = task_options();
        persistent.persistent = true;
        pool.start(&persistent).await.unwrap();

        let mut other_image = task_options();
        other_image.image = "custom:1".to_string();
        pool.start(&other_image).await.unwrap();

        // Both were cold starts; the warm sandbox is untouched
        assert_eq!(inner.start_count(), warm_starts + 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_falls_back_to_cold_start() {
        let (inner, pool) = pool_with(1, 10_000);
        pool.refill_once().await.unwrap();

        let first = pool.start(&task_options()).await.unwrap();
        let starts = inner.start_count();
        let second = pool.start(&task_options()).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(inner.start_count(), starts + 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_sandboxes() {
        let (inner, pool) = pool_with(2, 10);
        pool.refill_once().await.unwrap();
        let idle: Vec<String> = pool.idle.lock().unwrap().clone();

        pool.shutdown().await;
        assert_eq!(pool.idle_count(), 0);
        let stopped = inner.stopped();
        for container_id in idle {
            assert!(stopped.contains(&container_id));
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
