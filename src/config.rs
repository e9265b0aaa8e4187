//! Server configuration
//!
//! Everything is sourced from the environment; defaults are resolved here
//! rather than at call sites.

use std::time::Duration;

/// Runtime configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address
    pub server_addr: String,
    /// Root directory for persisted state (sqlite database lives here)
    pub data_dir: String,
    /// Default sandbox image
    pub docker_image: String,
    /// Shared docker network joined by every sandbox (empty = default bridge)
    pub docker_network: String,
    /// Base KEY=VALUE env injected into every sandbox
    pub sandbox_env: Vec<String>,
    /// Maximum revision rounds per sub-task
    pub max_revisions: u32,
    /// Upper bound on decompose output
    pub max_sub_tasks: usize,
    /// Chat-session idle lifetime
    pub chat_idle_timeout: Duration,
    /// Per-chat-session user message cap
    pub chat_max_messages: i64,
    /// Default coding agent name ("" or "auto" = entrypoint auto-detect)
    pub coding_agent: String,
    /// Shared secret for GitHub webhook HMAC verification
    pub webhook_secret: String,
    /// Number of pre-warmed sandboxes to keep idle (0 disables the pool)
    pub pool_size: usize,
    /// Interval between pool refill passes
    pub pool_refill_interval: Duration,
    /// GitHub API token (also forwarded into sandboxes)
    pub github_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:8080".to_string(),
            data_dir: default_data_dir(),
            docker_image: "telecoder-sandbox:latest".to_string(),
            docker_network: String::new(),
            sandbox_env: Vec::new(),
            max_revisions: 1,
            max_sub_tasks: 5,
            chat_idle_timeout: Duration::from_secs(30 * 60),
            chat_max_messages: 50,
            coding_agent: String::new(),
            webhook_secret: String::new(),
            pool_size: 0,
            pool_refill_interval: Duration::from_secs(30),
            github_token: String::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            server_addr: env_or("TELECODER_ADDR", defaults.server_addr),
            data_dir: env_or("TELECODER_DATA_DIR", defaults.data_dir),
            docker_image: env_or("TELECODER_DOCKER_IMAGE", defaults.docker_image),
            docker_network: env_or("TELECODER_DOCKER_NETWORK", defaults.docker_network),
            sandbox_env: parse_env_list(
                &std::env::var("TELECODER_SANDBOX_ENV").unwrap_or_default(),
            ),
            max_revisions: env_parsed("TELECODER_MAX_REVISIONS", defaults.max_revisions),
            max_sub_tasks: env_parsed("TELECODER_MAX_SUBTASKS", defaults.max_sub_tasks),
            chat_idle_timeout: Duration::from_secs(env_parsed(
                "TELECODER_CHAT_IDLE_TIMEOUT",
                defaults.chat_idle_timeout.as_secs(),
            )),
            chat_max_messages: env_parsed("TELECODER_CHAT_MAX_MESSAGES", defaults.chat_max_messages),
            coding_agent: env_or("TELECODER_CODING_AGENT", defaults.coding_agent),
            webhook_secret: env_or("TELECODER_WEBHOOK_SECRET", defaults.webhook_secret),
            pool_size: env_parsed("TELECODER_POOL_SIZE", defaults.pool_size),
            pool_refill_interval: Duration::from_secs(env_parsed(
                "TELECODER_POOL_REFILL_INTERVAL",
                defaults.pool_refill_interval.as_secs(),
            )),
            github_token: env_or("GITHUB_TOKEN", defaults.github_token),
        }
    }
}

fn default_data_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{home}/.telecoder")
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated KEY=VALUE list. Entries without `=` are skipped.
fn parse_env_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| {
            if entry.is_empty() {
                return false;
            }
            if !entry.contains('=') {
                tracing::warn!(entry, "Ignoring sandbox env entry without KEY=VALUE shape");
                return false;
            }
            true
        })
        .map(String::from)
        .collect()
}
