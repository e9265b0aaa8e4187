//! Session orchestration engine
//!
//! Drives sessions end to end: decompose, plan, execute in a sandbox,
//! verify, review, publish. Owns every in-flight background worker; the
//! collaborators (store, bus, sandbox runtime, git provider, LLM stages)
//! are injected so the whole engine runs against mocks in tests.

mod chat;
pub mod markers;
mod run;
#[cfg(test)]
pub mod testing;
#[cfg(test)]
mod tests;

use crate::bus::EventBus;
use crate::config::Config;
use crate::db::{
    ChatMessage, Database, DbError, EventType, Session, SessionEvent, SessionMode, SessionStatus,
};
use crate::git::GitProvider;
use crate::pipeline::Stages;
use crate::sandbox::SandboxRuntime;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use run::PrCommentEvent;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT_ERROR: &str = "session timed out due to inactivity";
pub(crate) const PR_BODY_HEADER: &str = "Automated change by TeleCoder.";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

fn db_err(e: DbError) -> EngineError {
    match e {
        DbError::SessionNotFound(id) => EngineError::NotFound(id),
        other => EngineError::Db(other),
    }
}

/// Optional prompt-enrichment source consulted before decomposition.
#[async_trait]
pub trait Memory: Send + Sync {
    /// Notes relevant to the repo and prompt, if any.
    async fn recall(&self, repo: &str, prompt: &str) -> Option<String>;
}

/// File-backed memory: operators drop Markdown notes per repository under
/// `<data_dir>/notes/<owner>__<name>.md` and every session on that repo
/// picks them up.
pub struct RepoNotesMemory {
    dir: PathBuf,
}

const NOTES_LIMIT: usize = 4 * 1024;

impl RepoNotesMemory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl Memory for RepoNotesMemory {
    async fn recall(&self, repo: &str, _prompt: &str) -> Option<String> {
        let path = self.dir.join(format!("{}.md", repo.replace('/', "__")));
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(trimmed.chars().take(NOTES_LIMIT).collect())
    }
}

/// Cheap-clone handle: clones share the store, bus, collaborators,
/// cancellation token, and task tracker.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    bus: Arc<EventBus>,
    sandbox: Arc<dyn SandboxRuntime>,
    git: Arc<dyn GitProvider>,
    stages: Stages,
    config: Config,
    memory: Option<Arc<dyn Memory>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Engine {
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        sandbox: Arc<dyn SandboxRuntime>,
        git: Arc<dyn GitProvider>,
        stages: Stages,
        config: Config,
    ) -> Self {
        Self {
            db,
            bus,
            sandbox,
            git,
            stages,
            config,
            memory: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn the long-lived background workers (the idle-chat reaper).
    pub fn start(&self) {
        let engine = self.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(REAPER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    _ = ticker.tick() => engine.reap_idle_chats_once().await,
                }
            }
        });
    }

    /// Initiate shutdown and wait for every in-flight worker. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    // ==================== Session Lifecycle ====================

    /// Create a session and kick off its background worker.
    pub fn create_session(
        &self,
        repo: &str,
        prompt: &str,
        agent: &str,
        mode: SessionMode,
    ) -> EngineResult<Session> {
        let repo = repo.trim();
        let prompt = prompt.trim();

        if repo.is_empty() || !repo.contains('/') {
            return Err(EngineError::Validation(
                "repo must be in owner/name form".to_string(),
            ));
        }
        if mode == SessionMode::Task && prompt.is_empty() {
            return Err(EngineError::Validation("prompt is required".to_string()));
        }

        let id = new_session_id();
        let session = Session::new(&id, repo, prompt, agent.trim(), mode);
        self.db.create_session(&session)?;

        tracing::info!(
            session_id = %session.id,
            repo = %session.repo,
            mode = %session.mode,
            "Created session"
        );

        let engine = self.clone();
        let worker_session = session.clone();
        self.tracker.spawn(async move {
            match worker_session.mode {
                SessionMode::Task => engine.run_task_session(worker_session).await,
                SessionMode::Chat => engine.init_chat_session(worker_session).await,
            }
        });

        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> EngineResult<Session> {
        self.db.get_session(id).map_err(db_err)
    }

    pub fn list_sessions(&self) -> EngineResult<Vec<Session>> {
        self.db.list_sessions().map_err(EngineError::from)
    }

    pub fn get_events(&self, session_id: &str, after_id: i64) -> EngineResult<Vec<SessionEvent>> {
        self.db
            .get_events(session_id, after_id)
            .map_err(EngineError::from)
    }

    pub fn get_messages(&self, session_id: &str) -> EngineResult<Vec<ChatMessage>> {
        self.db.get_messages(session_id).map_err(EngineError::from)
    }

    pub fn get_session_by_pr(&self, repo: &str, pr_number: u64) -> EngineResult<Session> {
        self.db.get_session_by_pr(repo, pr_number).map_err(db_err)
    }

    /// Live event subscription for a session.
    pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<SessionEvent> {
        self.bus.subscribe(session_id)
    }

    /// External stop request: kill the active container, fail the session.
    pub async fn stop_session(&self, id: &str) -> EngineResult<()> {
        let mut session = self.get_session(id)?;
        if session.status.is_terminal() {
            return Err(EngineError::Conflict("session already finished".to_string()));
        }

        if !session.container_id.is_empty() {
            let _ = self.sandbox.stop(&session.container_id).await;
        }
        self.fail_session(&mut session, "stopped by user".to_string());
        Ok(())
    }

    // ==================== Agent Resolution ====================

    /// Per-session override wins, then the configured default; "auto" and
    /// "" both mean the entrypoint auto-detects from available API keys.
    pub fn resolve_agent_name(&self, session_agent: &str) -> String {
        if !session_agent.is_empty() && session_agent != "auto" {
            return session_agent.to_string();
        }
        if !self.config.coding_agent.is_empty() && self.config.coding_agent != "auto" {
            return self.config.coding_agent.clone();
        }
        String::new()
    }

    // ==================== Idle Reaper ====================

    /// One reaper pass over chat sessions. Sessions idle past the
    /// configured timeout are failed and their containers stopped.
    pub(crate) async fn reap_idle_chats_once(&self) {
        let sessions = match self.db.list_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!(error = %e, "Reaper could not list sessions");
                return;
            }
        };

        let now = Utc::now();
        for mut session in sessions {
            if session.mode != SessionMode::Chat || session.status != SessionStatus::Idle {
                continue;
            }
            let idle_for = (now - session.updated_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle_for <= self.config.chat_idle_timeout {
                continue;
            }

            tracing::info!(
                session_id = %session.id,
                idle_secs = idle_for.as_secs(),
                "Reaping idle chat session"
            );

            if !session.container_id.is_empty() {
                let _ = self.sandbox.stop(&session.container_id).await;
            }
            self.fail_session(&mut session, IDLE_TIMEOUT_ERROR.to_string());
        }
    }

    // ==================== Event Helpers ====================

    /// Persist an event, then fan it out. The store write comes first so a
    /// subscriber that reconciles against `get_events` never sees a
    /// published event the store doesn't have. If the write fails we still
    /// publish, with a zero id; the session may become inconsistent, which
    /// is an accepted risk.
    pub(crate) fn emit(&self, session_id: &str, event_type: EventType, data: serde_json::Value) {
        let event = match self.db.add_event(session_id, event_type, &data) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    session_id,
                    event_type = %event_type,
                    error = %e,
                    "Failed to persist event, publishing anyway"
                );
                SessionEvent {
                    id: 0,
                    session_id: session_id.to_string(),
                    event_type,
                    data,
                    created_at: Utc::now(),
                }
            }
        };
        self.bus.publish(&event);
    }

    /// Transition a session to terminal error. Persists the state before
    /// publishing the terminal event.
    pub(crate) fn fail_session(&self, session: &mut Session, error: String) {
        tracing::error!(session_id = %session.id, error = %error, "Session failed");
        session.status = SessionStatus::Error;
        session.error = error.clone();
        if let Err(e) = self.db.update_session(session) {
            tracing::error!(session_id = %session.id, error = %e, "Failed to persist failed session");
        }
        self.emit(&session.id, EventType::Error, json!({"error": error}));
        self.emit(&session.id, EventType::Status, json!({"status": "error"}));
        self.bus.remove_session(&session.id);
    }

    /// Persist a status change and emit the matching event.
    pub(crate) fn set_status(&self, session: &mut Session, status: SessionStatus) {
        session.status = status;
        if let Err(e) = self.db.update_session(session) {
            tracing::error!(session_id = %session.id, error = %e, "Failed to persist status change");
        }
        self.emit(
            &session.id,
            EventType::Status,
            json!({"status": status.to_string()}),
        );
    }
}

/// Short opaque session id, unique per process lifetime.
fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
