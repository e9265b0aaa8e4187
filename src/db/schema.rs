//! Database schema and core record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    repo TEXT NOT NULL,
    prompt TEXT NOT NULL,
    agent TEXT NOT NULL DEFAULT '',
    mode TEXT NOT NULL DEFAULT 'task',
    status TEXT NOT NULL DEFAULT 'pending',
    branch TEXT NOT NULL DEFAULT '',
    container_id TEXT NOT NULL DEFAULT '',
    result TEXT,
    pr_url TEXT NOT NULL DEFAULT '',
    pr_number INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_repo_pr ON sessions(repo, pr_number);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
"#;

/// One-shot task vs persistent chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Task,
    Chat,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Task => write!(f, "task"),
            SessionMode::Chat => write!(f, "chat"),
        }
    }
}

impl SessionMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "chat" => SessionMode::Chat,
            _ => SessionMode::Task,
        }
    }
}

/// Session lifecycle status. `Idle` applies only to chat sessions
/// awaiting a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Pending,
    Running,
    Idle,
    Complete,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Complete => "complete",
            SessionStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl SessionStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => SessionStatus::Running,
            "idle" => SessionStatus::Idle,
            "complete" => SessionStatus::Complete,
            "error" => SessionStatus::Error,
            _ => SessionStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Complete | SessionStatus::Error)
    }
}

/// Outcome of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionResult {
    #[default]
    None,
    Pr { pr_url: String, pr_number: u64 },
    Text { content: String },
}

impl SessionResult {
    pub fn is_none(&self) -> bool {
        matches!(self, SessionResult::None)
    }
}

/// Session record
///
/// `pr_url`/`pr_number` duplicate the `result` payload at the top level;
/// older clients read those fields directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub repo: String,
    pub prompt: String,
    #[serde(default)]
    pub agent: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub branch: String,
    #[serde(default)]
    pub container_id: String,
    pub result: SessionResult,
    #[serde(default)]
    pub pr_url: String,
    #[serde(default)]
    pub pr_number: u64,
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: &str, repo: &str, prompt: &str, agent: &str, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            repo: repo.to_string(),
            prompt: prompt.to_string(),
            agent: agent.to_string(),
            mode,
            status: SessionStatus::Pending,
            branch: format!("telecoder/{id}"),
            container_id: String::new(),
            result: SessionResult::None,
            pr_url: String::new(),
            pr_number: 0,
            error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the result, keeping the legacy top-level PR fields in sync.
    pub fn set_result(&mut self, result: SessionResult) {
        if let SessionResult::Pr { pr_url, pr_number } = &result {
            self.pr_url = pr_url.clone();
            self.pr_number = *pr_number;
        }
        self.result = result;
    }
}

/// Event stream entry. Append-only; `id` is store-assigned and
/// monotonically increasing, which permits resume-from-offset streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: i64,
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Status,
    Output,
    Error,
    Done,
    Step,
    Progress,
    Result,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Status => "status",
            EventType::Output => "output",
            EventType::Error => "error",
            EventType::Done => "done",
            EventType::Step => "step",
            EventType::Progress => "progress",
            EventType::Result => "result",
        };
        write!(f, "{s}")
    }
}

impl EventType {
    pub fn parse(s: &str) -> Self {
        match s {
            "output" => EventType::Output,
            "error" => EventType::Error,
            "done" => EventType::Done,
            "step" => EventType::Step,
            "progress" => EventType::Progress,
            "result" => EventType::Result,
            _ => EventType::Status,
        }
    }
}

/// Chat message (chat-mode sessions only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

impl MessageRole {
    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}
