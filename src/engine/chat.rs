//! Chat-mode execution
//!
//! One persistent sandbox per session. Each user message is executed in
//! it, the collected output becomes the assistant reply, and PR creation
//! is an explicit user action rather than the automatic endpoint of a run.

use super::{Engine, EngineError, EngineResult};
use crate::db::{EventType, MessageRole, Session, SessionMode, SessionResult, SessionStatus};
use crate::git::CreatePrOptions;
use serde_json::json;

const WORKSPACE: &str = "/workspace";
const SETUP_SCRIPT: &str = "/setup.sh";

impl Engine {
    /// Background initialization for a freshly created chat session:
    /// start the persistent sandbox, run setup, and become idle.
    pub(super) async fn init_chat_session(&self, mut session: Session) {
        let agent = self.resolve_agent_name(&session.agent);
        let options = self.start_options(&session, &session.prompt, &agent, true);

        let container_id = match self.sandbox.start(&options).await {
            Ok(container_id) => container_id,
            Err(e) => {
                self.fail_session(&mut session, format!("failed to start sandbox: {e}"));
                return;
            }
        };
        session.container_id = container_id.clone();
        self.set_status(&mut session, SessionStatus::Running);

        if let Err(e) = self
            .sandbox
            .exec_collect(&container_id, &[
                "sh".to_string(),
                SETUP_SCRIPT.to_string(),
            ])
            .await
        {
            let _ = self.sandbox.stop(&container_id).await;
            self.fail_session(&mut session, format!("workspace setup failed: {e}"));
            return;
        }

        self.set_status(&mut session, SessionStatus::Idle);
        tracing::info!(session_id = %session.id, "Chat session ready");
    }

    /// Accept a user message. The session must be idle (one message in
    /// flight at a time) and under the message cap; processing happens in
    /// a background worker.
    pub fn send_chat_message(&self, id: &str, content: &str) -> EngineResult<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::Validation("message is required".to_string()));
        }

        let mut session = self.get_session(id)?;
        if session.mode != SessionMode::Chat {
            return Err(EngineError::Validation(
                "session is not a chat session".to_string(),
            ));
        }
        match session.status {
            SessionStatus::Idle => {}
            SessionStatus::Running | SessionStatus::Pending => {
                return Err(EngineError::Conflict(
                    "session is busy, wait for the current message".to_string(),
                ));
            }
            _ => {
                return Err(EngineError::Conflict("session has ended".to_string()));
            }
        }
        if self.db.count_user_messages(id)? >= self.config.chat_max_messages {
            return Err(EngineError::Validation(
                "chat message limit reached".to_string(),
            ));
        }

        self.db.add_message(id, MessageRole::User, content)?;
        self.set_status(&mut session, SessionStatus::Running);

        let engine = self.clone();
        let text = content.to_string();
        self.tracker.spawn(async move {
            engine.process_chat_message(session, text).await;
        });
        Ok(())
    }

    async fn process_chat_message(&self, mut session: Session, text: String) {
        let agent = self.resolve_agent_name(&session.agent);
        let output = self
            .exec_agent(&session.id, &session.container_id, &agent, &text)
            .await;

        let reply = if output.is_empty() {
            "(the agent produced no output)".to_string()
        } else {
            output.join("\n")
        };
        if let Err(e) = self
            .db
            .add_message(&session.id, MessageRole::Assistant, &reply)
        {
            tracing::error!(session_id = %session.id, error = %e, "Failed to persist assistant message");
        }

        self.set_status(&mut session, SessionStatus::Idle);
    }

    /// Explicit PR creation from a chat session: commit and push whatever
    /// is in the workspace, open the PR, and complete the session.
    pub async fn create_pr_from_chat(&self, id: &str) -> EngineResult<Session> {
        let mut session = self.get_session(id)?;
        if session.mode != SessionMode::Chat {
            return Err(EngineError::Validation(
                "session is not a chat session".to_string(),
            ));
        }
        if session.status != SessionStatus::Idle {
            return Err(EngineError::Conflict(
                "session must be idle to create a PR".to_string(),
            ));
        }

        let container_id = session.container_id.clone();
        let git = |args: &[&str]| {
            let mut argv = vec!["git".to_string(), "-C".to_string(), WORKSPACE.to_string()];
            argv.extend(args.iter().map(|s| s.to_string()));
            argv
        };

        self.sandbox
            .exec_collect(&container_id, &git(&["add", "-A"]))
            .await
            .map_err(|e| EngineError::Internal(format!("git add failed: {e}")))?;

        let message = format!("TeleCoder chat session {}", session.id);
        if let Err(e) = self
            .sandbox
            .exec_collect(&container_id, &git(&["commit", "-m", &message]))
            .await
        {
            match e {
                crate::sandbox::SandboxError::CommandFailed { ref output, .. }
                    if output.contains("nothing to commit") =>
                {
                    // Fine if earlier messages already committed; push below
                    // still needs something on the branch
                }
                other => {
                    return Err(EngineError::Internal(format!("git commit failed: {other}")))
                }
            }
        }

        self.sandbox
            .exec_collect(
                &container_id,
                &git(&["push", "-u", "origin", &session.branch]),
            )
            .await
            .map_err(|e| EngineError::Internal(format!("failed to push branch: {e}")))?;

        let base = self
            .git
            .get_default_branch(&session.repo)
            .await
            .unwrap_or_else(|_| "main".to_string());
        let options = CreatePrOptions {
            repo: session.repo.clone(),
            branch: session.branch.clone(),
            base,
            title: format!("TeleCoder chat session {}", session.id),
            body: chat_pr_body(self, &session),
        };
        let (pr_url, pr_number) = self
            .git
            .create_pr(&options)
            .await
            .map_err(|e| EngineError::Internal(format!("failed to create pull request: {e}")))?;

        session.set_result(SessionResult::Pr { pr_url, pr_number });
        session.status = SessionStatus::Complete;
        self.db.update_session(&session)?;
        self.emit(
            &session.id,
            EventType::Done,
            json!({"result": session.result}),
        );

        let _ = self.sandbox.stop(&container_id).await;
        self.bus.remove_session(&session.id);
        tracing::info!(session_id = %session.id, "Chat session published as PR");
        Ok(session)
    }
}

/// Summarize the conversation for the PR description.
fn chat_pr_body(engine: &Engine, session: &Session) -> String {
    let mut body = format!("{}\n\n## Conversation\n", super::PR_BODY_HEADER);
    if let Ok(messages) = engine.db.get_messages(&session.id) {
        for message in messages.iter().filter(|m| m.role == MessageRole::User) {
            let first_line = message.content.lines().next().unwrap_or_default();
            body.push_str("- ");
            body.push_str(first_line);
            body.push('\n');
        }
    }
    body
}
