//! Task-mode execution
//!
//! The run loop for one-shot sessions: index, decompose, execute each
//! sub-task in a sandbox with bounded revision rounds, then publish a PR
//! or a text answer.

use super::markers::{self, Marker};
use super::{Engine, EngineResult, PR_BODY_HEADER};
use crate::db::{EventType, Session, SessionMode, SessionResult, SessionStatus};
use crate::git::CreatePrOptions;
use crate::pipeline::{detect_verify_commands, SubTask};
use crate::sandbox::{SandboxError, StartOptions};
use base64::Engine as _;
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;

const WORKSPACE: &str = "/workspace";
const PROGRESS_FILE: &str = "/workspace/.telecoder-progress.json";
const SETUP_SCRIPT: &str = "/setup.sh";
const AGENT_SCRIPT: &str = "/agent.sh";
const PR_TITLE_LIMIT: usize = 72;

/// Result of one sandbox round
pub(super) struct RoundResult {
    pub container_id: String,
    pub exit_code: i64,
    pub last_line: String,
    /// Branch reported by the DONE marker
    pub done_branch: Option<String>,
    /// RESULT marker observed (terminal success without code changes)
    pub text_result: bool,
    /// Non-marker output, for text-result reconstruction
    pub output_lines: Vec<String>,
}

/// What a finished task run hands to finalization
pub(super) struct TaskOutcome {
    pub container_id: String,
    pub kind: OutcomeKind,
}

pub(super) enum OutcomeKind {
    Code { branch: String, body: String },
    Text { content: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    fn glyph(self) -> &'static str {
        match self {
            StepStatus::Completed => "✓",
            StepStatus::Failed => "✗",
            _ => "⏳",
        }
    }
}

#[derive(Clone, Serialize)]
struct SubTaskState {
    title: String,
    description: String,
    status: StepStatus,
    commit_hash: String,
}

/// Reviewer-comment metadata handed in by the webhook channel
#[derive(Debug, Clone)]
pub struct PrCommentEvent {
    pub pr_number: u64,
    pub author: String,
    pub body: String,
    pub path: Option<String>,
}

impl Engine {
    // ==================== Task Run Loop ====================

    pub(super) async fn run_task_session(&self, mut session: Session) {
        self.emit(&session.id, EventType::Progress, json!({"stage": "indexing"}));

        let (repo_context, default_branch) = match self.git.index_repo(&session.repo).await {
            Ok(context) => {
                let branch = if context.default_branch.is_empty() {
                    "main".to_string()
                } else {
                    context.default_branch.clone()
                };
                (context.render(), branch)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    error = %e,
                    "Repository indexing failed, continuing without context"
                );
                let branch = self
                    .git
                    .get_default_branch(&session.repo)
                    .await
                    .unwrap_or_else(|_| "main".to_string());
                (String::new(), branch)
            }
        };

        let mut prompt = session.prompt.clone();
        if let Some(memory) = &self.memory {
            if let Some(notes) = memory.recall(&session.repo, &prompt).await {
                prompt = format!("{prompt}\n\nNotes from previous sessions on this repository:\n{notes}");
            }
        }

        let sub_tasks = self.stages.decompose(&prompt, &repo_context).await;
        self.emit(
            &session.id,
            EventType::Progress,
            json!({"stage": "decompose", "sub_tasks": sub_tasks.len()}),
        );

        let outcome = if sub_tasks.len() == 1 {
            self.run_sub_task(
                &mut session,
                &sub_tasks[0].description,
                &repo_context,
                &default_branch,
            )
            .await
        } else {
            self.run_multi_step(&mut session, &sub_tasks, &default_branch).await
        };

        match outcome {
            Ok(outcome) => self.finalize_task(&mut session, outcome, &default_branch).await,
            Err(error) => {
                if !session.container_id.is_empty() {
                    let _ = self.sandbox.stop(&session.container_id).await;
                }
                self.fail_session(&mut session, error);
            }
        }
    }

    async fn finalize_task(
        &self,
        session: &mut Session,
        outcome: TaskOutcome,
        default_branch: &str,
    ) {
        match outcome.kind {
            OutcomeKind::Text { content } => {
                session.set_result(SessionResult::Text { content });
                session.status = SessionStatus::Complete;
                if let Err(e) = self.db.update_session(session) {
                    tracing::error!(session_id = %session.id, error = %e, "Failed to persist completed session");
                }
                self.emit(
                    &session.id,
                    EventType::Done,
                    json!({"result": session.result}),
                );
            }
            OutcomeKind::Code { branch, body } => {
                let options = CreatePrOptions {
                    repo: session.repo.clone(),
                    branch,
                    base: default_branch.to_string(),
                    title: pr_title(&session.prompt),
                    body,
                };
                match self.git.create_pr(&options).await {
                    Ok((pr_url, pr_number)) => {
                        session.set_result(SessionResult::Pr { pr_url, pr_number });
                        session.status = SessionStatus::Complete;
                        if let Err(e) = self.db.update_session(session) {
                            tracing::error!(session_id = %session.id, error = %e, "Failed to persist completed session");
                        }
                        self.emit(
                            &session.id,
                            EventType::Done,
                            json!({"result": session.result}),
                        );
                    }
                    Err(e) => {
                        let _ = self.sandbox.stop(&outcome.container_id).await;
                        self.fail_session(session, format!("failed to create pull request: {e}"));
                        return;
                    }
                }
            }
        }

        if !outcome.container_id.is_empty() {
            let _ = self.sandbox.stop(&outcome.container_id).await;
        }
        self.bus.remove_session(&session.id);
        tracing::info!(session_id = %session.id, "Session complete");
    }

    // ==================== Single Sub-Task Path ====================

    /// One plan -> sandbox -> verify -> review cycle, with up to
    /// `max_revisions` additional rounds on failed verification or review.
    /// Every round runs against a fresh clone; the replaced container is
    /// stopped as soon as its successor starts.
    pub(super) async fn run_sub_task(
        &self,
        session: &mut Session,
        task_prompt: &str,
        repo_context: &str,
        default_branch: &str,
    ) -> Result<TaskOutcome, String> {
        let plan = self.stages.plan(task_prompt, repo_context).await;
        if plan.is_some() {
            self.emit(&session.id, EventType::Progress, json!({"stage": "plan"}));
        }

        let mut prompt = match &plan {
            Some(plan_text) => format!("{task_prompt}\n\nPlan:\n{plan_text}"),
            None => task_prompt.to_string(),
        };
        let agent = self.resolve_agent_name(&session.agent);
        let max = self.config.max_revisions;

        let mut container_id = String::new();
        let final_branch = session.branch.clone();

        for round in 0..=max {
            let round_result = self.run_sandbox_round(session, &prompt, &agent).await?;
            if !container_id.is_empty() {
                let _ = self.sandbox.stop(&container_id).await;
            }
            container_id = round_result.container_id.clone();

            if round_result.exit_code != 0 {
                return Err(format!(
                    "sandbox exited with code {}: {}",
                    round_result.exit_code, round_result.last_line
                ));
            }

            if round_result.text_result {
                self.emit(&session.id, EventType::Result, json!({"type": "text"}));
                return Ok(TaskOutcome {
                    container_id,
                    kind: OutcomeKind::Text {
                        content: round_result.output_lines.join("\n"),
                    },
                });
            }

            if let Some(branch) = round_result.done_branch {
                if branch != session.branch {
                    tracing::warn!(
                        session_id = %session.id,
                        reported = %branch,
                        expected = %session.branch,
                        "Sandbox reported an unexpected branch"
                    );
                }
            }

            let verdict = match self.run_verify_commands(&container_id).await {
                Some(output) => self.stages.verify_output(task_prompt, &output).await,
                None => None,
            };
            if let Some(verdict) = verdict {
                self.emit(
                    &session.id,
                    EventType::Progress,
                    json!({"stage": "verify", "passed": verdict.passed}),
                );
                if !verdict.passed {
                    if round < max {
                        prompt = revise_prompt(task_prompt, plan.as_deref(), &verdict.feedback);
                        continue;
                    }
                    tracing::warn!(
                        session_id = %session.id,
                        "Verification still failing in final round, proceeding"
                    );
                }
            }

            let Some(plan_text) = plan.as_deref() else {
                break;
            };
            let diff = self.collect_diff(&container_id, default_branch).await;
            if diff.trim().is_empty() {
                break;
            }
            let Some(review) = self.stages.review(task_prompt, plan_text, &diff).await else {
                break;
            };
            self.emit(
                &session.id,
                EventType::Progress,
                json!({"stage": "review", "approved": review.approved}),
            );
            if review.approved {
                break;
            }
            if round == max {
                tracing::warn!(
                    session_id = %session.id,
                    "Review not approved in final round, proceeding"
                );
                break;
            }
            prompt = revise_prompt(task_prompt, plan.as_deref(), &review.feedback);
        }

        Ok(TaskOutcome {
            container_id,
            kind: OutcomeKind::Code {
                branch: final_branch,
                body: format!("{PR_BODY_HEADER}\n\n## Task\n{}", session.prompt),
            },
        })
    }

    /// Start a fresh non-persistent sandbox, follow its log stream, and
    /// classify every line against the marker protocol.
    pub(super) async fn run_sandbox_round(
        &self,
        session: &mut Session,
        prompt: &str,
        agent: &str,
    ) -> Result<RoundResult, String> {
        let options = self.start_options(session, prompt, agent, false);
        let container_id = self
            .sandbox
            .start(&options)
            .await
            .map_err(|e| format!("failed to start sandbox: {e}"))?;

        session.container_id = container_id.clone();
        self.set_status(session, SessionStatus::Running);

        let mut logs = match self.sandbox.stream_logs(&container_id).await {
            Ok(logs) => logs,
            Err(e) => {
                let _ = self.sandbox.stop(&container_id).await;
                return Err(format!("failed to stream sandbox logs: {e}"));
            }
        };

        let mut output_lines = Vec::new();
        let mut last_line = String::new();
        let mut done_branch = None;
        let mut text_result = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.sandbox.stop(&container_id).await;
                    return Err("engine is shutting down".to_string());
                }
                line = logs.recv() => {
                    let Some(line) = line else { break };
                    last_line.clone_from(&line);
                    match markers::classify(&line) {
                        Marker::Status(text) => {
                            self.emit(&session.id, EventType::Status, json!({"message": text}));
                        }
                        Marker::Error(text) => {
                            self.emit(&session.id, EventType::Error, json!({"message": text}));
                        }
                        Marker::Done(branch) => {
                            done_branch = Some(branch.to_string());
                        }
                        Marker::Result(payload) => {
                            match serde_json::from_str::<markers::ResultPayload>(payload) {
                                Ok(parsed) if parsed.result_type == "text" => text_result = true,
                                Ok(parsed) => {
                                    tracing::warn!(
                                        session_id = %session.id,
                                        result_type = %parsed.result_type,
                                        "Unknown result type, treating as text"
                                    );
                                    text_result = true;
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        session_id = %session.id,
                                        error = %e,
                                        "Unparseable result payload, treating as text"
                                    );
                                    text_result = true;
                                }
                            }
                        }
                        Marker::Output(text) => {
                            self.emit(&session.id, EventType::Output, json!({"line": text}));
                            output_lines.push(text.to_string());
                        }
                    }
                }
            }
        }

        let exit_code = tokio::select! {
            _ = self.cancel.cancelled() => {
                let _ = self.sandbox.stop(&container_id).await;
                return Err("engine is shutting down".to_string());
            }
            result = self.sandbox.wait(&container_id) => match result {
                Ok(code) => code,
                Err(e) => {
                    tracing::warn!(container_id = %container_id, error = %e, "Sandbox wait failed");
                    -1
                }
            }
        };

        Ok(RoundResult {
            container_id,
            exit_code,
            last_line,
            done_branch,
            text_result,
            output_lines,
        })
    }

    // ==================== Multi-Step Path ====================

    /// More than one sub-task: a single persistent sandbox, a git
    /// checkpoint after each step, a progress file the agent can read,
    /// and pre-validation before each subsequent step.
    pub(super) async fn run_multi_step(
        &self,
        session: &mut Session,
        sub_tasks: &[SubTask],
        _default_branch: &str,
    ) -> Result<TaskOutcome, String> {
        let agent = self.resolve_agent_name(&session.agent);
        let options = self.start_options(session, &session.prompt, &agent, true);
        let container_id = self
            .sandbox
            .start(&options)
            .await
            .map_err(|e| format!("failed to start sandbox: {e}"))?;
        session.container_id = container_id.clone();
        self.set_status(session, SessionStatus::Running);

        self.sandbox
            .exec_collect(&container_id, &argv(&["sh", SETUP_SCRIPT]))
            .await
            .map_err(|e| format!("workspace setup failed: {e}"))?;

        // Keep the progress file out of the checkpoints
        let _ = self
            .sandbox
            .exec_collect(
                &container_id,
                &argv(&[
                    "sh",
                    "-c",
                    "grep -qxF '.telecoder-progress.json' /workspace/.gitignore 2>/dev/null \
                     || echo '.telecoder-progress.json' >> /workspace/.gitignore",
                ]),
            )
            .await;

        let mut steps: Vec<SubTaskState> = sub_tasks
            .iter()
            .map(|t| SubTaskState {
                title: t.title.clone(),
                description: t.description.clone(),
                status: StepStatus::Pending,
                commit_hash: String::new(),
            })
            .collect();
        let mut last_checkpoint: Option<String> = None;
        let mut collected_output: Vec<String> = Vec::new();
        let mut any_commit = false;

        for i in 0..steps.len() {
            steps[i].status = StepStatus::Running;
            self.emit(
                &session.id,
                EventType::Step,
                json!({"index": i, "title": steps[i].title, "status": steps[i].status}),
            );
            self.write_progress_file(&container_id, &session.prompt, i, &steps).await;

            if i > 0 {
                self.pre_validate(session, &container_id, &agent, last_checkpoint.as_deref())
                    .await;
            }

            let step_prompt = multi_step_prompt(&session.prompt, &steps, i);
            let output = self
                .exec_agent(&session.id, &container_id, &agent, &step_prompt)
                .await;
            collected_output.extend(output);

            if let Some(test_output) = self.run_verify_commands(&container_id).await {
                if let Some(verdict) = self
                    .stages
                    .verify_output(&steps[i].description, &test_output)
                    .await
                {
                    self.emit(
                        &session.id,
                        EventType::Progress,
                        json!({"stage": "verify", "step": i, "passed": verdict.passed}),
                    );
                    if !verdict.passed {
                        let fix_prompt = format!(
                            "The validation checks failed after your changes:\n{}\n\nFix the issues, changing as little as possible.",
                            verdict.feedback
                        );
                        let more = self
                            .exec_agent(&session.id, &container_id, &agent, &fix_prompt)
                            .await;
                        collected_output.extend(more);

                        let still_failing = match self.run_verify_commands(&container_id).await {
                            Some(output) => self
                                .stages
                                .verify_output(&steps[i].description, &output)
                                .await
                                .is_some_and(|v| !v.passed),
                            None => false,
                        };
                        if still_failing {
                            steps[i].status = StepStatus::Failed;
                        }
                    }
                }
            }

            if let Some(hash) = self.commit_checkpoint(&container_id, i, &steps[i].title).await {
                steps[i].commit_hash.clone_from(&hash);
                last_checkpoint = Some(hash);
                any_commit = true;
            }
            if steps[i].status != StepStatus::Failed {
                steps[i].status = StepStatus::Completed;
            }
            self.emit(
                &session.id,
                EventType::Step,
                json!({
                    "index": i,
                    "title": steps[i].title,
                    "status": steps[i].status,
                    "commit": steps[i].commit_hash,
                }),
            );
        }

        self.write_progress_file(&container_id, &session.prompt, steps.len(), &steps)
            .await;

        if any_commit {
            self.sandbox
                .exec_collect(
                    &container_id,
                    &argv(&["git", "-C", WORKSPACE, "push", "-u", "origin", &session.branch]),
                )
                .await
                .map_err(|e| format!("failed to push branch: {e}"))?;

            Ok(TaskOutcome {
                container_id,
                kind: OutcomeKind::Code {
                    branch: session.branch.clone(),
                    body: steps_pr_body(&session.prompt, &steps),
                },
            })
        } else {
            Ok(TaskOutcome {
                container_id,
                kind: OutcomeKind::Text {
                    content: collected_output.join("\n"),
                },
            })
        }
    }

    /// Before a subsequent step runs, make sure the workspace still
    /// validates. A failure gets one self-correction pass; if that does
    /// not help, roll back to the previous checkpoint.
    async fn pre_validate(
        &self,
        session: &Session,
        container_id: &str,
        agent: &str,
        checkpoint: Option<&str>,
    ) {
        let Some(output) = self.run_verify_commands(container_id).await else {
            return;
        };
        let Some(verdict) = self
            .stages
            .verify_output("workspace pre-validation", &output)
            .await
        else {
            return;
        };
        if verdict.passed {
            return;
        }

        self.emit(
            &session.id,
            EventType::Progress,
            json!({"stage": "pre_validate", "passed": false}),
        );
        let fix_prompt = format!(
            "Before the next step can start, the workspace must pass validation. It currently fails:\n{}\n\nFix the issues.",
            verdict.feedback
        );
        let _ = self.exec_agent(&session.id, container_id, agent, &fix_prompt).await;

        let still_failing = match self.run_verify_commands(container_id).await {
            Some(output) => self
                .stages
                .verify_output("workspace pre-validation", &output)
                .await
                .is_some_and(|v| !v.passed),
            None => false,
        };
        if !still_failing {
            return;
        }

        if let Some(hash) = checkpoint {
            tracing::warn!(
                session_id = %session.id,
                checkpoint = %hash,
                "Self-correction failed, rolling back to previous checkpoint"
            );
            let _ = self
                .sandbox
                .exec_collect(
                    container_id,
                    &argv(&["git", "-C", WORKSPACE, "reset", "--hard", hash]),
                )
                .await;
            self.emit(
                &session.id,
                EventType::Progress,
                json!({"stage": "pre_validate", "action": "rolled_back", "commit": hash}),
            );
        }
    }

    /// Run the coding agent inside a persistent sandbox, forwarding its
    /// output as events and collecting it for text-result reconstruction.
    pub(super) async fn exec_agent(
        &self,
        session_id: &str,
        container_id: &str,
        agent: &str,
        prompt: &str,
    ) -> Vec<String> {
        let mut command: Vec<String> = vec![AGENT_SCRIPT.to_string()];
        if !agent.is_empty() {
            command.push("--agent".to_string());
            command.push(agent.to_string());
        }
        command.push(prompt.to_string());

        let mut lines = match self.sandbox.exec(container_id, &command).await {
            Ok(lines) => lines,
            Err(e) => {
                tracing::warn!(session_id, container_id, error = %e, "Agent exec failed");
                self.emit(
                    session_id,
                    EventType::Error,
                    json!({"message": format!("agent execution failed: {e}")}),
                );
                return Vec::new();
            }
        };

        let mut collected = Vec::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = lines.recv() => {
                    let Some(line) = line else { break };
                    match markers::classify(&line) {
                        Marker::Status(text) => {
                            self.emit(session_id, EventType::Status, json!({"message": text}));
                        }
                        Marker::Error(text) => {
                            self.emit(session_id, EventType::Error, json!({"message": text}));
                        }
                        _ => {
                            self.emit(session_id, EventType::Output, json!({"line": line}));
                            collected.push(line);
                        }
                    }
                }
            }
        }
        collected
    }

    // ==================== Verification Helpers ====================

    /// Detect the repo's ecosystems and run their test/lint commands
    /// inside the container. `None` means nothing to run (or the
    /// container is already gone): verification is skipped.
    pub(super) async fn run_verify_commands(&self, container_id: &str) -> Option<String> {
        let listing = self
            .sandbox
            .exec_collect(container_id, &argv(&["ls", "-1", WORKSPACE]))
            .await
            .ok()?;
        let files: Vec<String> = listing.lines().map(|l| l.trim().to_string()).collect();
        let commands = detect_verify_commands(&files);
        if commands.is_empty() {
            return None;
        }

        let mut combined = String::new();
        for command in commands {
            let shell = format!("cd {WORKSPACE} && {command} 2>&1");
            match self
                .sandbox
                .exec_collect(container_id, &argv(&["sh", "-c", &shell]))
                .await
            {
                Ok(output) => {
                    let _ = writeln!(combined, "$ {command}\n{output}");
                }
                Err(SandboxError::CommandFailed { exit_code, output }) => {
                    let _ = writeln!(combined, "$ {command} (exit {exit_code})\n{output}");
                }
                Err(e) => {
                    tracing::warn!(container_id, command = %command, error = %e, "Verify command could not run");
                }
            }
        }
        Some(combined)
    }

    /// Diff of the working branch against the PR base.
    async fn collect_diff(&self, container_id: &str, default_branch: &str) -> String {
        let range = format!("origin/{default_branch}...HEAD");
        match self
            .sandbox
            .exec_collect(container_id, &argv(&["git", "-C", WORKSPACE, "diff", &range]))
            .await
        {
            Ok(diff) => diff,
            Err(_) => self
                .sandbox
                .exec_collect(container_id, &argv(&["git", "-C", WORKSPACE, "diff"]))
                .await
                .unwrap_or_default(),
        }
    }

    async fn commit_checkpoint(
        &self,
        container_id: &str,
        index: usize,
        title: &str,
    ) -> Option<String> {
        if let Err(e) = self
            .sandbox
            .exec_collect(container_id, &argv(&["git", "-C", WORKSPACE, "add", "-A"]))
            .await
        {
            tracing::warn!(container_id, error = %e, "git add failed");
            return None;
        }

        let message = format!("Step {}: {}", index + 1, title);
        match self
            .sandbox
            .exec_collect(
                container_id,
                &argv(&["git", "-C", WORKSPACE, "commit", "-m", &message]),
            )
            .await
        {
            Ok(_) => self
                .sandbox
                .exec_collect(container_id, &argv(&["git", "-C", WORKSPACE, "rev-parse", "HEAD"]))
                .await
                .ok()
                .map(|hash| hash.trim().to_string()),
            Err(SandboxError::CommandFailed { output, .. })
                if output.contains("nothing to commit") =>
            {
                None
            }
            Err(e) => {
                tracing::warn!(container_id, error = %e, "git commit failed");
                None
            }
        }
    }

    async fn write_progress_file(
        &self,
        container_id: &str,
        task: &str,
        current_step: usize,
        steps: &[SubTaskState],
    ) {
        let progress = json!({
            "task": task,
            "current_step": current_step,
            "total_steps": steps.len(),
            "steps": steps,
        });
        if let Err(e) = self
            .write_container_file(container_id, PROGRESS_FILE, &progress.to_string())
            .await
        {
            tracing::warn!(container_id, error = %e, "Failed to write progress file");
        }
    }

    /// Write a file into the container. Content travels base64-encoded so
    /// it never meets shell quoting; the rename keeps readers from seeing
    /// a partial file.
    async fn write_container_file(
        &self,
        container_id: &str,
        path: &str,
        content: &str,
    ) -> EngineResult<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let script =
            format!("printf '%s' '{encoded}' | base64 -d > {path}.tmp && mv {path}.tmp {path}");
        self.sandbox
            .exec_collect(container_id, &argv(&["sh", "-c", &script]))
            .await
            .map(|_| ())
            .map_err(|e| super::EngineError::Internal(e.to_string()))
    }

    // ==================== PR-Comment Flow ====================

    /// A reviewer commented on a session's PR: spin up a follow-up session
    /// that addresses the comment on the same branch, so the sandbox push
    /// updates the same PR.
    pub fn create_pr_comment_session(
        &self,
        original: &Session,
        comment: PrCommentEvent,
    ) -> EngineResult<Session> {
        let mut prompt = format!(
            "Address the following pull request review comment on branch {}.\n\nComment by @{}:\n{}",
            original.branch, comment.author, comment.body
        );
        if let Some(path) = &comment.path {
            let _ = write!(prompt, "\n\nThe comment refers to the file: {path}");
        }

        let id = super::new_session_id();
        let mut session = Session::new(&id, &original.repo, &prompt, &original.agent, SessionMode::Task);
        session.branch = original.branch.clone();
        self.db.create_session(&session)?;

        tracing::info!(
            session_id = %session.id,
            repo = %session.repo,
            pr_number = comment.pr_number,
            "Created PR-comment session"
        );

        let engine = self.clone();
        let worker_session = session.clone();
        let pr_url = original.pr_url.clone();
        let pr_number = comment.pr_number;
        self.tracker.spawn(async move {
            engine
                .run_pr_comment_session(worker_session, pr_url, pr_number)
                .await;
        });

        Ok(session)
    }

    async fn run_pr_comment_session(
        &self,
        mut session: Session,
        pr_url: String,
        pr_number: u64,
    ) {
        let ack = format!(
            "TeleCoder is on it. Follow session `{}` for progress.",
            session.id
        );
        if let Err(e) = self
            .git
            .reply_to_pr_comment(&session.repo, pr_number, &ack)
            .await
        {
            tracing::warn!(session_id = %session.id, error = %e, "Could not post acknowledgement comment");
        }

        let agent = self.resolve_agent_name(&session.agent);
        let prompt = session.prompt.clone();
        match self.run_sandbox_round(&mut session, &prompt, &agent).await {
            Ok(round) if round.exit_code == 0 => {
                session.set_result(SessionResult::Pr { pr_url, pr_number });
                session.status = SessionStatus::Complete;
                if let Err(e) = self.db.update_session(&session) {
                    tracing::error!(session_id = %session.id, error = %e, "Failed to persist session");
                }
                self.emit(
                    &session.id,
                    EventType::Done,
                    json!({"result": session.result}),
                );
                let _ = self
                    .git
                    .reply_to_pr_comment(
                        &session.repo,
                        pr_number,
                        "Done, the branch has been updated.",
                    )
                    .await;
                let _ = self.sandbox.stop(&round.container_id).await;
                self.bus.remove_session(&session.id);
            }
            Ok(round) => {
                let error = format!(
                    "sandbox exited with code {}: {}",
                    round.exit_code, round.last_line
                );
                let _ = self.sandbox.stop(&round.container_id).await;
                self.fail_session(&mut session, error.clone());
                let _ = self
                    .git
                    .reply_to_pr_comment(
                        &session.repo,
                        pr_number,
                        &format!("TeleCoder could not address this comment: {error}"),
                    )
                    .await;
            }
            Err(error) => {
                if !session.container_id.is_empty() {
                    let _ = self.sandbox.stop(&session.container_id).await;
                }
                self.fail_session(&mut session, error.clone());
                let _ = self
                    .git
                    .reply_to_pr_comment(
                        &session.repo,
                        pr_number,
                        &format!("TeleCoder could not address this comment: {error}"),
                    )
                    .await;
            }
        }
    }

    // ==================== Shared Helpers ====================

    pub(super) fn start_options(
        &self,
        session: &Session,
        prompt: &str,
        agent: &str,
        persistent: bool,
    ) -> StartOptions {
        let mut env = self.config.sandbox_env.clone();
        if !self.config.github_token.is_empty() {
            env.push(format!("GITHUB_TOKEN={}", self.config.github_token));
        }
        if !agent.is_empty() {
            env.push(format!("TELECODER_CODING_AGENT={agent}"));
        }

        StartOptions {
            session_id: session.id.clone(),
            repo: session.repo.clone(),
            prompt: prompt.to_string(),
            branch: session.branch.clone(),
            image: self.config.docker_image.clone(),
            env,
            network: self.config.docker_network.clone(),
            persistent,
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn revise_prompt(task: &str, plan: Option<&str>, feedback: &str) -> String {
    let mut prompt = task.to_string();
    if let Some(plan_text) = plan {
        let _ = write!(prompt, "\n\nPlan:\n{plan_text}");
    }
    let _ = write!(
        prompt,
        "\n\nA previous attempt did not pass validation. Feedback:\n{feedback}\n\nAddress the feedback and complete the task."
    );
    prompt
}

fn pr_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or(prompt).trim();
    if first_line.chars().count() <= PR_TITLE_LIMIT {
        first_line.to_string()
    } else {
        let truncated: String = first_line.chars().take(PR_TITLE_LIMIT - 1).collect();
        format!("{truncated}…")
    }
}

fn multi_step_prompt(task: &str, steps: &[SubTaskState], current: usize) -> String {
    let mut prompt = format!(
        "You are working through a multi-step task. Overall goal:\n{task}\n\n"
    );
    if current > 0 {
        prompt.push_str("Already completed:\n");
        for step in &steps[..current] {
            let _ = writeln!(prompt, "  {} {}", step.status.glyph(), step.title);
        }
        prompt.push('\n');
    }
    let _ = write!(
        prompt,
        "Current step ({} of {}): {}\n{}",
        current + 1,
        steps.len(),
        steps[current].title,
        steps[current].description
    );
    prompt
}

fn steps_pr_body(task: &str, steps: &[SubTaskState]) -> String {
    let mut body = format!("{PR_BODY_HEADER}\n\n## Task\n{task}\n\n## Steps\n");
    for step in steps {
        let _ = write!(body, "- {} {}", step.status.glyph(), step.title);
        if step.commit_hash.is_empty() {
            body.push('\n');
        } else {
            let short = &step.commit_hash[..step.commit_hash.len().min(7)];
            let _ = writeln!(body, " (`{short}`)");
        }
    }
    body
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    fn step(title: &str, status: StepStatus, commit: &str) -> SubTaskState {
        SubTaskState {
            title: title.to_string(),
            description: format!("{title} in detail"),
            status,
            commit_hash: commit.to_string(),
        }
    }

    #[test]
    fn test_pr_title_truncates_long_first_line() {
        let long = "a".repeat(100);
        let title = pr_title(&long);
        assert!(title.chars().count() <= PR_TITLE_LIMIT);
        assert!(title.ends_with('…'));

        assert_eq!(pr_title("add rate limiting\nmore detail"), "add rate limiting");
    }

    #[test]
    fn test_revise_prompt_references_feedback() {
        let revised = revise_prompt("fix auth", Some("plan text"), "tests fail in auth.go");
        assert!(revised.starts_with("fix auth"));
        assert!(revised.contains("plan text"));
        assert!(revised.contains("tests fail in auth.go"));
    }

    #[test]
    fn test_multi_step_prompt_lists_completed_steps() {
        let steps = vec![
            step("Add limiter", StepStatus::Completed, "abc"),
            step("Wire handler", StepStatus::Running, ""),
        ];
        let prompt = multi_step_prompt("add rate limiting", &steps, 1);
        assert!(prompt.contains("✓ Add limiter"));
        assert!(prompt.contains("Current step (2 of 2): Wire handler"));
    }

    #[test]
    fn test_steps_pr_body_glyphs() {
        let steps = vec![
            step("One", StepStatus::Completed, "abcdef1234"),
            step("Two", StepStatus::Failed, ""),
            step("Three", StepStatus::Pending, ""),
        ];
        let body = steps_pr_body("the task", &steps);
        assert!(body.contains("- ✓ One (`abcdef1`)"));
        assert!(body.contains("- ✗ Two"));
        assert!(body.contains("- ⏳ Three"));
    }
}
