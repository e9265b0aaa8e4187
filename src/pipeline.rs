//! LLM-backed pipeline stages
//!
//! Decompose, plan, review, and verify. Every stage fails gracefully: the
//! engine proceeds with a fallback rather than aborting the session, so
//! each method here returns its fallback shape instead of an error.

use crate::llm::LlmClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DECOMPOSE_SYSTEM: &str = "You are a software project planner. Break the user's task into \
the smallest ordered list of independent sub-tasks that together accomplish it. Respond with a \
JSON array of objects with \"title\" and \"description\" fields and nothing else. For a simple \
task, respond with a single-element array.";

const PLAN_SYSTEM: &str = "You are a senior software engineer. Produce a short, concrete \
implementation plan for the task: the files likely involved, the changes to make, and how to \
validate them. Respond with the plan only.";

const REVIEW_SYSTEM: &str = "You are a strict code reviewer. You are given a task, a plan, and \
the resulting diff. If the diff accomplishes the task, respond with the single word APPROVED. \
Otherwise respond with concise, actionable feedback on what is wrong or missing.";

const VERIFY_SYSTEM: &str = "You are a build engineer reading test and lint output. If the \
output indicates the checks passed, respond with the single word PASS. Otherwise respond with \
FAIL on the first line followed by a concise summary of what failed.";

/// One unit of work produced by decomposition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTask {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewResult {
    pub approved: bool,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyResult {
    pub passed: bool,
    pub feedback: String,
}

/// Stage runner. `llm = None` disables every LLM-backed stage; callers get
/// the fallback behavior.
#[derive(Clone)]
pub struct Stages {
    llm: Option<Arc<dyn LlmClient>>,
    max_sub_tasks: usize,
}

impl Stages {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, max_sub_tasks: usize) -> Self {
        Self { llm, max_sub_tasks }
    }

    /// Break a prompt into ordered sub-tasks. Falls back to a single
    /// sub-task wrapping the raw prompt.
    pub async fn decompose(&self, prompt: &str, repo_context: &str) -> Vec<SubTask> {
        let fallback = vec![SubTask {
            title: "Complete the task".to_string(),
            description: prompt.to_string(),
        }];

        let Some(llm) = &self.llm else {
            return fallback;
        };

        let user = if repo_context.is_empty() {
            format!("Task:\n{prompt}")
        } else {
            format!("Repository context:\n{repo_context}\n\nTask:\n{prompt}")
        };

        let response = match llm.complete(DECOMPOSE_SYSTEM, &user).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Decompose stage failed, using single sub-task");
                return fallback;
            }
        };

        let parsed: Vec<SubTask> = match serde_json::from_str(extract_json(&response)) {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(error = %e, "Decompose output was not valid JSON, using single sub-task");
                return fallback;
            }
        };

        if parsed.is_empty() {
            return fallback;
        }

        let mut tasks = parsed;
        if tasks.len() > self.max_sub_tasks {
            tracing::warn!(
                produced = tasks.len(),
                cap = self.max_sub_tasks,
                "Decompose produced too many sub-tasks, truncating"
            );
            tasks.truncate(self.max_sub_tasks);
        }
        tasks
    }

    /// Produce an implementation plan. `None` means the sub-task proceeds
    /// with the raw prompt.
    pub async fn plan(&self, prompt: &str, repo_context: &str) -> Option<String> {
        let llm = self.llm.as_ref()?;

        let user = if repo_context.is_empty() {
            format!("Task:\n{prompt}")
        } else {
            format!("Repository context:\n{repo_context}\n\nTask:\n{prompt}")
        };

        match llm.complete(PLAN_SYSTEM, &user).await {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::warn!(error = %e, "Plan stage failed, proceeding with raw prompt");
                None
            }
        }
    }

    /// Review a diff against the task and plan. `None` means review is
    /// unavailable and the caller should proceed.
    pub async fn review(&self, task: &str, plan: &str, diff: &str) -> Option<ReviewResult> {
        let llm = self.llm.as_ref()?;

        let user = format!("Task:\n{task}\n\nPlan:\n{plan}\n\nDiff:\n{diff}");
        match llm.complete(REVIEW_SYSTEM, &user).await {
            Ok(response) => {
                let trimmed = response.trim();
                let approved = trimmed.to_uppercase().starts_with("APPROVED");
                Some(ReviewResult {
                    approved,
                    feedback: trimmed.to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Review stage failed, skipping review");
                None
            }
        }
    }

    /// Judge collected test/lint output. Empty input means no commands
    /// ran: treated as passed. `None` means the verdict is unavailable
    /// and the caller should proceed.
    pub async fn verify_output(&self, task: &str, output: &str) -> Option<VerifyResult> {
        if output.trim().is_empty() {
            return Some(VerifyResult {
                passed: true,
                feedback: String::new(),
            });
        }

        let llm = self.llm.as_ref()?;
        let user = format!("Task:\n{task}\n\nTest and lint output:\n{output}");
        match llm.complete(VERIFY_SYSTEM, &user).await {
            Ok(response) => {
                let trimmed = response.trim();
                let passed = trimmed.to_uppercase().starts_with("PASS");
                Some(VerifyResult {
                    passed,
                    feedback: trimmed.to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "Verify stage failed, skipping verification");
                None
            }
        }
    }
}

/// Standard test and lint invocations per ecosystem, detected from the
/// files present at the repo root. Tests come before lints. An empty
/// result means verification is skipped.
pub fn detect_verify_commands(root_files: &[String]) -> Vec<String> {
    let has = |name: &str| root_files.iter().any(|f| f == name);
    let has_prefix = |prefix: &str| root_files.iter().any(|f| f.starts_with(prefix));

    let mut commands = Vec::new();

    if has("go.mod") {
        commands.push("go test ./...".to_string());
        commands.push("go vet ./...".to_string());
    }

    if has("package.json") {
        commands.push("npm test --silent".to_string());
    }
    if has_prefix(".eslintrc") || has_prefix("eslint.config") {
        commands.push("npx eslint .".to_string());
    }

    if has("Cargo.toml") {
        commands.push("cargo test".to_string());
        commands.push("cargo clippy".to_string());
    }

    if has("pyproject.toml") || has("setup.py") || has("requirements.txt") {
        commands.push("pytest".to_string());
        if has("pyproject.toml") {
            commands.push("ruff check .".to_string());
        }
    }

    if has("Makefile") {
        commands.push("make test".to_string());
        commands.push("make lint".to_string());
    }

    commands
}

/// Pull a JSON payload out of an LLM response, stripping surrounding prose
/// and Markdown code fences.
pub fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();

    // Fenced block first: ```json ... ``` or plain ```
    if let Some(fence_start) = trimmed.find("```") {
        let after = &trimmed[fence_start + 3..];
        let body_start = after.find('\n').map_or(0, |i| i + 1);
        let body = &after[body_start..];
        if let Some(fence_end) = body.find("```") {
            return body[..fence_end].trim();
        }
    }

    // Otherwise take from the first bracket to the matching last one
    let open = trimmed.find(['[', '{']);
    let close = trimmed.rfind([']', '}']);
    if let (Some(start), Some(end)) = (open, close) {
        if start < end {
            return trimmed[start..=end].trim();
        }
    }

    trimmed
}
