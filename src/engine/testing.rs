//! Mock collaborators for engine and pool tests
//!
//! Scripted, recording implementations of the sandbox, git, and LLM
//! seams. No real I/O.

use crate::git::{CreatePrOptions, GitError, GitProvider, GitResult, RepoContext};
use crate::llm::{LlmClient, LlmError, LlmResult};
use crate::sandbox::{LogStream, SandboxError, SandboxResult, SandboxRuntime, StartOptions};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

// ============================================================================
// Mock Sandbox Runtime
// ============================================================================

/// One scripted non-persistent container run: the log lines it emits and
/// the exit code `wait` reports.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub lines: Vec<String>,
    pub exit_code: i64,
}

impl ScriptedRun {
    pub fn done(branch: &str) -> Self {
        Self {
            lines: vec![
                "Cloning repository".to_string(),
                format!("###TELECODER_DONE### {branch}"),
            ],
            exit_code: 0,
        }
    }

    pub fn text(lines: &[&str]) -> Self {
        let mut all: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        all.push(r#"###TELECODER_RESULT### {"type":"text"}"#.to_string());
        Self {
            lines: all,
            exit_code: 0,
        }
    }
}

impl Default for ScriptedRun {
    fn default() -> Self {
        ScriptedRun::done("telecoder/test")
    }
}

#[derive(Debug, Clone)]
enum ExecResponse {
    Ok(String),
    Fail { exit_code: i64, output: String },
}

#[derive(Default)]
pub struct MockSandbox {
    next_id: AtomicUsize,
    pub fail_start: AtomicBool,
    runs: Mutex<VecDeque<ScriptedRun>>,
    runs_by_container: Mutex<HashMap<String, ScriptedRun>>,
    running: Mutex<HashSet<String>>,
    starts: Mutex<Vec<StartOptions>>,
    stops: Mutex<Vec<String>>,
    exec_collects: Mutex<Vec<(String, Vec<String>)>>,
    /// Substring-of-argv pattern -> response, first match wins
    exec_responses: Mutex<Vec<(String, ExecResponse)>>,
    exec_streams: Mutex<VecDeque<Vec<String>>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted run for the next `start`.
    pub fn queue_run(&self, run: ScriptedRun) {
        self.runs.lock().unwrap().push_back(run);
    }

    /// Respond to any `exec_collect` whose joined argv contains `pattern`.
    pub fn set_exec_response(&self, pattern: &str, output: &str) {
        self.exec_responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), ExecResponse::Ok(output.to_string())));
    }

    /// Like `set_exec_response` but the command fails with the given exit
    /// code and output.
    pub fn set_exec_failure(&self, pattern: &str, exit_code: i64, output: &str) {
        self.exec_responses.lock().unwrap().push((
            pattern.to_string(),
            ExecResponse::Fail {
                exit_code,
                output: output.to_string(),
            },
        ));
    }

    /// Queue output lines for the next streaming `exec` call.
    pub fn queue_exec_stream(&self, lines: &[&str]) {
        self.exec_streams
            .lock()
            .unwrap()
            .push_back(lines.iter().map(|s| s.to_string()).collect());
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }

    pub fn starts(&self) -> Vec<StartOptions> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stops.lock().unwrap().clone()
    }

    pub fn exec_collect_calls(&self) -> Vec<(String, Vec<String>)> {
        self.exec_collects.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRuntime for MockSandbox {
    async fn start(&self, options: &StartOptions) -> SandboxResult<String> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandboxError::Other("image pull failed".to_string()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let container_id = format!("c{n}");
        let run = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        self.runs_by_container
            .lock()
            .unwrap()
            .insert(container_id.clone(), run);
        self.running.lock().unwrap().insert(container_id.clone());
        self.starts.lock().unwrap().push(options.clone());
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str) -> SandboxResult<()> {
        self.stops.lock().unwrap().push(container_id.to_string());
        self.running.lock().unwrap().remove(container_id);
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> SandboxResult<i64> {
        self.runs_by_container
            .lock()
            .unwrap()
            .get(container_id)
            .map(|run| run.exit_code)
            .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))
    }

    async fn stream_logs(&self, container_id: &str) -> SandboxResult<LogStream> {
        let run = self
            .runs_by_container
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(container_id.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for line in run.lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn exec(&self, _container_id: &str, _argv: &[String]) -> SandboxResult<LogStream> {
        let lines = self
            .exec_streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for line in lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn exec_collect(&self, container_id: &str, argv: &[String]) -> SandboxResult<String> {
        let joined = argv.join(" ");
        self.exec_collects
            .lock()
            .unwrap()
            .push((container_id.to_string(), argv.to_vec()));

        let response = self
            .exec_responses
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| joined.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());

        match response {
            Some(ExecResponse::Ok(output)) => Ok(output),
            Some(ExecResponse::Fail { exit_code, output }) => {
                Err(SandboxError::CommandFailed { exit_code, output })
            }
            None => Ok(String::new()),
        }
    }

    async fn ensure_network(&self, _name: &str) -> SandboxResult<()> {
        Ok(())
    }

    async fn is_running(&self, container_id: &str) -> bool {
        self.running.lock().unwrap().contains(container_id)
    }
}

// ============================================================================
// Mock Git Provider
// ============================================================================

#[derive(Default)]
pub struct MockGit {
    pub created: Mutex<Vec<CreatePrOptions>>,
    pub comments: Mutex<Vec<(String, u64, String)>>,
    pub fail_create: AtomicBool,
    pub fail_index: AtomicBool,
}

impl MockGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_prs(&self) -> Vec<CreatePrOptions> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitProvider for MockGit {
    async fn create_pr(&self, options: &CreatePrOptions) -> GitResult<(String, u64)> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GitError::Api {
                status: 422,
                message: "Validation Failed".to_string(),
            });
        }
        let mut created = self.created.lock().unwrap();
        created.push(options.clone());
        let number = created.len() as u64;
        Ok((
            format!("https://github.com/{}/pull/{number}", options.repo),
            number,
        ))
    }

    async fn get_default_branch(&self, _repo: &str) -> GitResult<String> {
        Ok("main".to_string())
    }

    async fn reply_to_pr_comment(&self, repo: &str, pr_number: u64, body: &str) -> GitResult<()> {
        self.comments
            .lock()
            .unwrap()
            .push((repo.to_string(), pr_number, body.to_string()));
        Ok(())
    }

    async fn index_repo(&self, repo: &str) -> GitResult<RepoContext> {
        if self.fail_index.load(Ordering::SeqCst) {
            return Err(GitError::Api {
                status: 404,
                message: format!("repo {repo} not found"),
            });
        }
        Ok(RepoContext {
            default_branch: "main".to_string(),
            ..RepoContext::default()
        })
    }
}

// ============================================================================
// Mock LLM Client
// ============================================================================

/// Returns queued responses in order; an empty queue is an error, which
/// every pipeline stage treats as "degrade to the fallback".
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<LlmResult<String>>>,
    pub requests: Mutex<Vec<(String, String)>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_ok(&self, response: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(response.to_string()));
    }

    pub fn queue_err(&self, message: &str) {
        self.responses.lock().unwrap().push_back(Err(LlmError::Provider {
            status: 500,
            message: message.to_string(),
        }));
    }

    pub fn recorded_requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, system: &str, user: &str) -> LlmResult<String> {
        self.requests
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(LlmError::Provider {
                    status: 500,
                    message: "no mock response queued".to_string(),
                })
            })
    }

    fn model(&self) -> &str {
        "mock-model"
    }
}
