//! Engine end-to-end tests against mock collaborators
//!
//! The mock sandbox scripts log output line by line, so these exercise the
//! full path: create session, stream and classify markers, verify, review,
//! finalize, clean up containers.

use super::testing::{MockGit, MockLlm, MockSandbox, ScriptedRun};
use super::{Engine, EngineError, PrCommentEvent};
use crate::bus::EventBus;
use crate::config::Config;
use crate::db::{Database, EventType, MessageRole, Session, SessionMode, SessionResult, SessionStatus};
use crate::git::GitProvider;
use crate::llm::LlmClient;
use crate::pipeline::Stages;
use crate::sandbox::SandboxRuntime;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Engine,
    sandbox: Arc<MockSandbox>,
    git: Arc<MockGit>,
    db: Database,
}

fn harness(config: Config, llm: Option<Arc<MockLlm>>) -> Harness {
    let db = Database::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let sandbox = Arc::new(MockSandbox::new());
    let git = Arc::new(MockGit::new());
    let stages = Stages::new(
        llm.map(|l| l as Arc<dyn LlmClient>),
        config.max_sub_tasks,
    );
    let engine = Engine::new(
        db.clone(),
        bus,
        Arc::clone(&sandbox) as Arc<dyn SandboxRuntime>,
        Arc::clone(&git) as Arc<dyn GitProvider>,
        stages,
        config,
    );
    Harness {
        engine,
        sandbox,
        git,
        db,
    }
}

fn test_config() -> Config {
    Config {
        docker_image: "sandbox:latest".to_string(),
        github_token: "gh-token".to_string(),
        ..Config::default()
    }
}

async fn wait_terminal(db: &Database, id: &str) -> Session {
    for _ in 0..400 {
        let session = db.get_session(id).unwrap();
        if session.status.is_terminal() {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session {id} did not reach a terminal state");
}

async fn wait_status(db: &Database, id: &str, status: SessionStatus) -> Session {
    for _ in 0..400 {
        let session = db.get_session(id).unwrap();
        if session.status == status {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session {id} never reached {status}");
}

// ==================== Task Mode ====================

#[tokio::test]
async fn test_task_with_code_change_creates_pr() {
    let h = harness(test_config(), None);
    h.sandbox.queue_run(ScriptedRun::done("telecoder/test"));

    let session = h
        .engine
        .create_session("acme/app", "add rate limiting", "", SessionMode::Task)
        .unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.branch, format!("telecoder/{}", session.id));

    let done = wait_terminal(&h.db, &session.id).await;
    assert_eq!(done.status, SessionStatus::Complete);
    let SessionResult::Pr { pr_url, pr_number } = &done.result else {
        panic!("expected a PR result, got {:?}", done.result);
    };
    assert!(!pr_url.is_empty());
    assert_ne!(*pr_number, 0);
    assert_eq!(done.pr_url, *pr_url);

    let prs = h.git.created_prs();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].repo, "acme/app");
    assert_eq!(prs[0].branch, session.branch);
    assert_eq!(prs[0].base, "main");

    // Every container the engine started was stopped by terminal time
    let started = h.sandbox.start_count();
    assert_eq!(started, 1);
    let stopped = h.sandbox.stopped();
    assert!(stopped.contains(&"c0".to_string()));

    // Exactly one terminal done event, no error events
    let events = h.db.get_events(&session.id, 0).unwrap();
    assert_eq!(
        events.iter().filter(|e| e.event_type == EventType::Done).count(),
        1
    );
    assert_eq!(
        events.iter().filter(|e| e.event_type == EventType::Error).count(),
        0
    );
    // State was persisted before the done event: the done event must be
    // the last one, after the running status event
    assert_eq!(events.last().unwrap().event_type, EventType::Done);
}

#[tokio::test]
async fn test_task_with_text_result() {
    let h = harness(test_config(), None);
    h.sandbox
        .queue_run(ScriptedRun::text(&["It is written in Rust."]));

    let session = h
        .engine
        .create_session("acme/app", "what language is this project?", "", SessionMode::Task)
        .unwrap();

    let done = wait_terminal(&h.db, &session.id).await;
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(
        done.result,
        SessionResult::Text {
            content: "It is written in Rust.".to_string()
        }
    );
    assert!(h.git.created_prs().is_empty());

    // Output lines became output events; the result marker a result event
    let events = h.db.get_events(&session.id, 0).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::Output
            && e.data["line"] == "It is written in Rust."));
    assert_eq!(
        events.iter().filter(|e| e.event_type == EventType::Result).count(),
        1
    );
}

#[tokio::test]
async fn test_agent_override_reaches_sandbox_env() {
    let mut config = test_config();
    config.coding_agent = "opencode".to_string();
    let h = harness(config, None);
    h.sandbox.queue_run(ScriptedRun::done("b"));

    let session = h
        .engine
        .create_session("acme/app", "do it", "claude-code", SessionMode::Task)
        .unwrap();
    wait_terminal(&h.db, &session.id).await;

    let starts = h.sandbox.starts();
    let env = &starts.last().unwrap().env;
    assert!(env.contains(&"TELECODER_CODING_AGENT=claude-code".to_string()));
    assert!(env.contains(&"GITHUB_TOKEN=gh-token".to_string()));
    assert_eq!(h.db.get_session(&session.id).unwrap().agent, "claude-code");
}

#[tokio::test]
async fn test_revision_round_on_failed_verification() {
    let llm = Arc::new(MockLlm::new());
    llm.queue_ok("[]"); // decompose: falls back to a single sub-task
    llm.queue_ok("1. Edit the limiter middleware"); // plan
    llm.queue_ok("FAIL\nTestRateLimit is failing"); // verify, round 0
    llm.queue_ok("FAIL\nstill failing"); // verify, round 1 (final: proceed)

    let h = harness(test_config(), Some(Arc::clone(&llm)));
    h.sandbox.queue_run(ScriptedRun::done("b"));
    h.sandbox.queue_run(ScriptedRun::done("b"));
    h.sandbox
        .set_exec_response("ls -1 /workspace", "go.mod\nmain.go");
    h.sandbox
        .set_exec_failure("go test", 1, "--- FAIL: TestRateLimit");

    let session = h
        .engine
        .create_session("acme/app", "add rate limiting", "", SessionMode::Task)
        .unwrap();
    let done = wait_terminal(&h.db, &session.id).await;

    // Two rounds ran; the second prompt carried the verify feedback
    let starts = h.sandbox.starts();
    assert_eq!(starts.len(), 2);
    assert!(starts[1].prompt.contains("TestRateLimit"));

    // decompose, plan, and one verify verdict per round
    assert_eq!(llm.recorded_requests().len(), 4);

    // Both containers were stopped
    let stopped = h.sandbox.stopped();
    assert!(stopped.contains(&"c0".to_string()));
    assert!(stopped.contains(&"c1".to_string()));

    // Final round proceeded to PR despite the failing verdict
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(h.git.created_prs().len(), 1);
}

#[tokio::test]
async fn test_multi_step_runs_one_persistent_sandbox() {
    let llm = Arc::new(MockLlm::new());
    llm.queue_ok(
        r#"[{"title":"Add limiter","description":"Add a token bucket limiter"},
            {"title":"Wire handler","description":"Use the limiter in the HTTP handler"}]"#,
    );

    let h = harness(test_config(), Some(llm));
    h.sandbox.set_exec_response("rev-parse", "abc123def456\n");
    h.sandbox.queue_exec_stream(&["implemented the limiter"]);
    h.sandbox.queue_exec_stream(&["wired it up"]);

    let session = h
        .engine
        .create_session("acme/app", "add rate limiting", "", SessionMode::Task)
        .unwrap();
    let done = wait_terminal(&h.db, &session.id).await;

    assert_eq!(done.status, SessionStatus::Complete);
    assert!(matches!(done.result, SessionResult::Pr { .. }));

    // One persistent container for the whole run, stopped at the end
    let starts = h.sandbox.starts();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].persistent);
    assert!(h.sandbox.stopped().contains(&"c0".to_string()));

    // Branch was pushed before the PR
    let pushed = h
        .sandbox
        .exec_collect_calls()
        .iter()
        .any(|(_, argv)| argv.join(" ").contains(&format!("push -u origin {}", session.branch)));
    assert!(pushed);

    // PR body summarizes the steps with check glyphs
    let prs = h.git.created_prs();
    assert_eq!(prs.len(), 1);
    assert!(prs[0].body.contains("✓ Add limiter"));
    assert!(prs[0].body.contains("✓ Wire handler"));

    // Step events were emitted for both sub-tasks
    let events = h.db.get_events(&session.id, 0).unwrap();
    let steps: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::Step)
        .collect();
    assert!(steps.len() >= 4, "running+completed per step, got {}", steps.len());
}

#[tokio::test]
async fn test_indexing_failure_degrades_gracefully() {
    let h = harness(test_config(), None);
    h.git
        .fail_index
        .store(true, std::sync::atomic::Ordering::SeqCst);
    h.sandbox.queue_run(ScriptedRun::done("b"));

    let session = h
        .engine
        .create_session("acme/app", "do it", "", SessionMode::Task)
        .unwrap();
    let done = wait_terminal(&h.db, &session.id).await;

    // Indexing is best-effort; the session still completes with a PR
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(h.git.created_prs().len(), 1);
}

#[tokio::test]
async fn test_sandbox_start_failure_fails_session() {
    let h = harness(test_config(), None);
    h.sandbox
        .fail_start
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let session = h
        .engine
        .create_session("acme/app", "do it", "", SessionMode::Task)
        .unwrap();
    let done = wait_terminal(&h.db, &session.id).await;

    assert_eq!(done.status, SessionStatus::Error);
    assert!(done.error.contains("failed to start sandbox"));

    let events = h.db.get_events(&session.id, 0).unwrap();
    assert_eq!(
        events.iter().filter(|e| e.event_type == EventType::Error).count(),
        1
    );
}

#[tokio::test]
async fn test_nonzero_exit_reports_last_line() {
    let h = harness(test_config(), None);
    h.sandbox.queue_run(ScriptedRun {
        lines: vec![
            "Cloning repository".to_string(),
            "fatal: could not read Username".to_string(),
        ],
        exit_code: 128,
    });

    let session = h
        .engine
        .create_session("acme/app", "do it", "", SessionMode::Task)
        .unwrap();
    let done = wait_terminal(&h.db, &session.id).await;

    assert_eq!(done.status, SessionStatus::Error);
    assert!(done.error.contains("exited with code 128"));
    assert!(done.error.contains("could not read Username"));
    assert!(h.sandbox.stopped().contains(&"c0".to_string()));
}

#[tokio::test]
async fn test_pr_creation_failure_fails_session() {
    let h = harness(test_config(), None);
    h.sandbox.queue_run(ScriptedRun::done("b"));
    h.git
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let session = h
        .engine
        .create_session("acme/app", "do it", "", SessionMode::Task)
        .unwrap();
    let done = wait_terminal(&h.db, &session.id).await;

    assert_eq!(done.status, SessionStatus::Error);
    assert!(done.error.contains("failed to create pull request"));
    assert!(h.sandbox.stopped().contains(&"c0".to_string()));
}

// ==================== Validation ====================

#[tokio::test]
async fn test_create_session_validation() {
    let h = harness(test_config(), None);

    assert!(matches!(
        h.engine.create_session("", "prompt", "", SessionMode::Task),
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        h.engine.create_session("not-a-repo", "prompt", "", SessionMode::Task),
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        h.engine.create_session("acme/app", "", "", SessionMode::Task),
        Err(EngineError::Validation(_))
    ));
    // Chat sessions may start without a prompt
    assert!(h
        .engine
        .create_session("acme/app", "", "", SessionMode::Chat)
        .is_ok());
}

#[tokio::test]
async fn test_agent_resolution() {
    let h = harness(test_config(), None);
    assert_eq!(h.engine.resolve_agent_name("claude-code"), "claude-code");
    assert_eq!(h.engine.resolve_agent_name("auto"), "");
    assert_eq!(h.engine.resolve_agent_name(""), "");

    let mut config = test_config();
    config.coding_agent = "opencode".to_string();
    let h = harness(config, None);
    assert_eq!(h.engine.resolve_agent_name(""), "opencode");
    assert_eq!(h.engine.resolve_agent_name("auto"), "opencode");
    assert_eq!(h.engine.resolve_agent_name("codex"), "codex");

    let mut config = test_config();
    config.coding_agent = "auto".to_string();
    let h = harness(config, None);
    assert_eq!(h.engine.resolve_agent_name(""), "");
}

// ==================== Chat Mode ====================

#[tokio::test]
async fn test_chat_session_lifecycle() {
    let h = harness(test_config(), None);

    let session = h
        .engine
        .create_session("acme/app", "", "", SessionMode::Chat)
        .unwrap();
    let idle = wait_status(&h.db, &session.id, SessionStatus::Idle).await;
    assert!(!idle.container_id.is_empty());
    assert!(h.sandbox.starts()[0].persistent);

    // Send a message; agent output becomes the assistant reply
    h.sandbox.queue_exec_stream(&["The project uses Go."]);
    h.engine
        .send_chat_message(&session.id, "what language is this?")
        .unwrap();
    wait_status(&h.db, &session.id, SessionStatus::Idle).await;

    let messages = h.db.get_messages(&session.id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "The project uses Go.");
}

#[tokio::test]
async fn test_chat_message_cap() {
    let mut config = test_config();
    config.chat_max_messages = 1;
    let h = harness(config, None);

    let session = h
        .engine
        .create_session("acme/app", "", "", SessionMode::Chat)
        .unwrap();
    wait_status(&h.db, &session.id, SessionStatus::Idle).await;

    h.sandbox.queue_exec_stream(&["ok"]);
    h.engine.send_chat_message(&session.id, "first").unwrap();
    wait_status(&h.db, &session.id, SessionStatus::Idle).await;

    assert!(matches!(
        h.engine.send_chat_message(&session.id, "second"),
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn test_chat_rejects_message_while_busy() {
    let h = harness(test_config(), None);
    let session = h
        .engine
        .create_session("acme/app", "", "", SessionMode::Chat)
        .unwrap();
    wait_status(&h.db, &session.id, SessionStatus::Idle).await;

    // First message leaves the session running until its (empty) stream
    // drains; a racing second message must be rejected while running
    let mut busy = h.db.get_session(&session.id).unwrap();
    busy.status = SessionStatus::Running;
    h.db.update_session(&busy).unwrap();

    assert!(matches!(
        h.engine.send_chat_message(&session.id, "second"),
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_idle_chat_sessions_are_reaped() {
    let mut config = test_config();
    config.chat_idle_timeout = Duration::from_secs(60);
    let h = harness(config, None);

    let session = h
        .engine
        .create_session("acme/app", "", "", SessionMode::Chat)
        .unwrap();
    let idle = wait_status(&h.db, &session.id, SessionStatus::Idle).await;
    let container_id = idle.container_id.clone();

    // Not yet expired: a pass leaves it alone
    h.engine.reap_idle_chats_once().await;
    assert_eq!(
        h.db.get_session(&session.id).unwrap().status,
        SessionStatus::Idle
    );

    h.db.backdate_session(&session.id, 3600).unwrap();
    h.engine.reap_idle_chats_once().await;

    let reaped = h.db.get_session(&session.id).unwrap();
    assert_eq!(reaped.status, SessionStatus::Error);
    assert_eq!(reaped.error, "session timed out due to inactivity");

    let stop_count = h
        .sandbox
        .stopped()
        .iter()
        .filter(|id| **id == container_id)
        .count();
    assert_eq!(stop_count, 1);

    let events = h.db.get_events(&session.id, 0).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::Status && e.data["status"] == "error"));
}

#[tokio::test]
async fn test_create_pr_from_chat() {
    let h = harness(test_config(), None);
    let session = h
        .engine
        .create_session("acme/app", "", "", SessionMode::Chat)
        .unwrap();
    wait_status(&h.db, &session.id, SessionStatus::Idle).await;

    h.sandbox.queue_exec_stream(&["added the endpoint"]);
    h.engine
        .send_chat_message(&session.id, "add a /health endpoint")
        .unwrap();
    wait_status(&h.db, &session.id, SessionStatus::Idle).await;

    let published = h.engine.create_pr_from_chat(&session.id).await.unwrap();
    assert_eq!(published.status, SessionStatus::Complete);
    assert!(matches!(published.result, SessionResult::Pr { .. }));

    let prs = h.git.created_prs();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].branch, session.branch);

    // The persistent container was stopped after publishing
    assert!(!h.sandbox.stopped().is_empty());

    // Publishing twice is rejected
    assert!(matches!(
        h.engine.create_pr_from_chat(&session.id).await,
        Err(EngineError::Conflict(_))
    ));
}

// ==================== PR-Comment Flow ====================

#[tokio::test]
async fn test_pr_comment_session_updates_same_branch() {
    let h = harness(test_config(), None);
    h.sandbox.queue_run(ScriptedRun::done("b"));

    let original = h
        .engine
        .create_session("acme/app", "add rate limiting", "", SessionMode::Task)
        .unwrap();
    let original = wait_terminal(&h.db, &original.id).await;
    let SessionResult::Pr { pr_number, .. } = original.result.clone() else {
        panic!("expected PR result");
    };

    h.sandbox.queue_run(ScriptedRun::done("b"));
    let follow_up = h
        .engine
        .create_pr_comment_session(
            &original,
            PrCommentEvent {
                pr_number,
                author: "reviewer".to_string(),
                body: "please rename the limiter struct".to_string(),
                path: Some("limiter.go".to_string()),
            },
        )
        .unwrap();

    assert_eq!(follow_up.branch, original.branch);
    assert!(follow_up.prompt.contains("please rename the limiter struct"));

    let done = wait_terminal(&h.db, &follow_up.id).await;
    assert_eq!(done.status, SessionStatus::Complete);
    assert_eq!(done.pr_number, pr_number);

    // Acknowledgement and completion comments were posted
    let comments = h.git.comments.lock().unwrap().clone();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].1, pr_number);

    // The follow-up sandbox pushed to the original branch
    let starts = h.sandbox.starts();
    assert_eq!(starts.last().unwrap().branch, original.branch);
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_stop_session() {
    let h = harness(test_config(), None);
    let session = h
        .engine
        .create_session("acme/app", "", "", SessionMode::Chat)
        .unwrap();
    let idle = wait_status(&h.db, &session.id, SessionStatus::Idle).await;

    h.engine.stop_session(&session.id).await.unwrap();
    let stopped = h.db.get_session(&session.id).unwrap();
    assert_eq!(stopped.status, SessionStatus::Error);
    assert_eq!(stopped.error, "stopped by user");
    assert!(h.sandbox.stopped().contains(&idle.container_id));

    // Stopping a finished session is a conflict
    assert!(matches!(
        h.engine.stop_session(&session.id).await,
        Err(EngineError::Conflict(_))
    ));
    assert!(matches!(
        h.engine.stop_session("nope").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_engine_stop_is_idempotent() {
    let h = harness(test_config(), None);
    h.engine.start();
    h.engine.stop().await;
    h.engine.stop().await;
}
