//! End-to-end orchestration tests.
//!
//! Drives the engine through its public surface with scripted adapters:
//! a meeting pipeline with a gated spreadsheet write, a parallel group with
//! a failing member, the approval protocol under repeated and concurrent
//! decisions, commit retry, and a restart over a file-backed store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conclave::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

// ---------------------------------------------------------------------------
// Scripted adapters
// ---------------------------------------------------------------------------

/// Streams two transcript chunks and returns the joined text, yielding
/// between chunks the way a network-bound transcription would
struct Transcriber;

#[async_trait]
impl TaskAdapter for Transcriber {
    async fn execute(&self, _input: Value, scope: &TaskScope) -> anyhow::Result<Value> {
        anyhow::ensure!(scope.emitter.is_streaming(), "transcriber expects a streaming step");
        scope.emitter.stream(json!("hello"));
        tokio::task::yield_now().await;
        scope.emitter.stream(json!("world"));
        tokio::task::yield_now().await;
        scope.emitter.log(LogLevel::Info, "transcript ready");
        Ok(json!({"text": "hello world"}))
    }
}

/// Returns a fixed result and records every input it was given
struct Recorder {
    result: Value,
    inputs: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    fn new(result: Value) -> (Self, Arc<Mutex<Vec<Value>>>) {
        let inputs = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                result,
                inputs: inputs.clone(),
            },
            inputs,
        )
    }
}

#[async_trait]
impl TaskAdapter for Recorder {
    async fn execute(&self, input: Value, _scope: &TaskScope) -> anyhow::Result<Value> {
        self.inputs.lock().push(input);
        Ok(self.result.clone())
    }
}

struct Failing;

#[async_trait]
impl TaskAdapter for Failing {
    async fn execute(&self, _input: Value, _scope: &TaskScope) -> anyhow::Result<Value> {
        tokio::task::yield_now().await;
        anyhow::bail!("calendar API unavailable")
    }
}

/// Proposes rows built from the extracted events; commits into a shared sheet
struct SheetWriter {
    sheet: Arc<Mutex<Vec<Value>>>,
    /// Commit attempts that fail before one succeeds
    failures_left: AtomicUsize,
}

impl SheetWriter {
    fn new(failures: usize) -> (Self, Arc<Mutex<Vec<Value>>>) {
        let sheet = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sheet: sheet.clone(),
                failures_left: AtomicUsize::new(failures),
            },
            sheet,
        )
    }
}

#[async_trait]
impl TaskAdapter for SheetWriter {
    async fn execute(&self, input: Value, _scope: &TaskScope) -> anyhow::Result<Value> {
        let rows = input["extractor"]["events"].clone();
        Ok(json!({"target": "sheet:meetings", "payload": {"rows": rows}}))
    }

    async fn commit(
        &self,
        request: &WriteRequest,
        _approval: &Approval,
        _scope: &TaskScope,
    ) -> anyhow::Result<Value> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("sheet quota exceeded");
        }
        self.sheet.lock().push(request.payload.clone());
        Ok(json!({"rows_written": request.payload["rows"].as_array().map_or(0, Vec::len)}))
    }
}

/// Memory store that yields after every lookup and counts status updates,
/// so concurrent callers interleave between reading and resolving
#[derive(Default)]
struct YieldingStore {
    inner: MemoryStore,
    status_updates: AtomicUsize,
}

#[async_trait]
impl WriteRequestStore for YieldingStore {
    async fn save_write_request(&self, request: &WriteRequest) -> conclave::Result<()> {
        self.inner.save_write_request(request).await
    }

    async fn find_write_request(
        &self,
        id: &WriteRequestId,
    ) -> conclave::Result<Option<WriteRequest>> {
        let found = self.inner.find_write_request(id).await;
        tokio::task::yield_now().await;
        found
    }

    async fn update_write_request_status(
        &self,
        id: &WriteRequestId,
        status: WriteRequestStatus,
        approver: &str,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> conclave::Result<WriteRequest> {
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        self.inner
            .update_write_request_status(id, status, approver, at, reason)
            .await
    }

    async fn save_approval(&self, approval: &Approval) -> conclave::Result<()> {
        self.inner.save_approval(approval).await
    }

    async fn find_approval(&self, request_id: &WriteRequestId) -> conclave::Result<Option<Approval>> {
        self.inner.find_approval(request_id).await
    }

    async fn list_by_status(&self, status: WriteRequestStatus) -> conclave::Result<Vec<WriteRequest>> {
        self.inner.list_by_status(status).await
    }

    async fn save_commit(&self, record: &CommitRecord) -> conclave::Result<()> {
        self.inner.save_commit(record).await
    }

    async fn commits(&self, request_id: &WriteRequestId) -> conclave::Result<Vec<CommitRecord>> {
        self.inner.commits(request_id).await
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn meeting_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new(
        "meeting",
        vec![
            Step::streaming("transcriber"),
            Step::parallel(["extractor", "summarizer"]),
            Step::gated("sheet_writer"),
            Step::sequential("notifier"),
        ],
    )
}

/// Shared handles into the scripted adapters
struct Observed {
    sheet: Arc<Mutex<Vec<Value>>>,
    extractor_inputs: Arc<Mutex<Vec<Value>>>,
    summarizer_inputs: Arc<Mutex<Vec<Value>>>,
    notifier_inputs: Arc<Mutex<Vec<Value>>>,
}

fn register_meeting_agents(orch: &Orchestrator, commit_failures: usize) -> Observed {
    let (extractor, extractor_inputs) =
        Recorder::new(json!({"events": [{"title": "launch", "date": "2026-11-02"}]}));
    let (summarizer, summarizer_inputs) = Recorder::new(json!({"summary": "launch planned"}));
    let (notifier, notifier_inputs) = Recorder::new(json!({"sent": true}));
    let (writer, sheet) = SheetWriter::new(commit_failures);

    let agents: Vec<(AgentConfig, Arc<dyn TaskAdapter>)> = vec![
        (AgentConfig::new("transcriber", "speech-to-text"), Arc::new(Transcriber)),
        (
            AgentConfig::new("extractor", "event-extraction").with_ready_event("events_extracted"),
            Arc::new(extractor),
        ),
        (AgentConfig::new("summarizer", "summary"), Arc::new(summarizer)),
        (AgentConfig::new("sheet_writer", "spreadsheet"), Arc::new(writer)),
        (AgentConfig::new("notifier", "notification"), Arc::new(notifier)),
    ];
    for (config, adapter) in agents {
        orch.register_agent(config, adapter).unwrap();
    }

    Observed {
        sheet,
        extractor_inputs,
        summarizer_inputs,
        notifier_inputs,
    }
}

fn setup(commit_failures: usize) -> (Orchestrator, Observed) {
    setup_with_store(Arc::new(MemoryStore::new()), commit_failures)
}

fn setup_with_store(
    store: Arc<dyn WriteRequestStore>,
    commit_failures: usize,
) -> (Orchestrator, Observed) {
    let orch = Orchestrator::new(store, EventBus::default());
    orch.register_workflow(meeting_workflow()).unwrap();
    let observed = register_meeting_agents(&orch, commit_failures);
    (orch, observed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn meeting_pipeline_proposes_then_commits_on_approval() {
    let (orch, observed) = setup(0);
    let mut events = orch.subscribe();

    let run = assert_ok!(
        orch.execute_workflow("meeting", json!({"recording": "standup.wav"}))
            .await
    );

    // every step's result is in the final context, keyed by agent
    let ctx = &run.context;
    assert_eq!(ctx["recording"], "standup.wav");
    assert_eq!(ctx["transcriber"]["text"], "hello world");
    assert_eq!(ctx["summarizer"]["summary"], "launch planned");
    assert_eq!(ctx["sheet_writer"]["status"], "pending");
    assert_eq!(ctx["sheet_writer"]["target"], "sheet:meetings");
    assert_eq!(ctx["notifier"]["sent"], true);

    // the notifier saw the pending request, nothing was written yet
    let notifier_input = observed.notifier_inputs.lock()[0].clone();
    assert_eq!(notifier_input["sheet_writer"]["status"], "pending");
    assert!(observed.sheet.lock().is_empty());

    let status = orch.workflow_status(&run.execution_id).unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
    assert_eq!(status.current_step, 3);
    assert_eq!(Value::Object(status.results), Value::Object(run.context.clone()));

    let pending = orch.pending_write_requests().await.unwrap();
    assert_eq!(pending.len(), 1);
    let request_id = pending[0].id.clone();
    assert_eq!(
        request_id,
        WriteRequestId::derive(run.execution_id.as_str(), "sheet_writer")
    );

    let outcome = assert_ok!(
        orch.submit_approval(&request_id, "dana", Decision::Approve, None)
            .await
    );
    assert_eq!(outcome.request.status, WriteRequestStatus::Approved);
    assert_eq!(outcome.request.approver.as_deref(), Some("dana"));
    assert!(outcome.commit.unwrap().outcome.is_success());
    assert_eq!(observed.sheet.lock().len(), 1);
    assert_eq!(observed.sheet.lock()[0]["rows"][0]["title"], "launch");
    assert!(orch.pending_write_requests().await.unwrap().is_empty());

    let kinds: Vec<&str> = events.drain().iter().map(Event::kind).collect::<Vec<_>>();
    for expected in [
        "workflow_started",
        "step_started",
        "state_change",
        "stream_chunk",
        "log",
        "unit_ready",
        "step_completed",
        "write_request_created",
        "workflow_completed",
        "write_request_resolved",
        "write_committed",
    ] {
        assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
    }
    let position = |kind: &str| kinds.iter().position(|k| *k == kind).unwrap();
    assert!(position("workflow_started") < position("stream_chunk"));
    assert!(position("write_request_created") < position("workflow_completed"));
    assert!(position("workflow_completed") < position("write_request_resolved"));
    assert!(position("write_request_resolved") < position("write_committed"));
}

#[tokio::test]
async fn parallel_members_see_the_same_snapshot() {
    let (orch, observed) = setup(0);
    assert_ok!(orch.execute_workflow("meeting", json!({})).await);

    let extractor_input = observed.extractor_inputs.lock()[0].clone();
    let summarizer_input = observed.summarizer_inputs.lock()[0].clone();
    assert_eq!(extractor_input, summarizer_input);
    assert!(extractor_input.get("transcriber").is_some());
    assert!(extractor_input.get("summarizer").is_none());
    assert!(summarizer_input.get("extractor").is_none());
}

#[tokio::test]
async fn failing_parallel_member_aborts_without_partial_results() {
    let orch = Orchestrator::in_memory();
    let (first, _) = Recorder::new(json!({"n": 1}));
    let (sibling, _) = Recorder::new(json!({"n": 3}));
    let (after, after_inputs) = Recorder::new(json!({"n": 4}));
    orch.register_agent(AgentConfig::new("first", "t"), Arc::new(first)).unwrap();
    orch.register_agent(AgentConfig::new("calendar", "t"), Arc::new(Failing)).unwrap();
    orch.register_agent(AgentConfig::new("sibling", "t"), Arc::new(sibling)).unwrap();
    orch.register_agent(AgentConfig::new("after", "t"), Arc::new(after)).unwrap();
    orch.register_workflow(WorkflowDefinition::new(
        "fanout",
        vec![
            Step::sequential("first"),
            Step::parallel(["calendar", "sibling"]),
            Step::sequential("after"),
        ],
    ))
    .unwrap();
    let mut events = orch.subscribe();

    let err = assert_err!(orch.execute_workflow("fanout", json!({"seed": 0})).await);
    assert_eq!(err.reason_code(), "task_failure");
    let ConclaveError::StepFailed {
        execution_id,
        step,
        agent,
        context,
        ..
    } = err
    else {
        panic!("expected StepFailed");
    };
    assert_eq!(step, 1);
    assert_eq!(agent, "calendar");
    assert_eq!(context["first"], json!({"n": 1}));
    assert!(context.get("sibling").is_none());
    assert!(after_inputs.lock().is_empty());

    // both members settled before the step resolved
    let health = orch.health_check();
    assert_eq!(health["calendar"].state, AgentState::Failed);
    assert_eq!(health["sibling"].state, AgentState::Completed);
    assert_eq!(health["after"].state, AgentState::Idle);

    let status = orch.workflow_status(&execution_id).unwrap();
    assert_eq!(status.status, ExecutionStatus::Failed);
    assert!(status.error.unwrap().contains("calendar API unavailable"));
    assert!(status.results.get("sibling").is_none());

    let drained = events.drain();
    assert!(drained.iter().any(|e| matches!(
        e,
        Event::Error { agent, input, .. } if agent == "calendar" && input["first"]["n"] == 1
    )));
    assert!(drained
        .iter()
        .any(|e| matches!(e, Event::WorkflowFailed { step: 1, .. })));

    // a failed agent can be invoked again
    orch.reset_agent("calendar").unwrap();
    assert_eq!(orch.health_check()["calendar"].state, AgentState::Idle);
}

#[tokio::test]
async fn second_decision_is_rejected() {
    let (orch, observed) = setup(0);
    orch.execute_workflow("meeting", json!({})).await.unwrap();
    let request_id = orch.pending_write_requests().await.unwrap()[0].id.clone();

    orch.submit_approval(&request_id, "dana", Decision::Reject, Some("duplicate".into()))
        .await
        .unwrap();

    let err = assert_err!(
        orch.submit_approval(&request_id, "lee", Decision::Approve, None)
            .await
    );
    assert_eq!(err.reason_code(), "already_resolved");

    let stored = orch.store().find_write_request(&request_id).await.unwrap().unwrap();
    assert_eq!(stored.status, WriteRequestStatus::Rejected);
    assert_eq!(stored.approver.as_deref(), Some("dana"));
    assert_eq!(stored.rejection_reason.as_deref(), Some("duplicate"));
    assert!(observed.sheet.lock().is_empty());

    let err = assert_err!(orch.commit_write_request(&request_id).await);
    assert!(err.is_caller_error());
}

#[tokio::test]
async fn concurrent_decisions_resolve_once() {
    let store = Arc::new(YieldingStore::default());
    let (orch, observed) = setup_with_store(store.clone(), 0);
    orch.execute_workflow("meeting", json!({})).await.unwrap();
    let request_id = orch.pending_write_requests().await.unwrap()[0].id.clone();

    let (a, b) = tokio::join!(
        orch.submit_approval(&request_id, "dana", Decision::Approve, None),
        orch.submit_approval(&request_id, "lee", Decision::Reject, None),
    );
    let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1);
    let loser = a.err().or(b.err()).unwrap();
    assert_eq!(loser.reason_code(), "already_resolved");
    // both submissions passed the pending check; the store settled the race
    assert_eq!(store.status_updates.load(Ordering::SeqCst), 2);
    assert!(observed.sheet.lock().len() <= 1);

    let stored = orch.store().find_write_request(&request_id).await.unwrap().unwrap();
    assert!(!stored.is_pending());
    let approval = orch.store().find_approval(&request_id).await.unwrap().unwrap();
    assert_eq!(Some(approval.approver), stored.approver);
}

#[tokio::test]
async fn failed_commit_keeps_approval_and_can_be_retried() {
    let (orch, observed) = setup(1);
    orch.execute_workflow("meeting", json!({})).await.unwrap();
    let request_id = orch.pending_write_requests().await.unwrap()[0].id.clone();

    let outcome = orch
        .submit_approval(&request_id, "dana", Decision::Approve, Some("go".into()))
        .await
        .unwrap();
    assert_eq!(outcome.request.status, WriteRequestStatus::Approved);
    let commit = outcome.commit.unwrap();
    assert_eq!(
        commit.outcome,
        CommitOutcome::Failed {
            error: "sheet quota exceeded".into()
        }
    );
    assert_eq!(orch.health_check()["sheet_writer"].state, AgentState::Failed);
    assert!(observed.sheet.lock().is_empty());

    let record = assert_ok!(orch.commit_write_request(&request_id).await);
    assert_eq!(
        record.outcome,
        CommitOutcome::Succeeded {
            result: json!({"rows_written": 1})
        }
    );
    assert_eq!(observed.sheet.lock().len(), 1);
    assert_eq!(orch.store().commits(&request_id).await.unwrap().len(), 2);

    // committed writes are not repeated
    assert_err!(orch.commit_write_request(&request_id).await);
    assert_eq!(observed.sheet.lock().len(), 1);
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        store: StoreConfig::File {
            dir: dir.path().to_path_buf(),
        },
        workflows: vec![meeting_workflow()],
        ..EngineConfig::default()
    };

    let request_id = {
        let orch = Orchestrator::from_config(&config).await.unwrap();
        register_meeting_agents(&orch, 0);
        orch.execute_workflow("meeting", json!({})).await.unwrap();
        orch.pending_write_requests().await.unwrap()[0].id.clone()
    };

    let orch = Orchestrator::from_config(&config).await.unwrap();
    let observed = register_meeting_agents(&orch, 0);

    let pending = orch.pending_write_requests().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, request_id);

    let outcome = orch
        .submit_approval(&request_id, "dana", Decision::Approve, None)
        .await
        .unwrap();
    assert!(outcome.commit.unwrap().outcome.is_success());
    assert_eq!(observed.sheet.lock().len(), 1);

    // the decision is durable too
    let reopened = FileStore::new(dir.path()).await.unwrap();
    let stored = reopened.find_write_request(&request_id).await.unwrap().unwrap();
    assert_eq!(stored.status, WriteRequestStatus::Approved);
    assert_eq!(reopened.commits(&request_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn paused_agent_blocks_workflow_until_resumed() {
    let (orch, _observed) = setup(0);
    orch.pause_agent("notifier").unwrap();

    let err = orch.execute_workflow("meeting", json!({})).await.unwrap_err();
    assert_eq!(err.reason_code(), "validation_failure");
    assert_eq!(orch.health_check()["notifier"].state, AgentState::Paused);

    orch.resume_agent("notifier").unwrap();
    assert_ok!(orch.execute_workflow("meeting", json!({})).await);

    let states: HashMap<String, AgentState> = orch
        .health_check()
        .into_iter()
        .map(|(name, health)| (name, health.state))
        .collect();
    assert!(states.values().all(|s| *s == AgentState::Completed));
}

#[tokio::test]
async fn overlapping_runs_of_one_workflow_share_agents() {
    let (orch, observed) = setup(0);

    let (a, b) = tokio::join!(
        orch.execute_workflow("meeting", json!({"recording": "a.wav"})),
        orch.execute_workflow("meeting", json!({"recording": "b.wav"})),
    );
    let a = assert_ok!(a);
    let b = assert_ok!(b);
    assert_ne!(a.execution_id, b.execution_id);
    assert_eq!(a.context["recording"], "a.wav");
    assert_eq!(b.context["recording"], "b.wav");

    for run in [&a, &b] {
        let status = orch.workflow_status(&run.execution_id).unwrap();
        assert_eq!(status.status, ExecutionStatus::Completed);
    }
    assert_eq!(observed.notifier_inputs.lock().len(), 2);

    let pending = orch.pending_write_requests().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(orch
        .health_check()
        .values()
        .all(|h| h.state == AgentState::Completed));
}
