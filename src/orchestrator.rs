//! Main orchestrator - runs workflows over registered agents and drives the
//! write-request approval protocol

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::agent::{Agent, AgentConfig, AgentHandle, AgentHealth, TaskAdapter};
use crate::approval::{
    Approval, ApprovalOutcome, CommitOutcome, CommitRecord, Decision, WriteProposal,
    WriteRequest, WriteRequestStatus,
};
use crate::channel::{EventBus, Subscription};
use crate::config::EngineConfig;
use crate::error::{ConclaveError, Result};
use crate::execution::{ExecutionRegistry, WorkflowExecution};
use crate::protocol::{Event, ExecutionId, WriteRequestId};
use crate::store::{MemoryStore, WriteRequestStore};
use crate::workflow::{Step, WorkflowDefinition, WorkflowRegistry};

/// Successful outcome of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub execution_id: ExecutionId,
    /// Input plus every step's result keyed by agent name
    pub context: Map<String, Value>,
}

/// One agent invocation within a resolved step
struct Invocation {
    agent: AgentHandle,
    streaming: bool,
    requires_approval: bool,
}

impl Invocation {
    fn name(&self) -> &str {
        self.agent.name()
    }
}

/// The orchestration engine
///
/// Owns the agent, workflow and execution registries. Write requests and
/// approvals live in the injected store.
pub struct Orchestrator {
    /// Registered agents by name
    agents: RwLock<HashMap<String, AgentHandle>>,
    /// Registered workflow definitions
    workflows: RwLock<WorkflowRegistry>,
    /// Execution records
    executions: ExecutionRegistry,
    /// Durable state for the approval protocol
    store: Arc<dyn WriteRequestStore>,
    /// Observability bus
    bus: EventBus,
}

impl Orchestrator {
    /// Create an orchestrator over the given store and bus
    pub fn new(store: Arc<dyn WriteRequestStore>, bus: EventBus) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            workflows: RwLock::new(WorkflowRegistry::new()),
            executions: ExecutionRegistry::new(),
            store,
            bus,
        }
    }

    /// Orchestrator with a process-local store and default bus
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), EventBus::default())
    }

    /// Build from configuration: open the store, size the bus, register workflows
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = config.store.open().await?;
        let orchestrator = Self::new(store, EventBus::new(config.event_capacity));

        for workflow in &config.workflows {
            orchestrator.register_workflow(workflow.clone())?;
        }

        info!(
            workflows = config.workflows.len(),
            store = ?config.store,
            "Orchestrator configured"
        );
        Ok(orchestrator)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn WriteRequestStore> {
        &self.store
    }

    /// Register an agent. Names are unique.
    pub fn register_agent(
        &self,
        config: AgentConfig,
        adapter: Arc<dyn TaskAdapter>,
    ) -> Result<AgentHandle> {
        config.validate()?;

        let mut agents = self.agents.write();
        if agents.contains_key(&config.name) {
            return Err(ConclaveError::ValidationFailure(format!(
                "agent '{}' is already registered",
                config.name
            )));
        }

        let name = config.name.clone();
        let handle = AgentHandle::new(Agent::new(config, adapter, self.bus.clone()));
        agents.insert(name, handle.clone());
        Ok(handle)
    }

    /// Register a workflow definition
    ///
    /// Agents are resolved when the workflow runs, so definitions may be
    /// registered before their agents.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<()> {
        let name = definition.name.clone();
        self.workflows.write().register(definition)?;
        info!(workflow = %name, "Registered workflow");
        Ok(())
    }

    pub fn agent(&self, name: &str) -> Option<AgentHandle> {
        self.agents.read().get(name).cloned()
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows.read().names()
    }

    fn resolve_agent(&self, name: &str) -> Result<AgentHandle> {
        self.agent(name)
            .ok_or_else(|| ConclaveError::AgentNotFound(name.to_string()))
    }

    /// Resolve every step's agents up front so an unknown agent fails
    /// before anything runs
    fn plan(&self, definition: &WorkflowDefinition) -> Result<Vec<Vec<Invocation>>> {
        let mut plan = Vec::with_capacity(definition.steps.len());
        for step in &definition.steps {
            let invocations = match step {
                Step::Sequential {
                    agent,
                    streaming,
                    requires_approval,
                } => vec![Invocation {
                    agent: self.resolve_agent(agent)?,
                    streaming: *streaming,
                    requires_approval: *requires_approval,
                }],
                Step::Parallel { members } => {
                    let mut group = Vec::with_capacity(members.len());
                    for member in members {
                        group.push(Invocation {
                            agent: self.resolve_agent(&member.agent)?,
                            streaming: false,
                            requires_approval: member.requires_approval,
                        });
                    }
                    group
                }
            };
            plan.push(invocations);
        }
        Ok(plan)
    }

    /// Run a registered workflow to completion
    ///
    /// Each step sees the input plus every earlier step's results. A failing
    /// step aborts the run with [`ConclaveError::StepFailed`], which carries
    /// the context accumulated before that step.
    #[instrument(skip(self, input))]
    pub async fn execute_workflow(&self, name: &str, input: Value) -> Result<WorkflowRun> {
        let definition = self
            .workflows
            .read()
            .get(name)
            .ok_or_else(|| ConclaveError::WorkflowNotFound(name.to_string()))?;
        let mut context = input_context(input)?;
        let plan = self.plan(&definition)?;

        let execution_id = self.executions.next_id(name);
        self.executions.insert(WorkflowExecution::start(
            execution_id.clone(),
            name,
            context.clone(),
        ));
        self.bus.publish(Event::WorkflowStarted {
            execution_id: execution_id.clone(),
            workflow: name.to_string(),
            at: Utc::now(),
        });
        info!(execution_id = %execution_id, steps = plan.len(), "Workflow started");

        for (index, step) in plan.iter().enumerate() {
            self.executions
                .update(&execution_id, |e| e.enter_step(index))?;
            let agents: Vec<String> = step.iter().map(|inv| inv.name().to_string()).collect();
            self.bus.publish(Event::StepStarted {
                execution_id: execution_id.clone(),
                step: index,
                agents: agents.clone(),
            });

            match self.run_step(&execution_id, step, &context).await {
                Ok(outputs) => {
                    self.executions
                        .update(&execution_id, |e| e.merge(outputs.clone()))?;
                    context.extend(outputs);
                    self.bus.publish(Event::StepCompleted {
                        execution_id: execution_id.clone(),
                        step: index,
                        agents,
                    });
                }
                Err((agent, err)) => {
                    return Err(self.fail_execution(execution_id, index, agent, context, err));
                }
            }
        }

        self.executions.update(&execution_id, |e| e.complete())?;
        self.bus.publish(Event::WorkflowCompleted {
            execution_id: execution_id.clone(),
            context: context.clone(),
            at: Utc::now(),
        });
        info!(execution_id = %execution_id, "Workflow completed");

        Ok(WorkflowRun {
            execution_id,
            context,
        })
    }

    /// Run every invocation of a step against one snapshot of the context
    ///
    /// All members settle before the step resolves, so no agent is left
    /// `running`. On failure the first failing member in declaration order
    /// is reported and no member result is kept.
    async fn run_step(
        &self,
        execution_id: &ExecutionId,
        step: &[Invocation],
        context: &Map<String, Value>,
    ) -> std::result::Result<Vec<(String, Value)>, (String, ConclaveError)> {
        let snapshot = Value::Object(context.clone());
        let settled = join_all(
            step.iter()
                .map(|inv| self.invoke(execution_id, inv, snapshot.clone())),
        )
        .await;

        let mut outputs = Vec::with_capacity(settled.len());
        for (inv, result) in step.iter().zip(settled) {
            match result {
                Ok(value) => outputs.push((inv.name().to_string(), value)),
                Err(err) => return Err((inv.name().to_string(), err)),
            }
        }
        Ok(outputs)
    }

    async fn invoke(
        &self,
        execution_id: &ExecutionId,
        inv: &Invocation,
        input: Value,
    ) -> Result<Value> {
        if !inv.requires_approval {
            return inv.agent.execute(input, inv.streaming).await;
        }

        let agent = inv.name();
        let request = inv
            .agent
            .run(input, inv.streaming, |result| {
                WriteProposal::from_result(agent, result.clone())
                    .map(|proposal| WriteRequest::pending(execution_id.as_str(), agent, proposal))
            })
            .await?;

        self.store.save_write_request(&request).await?;
        info!(
            request_id = %request.id,
            agent = %agent,
            target = %request.target,
            "Write request pending approval"
        );
        self.bus.publish(Event::WriteRequestCreated {
            request: request.clone(),
        });

        Ok(serde_json::to_value(&request)?)
    }

    fn fail_execution(
        &self,
        execution_id: ExecutionId,
        step: usize,
        agent: String,
        context: Map<String, Value>,
        err: ConclaveError,
    ) -> ConclaveError {
        if let Err(e) = self.executions.update(&execution_id, |e| e.fail(&err)) {
            warn!(execution_id = %execution_id, error = %e, "Could not mark execution failed");
        }
        error!(
            execution_id = %execution_id,
            step,
            agent = %agent,
            error = %err,
            "Workflow failed"
        );
        self.bus.publish(Event::WorkflowFailed {
            execution_id: execution_id.clone(),
            step,
            error: err.to_string(),
            context: context.clone(),
            at: Utc::now(),
        });

        ConclaveError::StepFailed {
            execution_id,
            step,
            agent,
            context: Box::new(context),
            source: Box::new(err),
        }
    }

    /// Invoke one agent outside any workflow
    #[instrument(skip(self, input))]
    pub async fn execute_agent(&self, name: &str, input: Value) -> Result<Value> {
        let agent = self.resolve_agent(name)?;
        agent.execute(input, false).await
    }

    /// Resolve a pending write request and, when approved, commit it
    ///
    /// A failed commit is recorded in the returned outcome; the approval
    /// stands and [`commit_write_request`](Self::commit_write_request) can
    /// retry it.
    #[instrument(skip(self, comment))]
    pub async fn submit_approval(
        &self,
        request_id: &WriteRequestId,
        approver: &str,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<ApprovalOutcome> {
        if approver.trim().is_empty() {
            return Err(ConclaveError::ValidationFailure(
                "approver id must not be empty".into(),
            ));
        }

        let request = self
            .store
            .find_write_request(request_id)
            .await?
            .ok_or_else(|| ConclaveError::WriteRequestNotFound(request_id.clone()))?;
        if !request.is_pending() {
            warn!(request_id = %request_id, status = %request.status, "Write request already resolved");
            return Err(ConclaveError::AlreadyResolved {
                id: request_id.clone(),
                status: request.status,
            });
        }

        let approval = Approval::new(request_id.clone(), approver, decision, comment.clone());
        let reason = match decision {
            Decision::Reject => comment,
            Decision::Approve => None,
        };
        let request = self
            .store
            .update_write_request_status(
                request_id,
                decision.resulting_status(),
                approver,
                approval.at,
                reason,
            )
            .await?;
        self.store.save_approval(&approval).await?;

        self.bus.publish(Event::WriteRequestResolved {
            request_id: request_id.clone(),
            status: request.status,
            approver: approver.to_string(),
            at: approval.at,
        });
        info!(request_id = %request_id, status = %request.status, approver, "Write request resolved");

        let commit = match decision {
            Decision::Approve => Some(self.run_commit(&request, &approval).await?),
            Decision::Reject => None,
        };

        Ok(ApprovalOutcome {
            request,
            approval,
            commit,
        })
    }

    /// Retry the side effect of an approved write request
    #[instrument(skip(self))]
    pub async fn commit_write_request(&self, request_id: &WriteRequestId) -> Result<CommitRecord> {
        let request = self
            .store
            .find_write_request(request_id)
            .await?
            .ok_or_else(|| ConclaveError::WriteRequestNotFound(request_id.clone()))?;
        if request.status != WriteRequestStatus::Approved {
            return Err(ConclaveError::ValidationFailure(format!(
                "write request {request_id} is {}, not approved",
                request.status
            )));
        }

        let previous = self.store.commits(request_id).await?;
        if previous.iter().any(|c| c.outcome.is_success()) {
            return Err(ConclaveError::ValidationFailure(format!(
                "write request {request_id} is already committed"
            )));
        }

        let approval = self.store.find_approval(request_id).await?.ok_or_else(|| {
            ConclaveError::Store(format!("approved write request {request_id} has no approval"))
        })?;

        let record = self.run_commit(&request, &approval).await?;
        match &record.outcome {
            CommitOutcome::Succeeded { .. } => Ok(record),
            CommitOutcome::Failed { error } => Err(ConclaveError::CommitFailure {
                request_id: request_id.clone(),
                message: error.clone(),
            }),
        }
    }

    async fn run_commit(&self, request: &WriteRequest, approval: &Approval) -> Result<CommitRecord> {
        let outcome = match self.resolve_agent(&request.agent) {
            Ok(agent) => match agent.commit(request, approval).await {
                Ok(result) => CommitOutcome::Succeeded { result },
                Err(ConclaveError::CommitFailure { message, .. }) => {
                    CommitOutcome::Failed { error: message }
                }
                Err(e) => CommitOutcome::Failed {
                    error: e.to_string(),
                },
            },
            Err(e) => CommitOutcome::Failed {
                error: e.to_string(),
            },
        };

        if let CommitOutcome::Failed { error } = &outcome {
            warn!(request_id = %request.id, error = %error, "Commit failed, approval stands");
        } else {
            info!(request_id = %request.id, "Write committed");
        }

        let record = CommitRecord::new(request.id.clone(), outcome);
        self.store.save_commit(&record).await?;
        self.bus.publish(Event::WriteCommitted {
            request_id: request.id.clone(),
            outcome: record.outcome.clone(),
            at: record.at,
        });
        Ok(record)
    }

    /// Snapshot of an execution record
    pub fn workflow_status(&self, execution_id: &ExecutionId) -> Result<WorkflowExecution> {
        self.executions
            .get(execution_id)
            .ok_or_else(|| ConclaveError::ExecutionNotFound(execution_id.clone()))
    }

    pub fn execution_ids(&self) -> Vec<ExecutionId> {
        self.executions.ids()
    }

    /// State and id of every registered agent
    pub fn health_check(&self) -> BTreeMap<String, AgentHealth> {
        self.agents
            .read()
            .iter()
            .map(|(name, agent)| (name.clone(), agent.health()))
            .collect()
    }

    pub async fn pending_write_requests(&self) -> Result<Vec<WriteRequest>> {
        self.store.list_pending().await
    }

    /// Return an agent to `idle` and clear its scratch storage
    pub fn reset_agent(&self, name: &str) -> Result<()> {
        self.resolve_agent(name)?.reset()
    }

    pub fn pause_agent(&self, name: &str) -> Result<()> {
        self.resolve_agent(name)?.pause()
    }

    pub fn resume_agent(&self, name: &str) -> Result<()> {
        self.resolve_agent(name)?.resume()
    }
}

/// Workflow input must be a JSON object; `null` stands for no input
fn input_context(input: Value) -> Result<Map<String, Value>> {
    match input {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ConclaveError::ValidationFailure(format!(
            "workflow input must be an object, got {other}"
        ))),
    }
}
