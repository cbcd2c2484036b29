//! Agent implementation - a stateful worker wrapping one task adapter

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::approval::{Approval, WriteRequest};
use crate::channel::{Emitter, EventBus};
use crate::error::{ConclaveError, Result};
use crate::protocol::{validate_name, AgentId, AgentState, Event};

/// Scratch key holding the result of the last successful invocation
pub const LAST_RESULT_KEY: &str = "last_result";

/// Ready event emitted after a successful commit
pub const WRITE_COMMITTED_EVENT: &str = "write_committed";

/// Static description of an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Registry key, also the key its results are merged under
    pub name: String,
    /// Capability tag ("transcription", "summarization", ...)
    pub capability: String,
    /// Name of the unit-ready event emitted after a successful run
    pub ready_event: String,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        let name = name.into();
        let ready_event = format!("{name}_ready");
        Self {
            name,
            capability: capability.into(),
            ready_event,
        }
    }

    pub fn with_ready_event(mut self, event: impl Into<String>) -> Self {
        self.ready_event = event.into();
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_name("agent", &self.name)?;
        if self.ready_event.trim().is_empty() {
            return Err(ConclaveError::ValidationFailure(format!(
                "agent '{}' has an empty ready event",
                self.name
            )));
        }
        Ok(())
    }
}

/// Key/value storage private to one agent
#[derive(Clone, Default)]
pub struct Scratchpad {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl Scratchpad {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.write().insert(key.into(), value)
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().clone()
    }
}

/// Everything an adapter may touch while it runs
#[derive(Clone)]
pub struct TaskScope {
    /// The invoking agent's scratch storage
    pub scratch: Scratchpad,
    /// Log and stream handle onto the event bus
    pub emitter: Emitter,
}

/// The task-specific half of an agent
///
/// Adapters wrap one external collaborator (speech-to-text, an LLM call, a
/// spreadsheet API). They carry their own timeouts; the engine imposes none.
#[async_trait]
pub trait TaskAdapter: Send + Sync {
    /// Run the task. For approval-gated steps the result must be a
    /// [`WriteProposal`](crate::approval::WriteProposal) object.
    async fn execute(&self, input: Value, scope: &TaskScope) -> anyhow::Result<Value>;

    /// Perform the side effect of an approved write request
    async fn commit(
        &self,
        request: &WriteRequest,
        _approval: &Approval,
        _scope: &TaskScope,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("agent cannot commit write request {}", request.id)
    }
}

/// Point-in-time view of an agent for health reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub id: AgentId,
    pub state: AgentState,
    pub capability: String,
}

/// A single stateful worker
pub struct Agent {
    /// Unique identifier
    pub id: AgentId,
    /// Configuration
    pub config: AgentConfig,
    /// Current lifecycle state
    state: RwLock<AgentState>,
    /// Held for a whole invocation so overlapping callers queue up
    turn: tokio::sync::Mutex<()>,
    /// Private scratch storage
    scratch: Scratchpad,
    /// Task implementation
    adapter: Arc<dyn TaskAdapter>,
    /// Bus for state changes and task events
    bus: EventBus,
}

impl Agent {
    /// Create a new idle agent
    pub fn new(config: AgentConfig, adapter: Arc<dyn TaskAdapter>, bus: EventBus) -> Self {
        let id = AgentId::new();

        info!(
            agent_id = %id,
            agent = %config.name,
            capability = %config.capability,
            "Creating new agent"
        );

        Self {
            id,
            config,
            state: RwLock::new(AgentState::Idle),
            turn: tokio::sync::Mutex::new(()),
            scratch: Scratchpad::default(),
            adapter,
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get current state
    pub fn state(&self) -> AgentState {
        *self.state.read()
    }

    pub fn scratch(&self) -> &Scratchpad {
        &self.scratch
    }

    pub fn health(&self) -> AgentHealth {
        AgentHealth {
            id: self.id,
            state: self.state(),
            capability: self.config.capability.clone(),
        }
    }

    /// Run the task with `input` as a standalone invocation
    pub async fn execute(&self, input: Value, streaming: bool) -> Result<Value> {
        self.run(input, streaming, |result| Ok(result.clone())).await
    }

    /// Run the task and interpret its result with `finish`
    ///
    /// A `finish` error counts as a task failure: the agent ends `failed`.
    /// Invocations of one agent run one at a time, in arrival order.
    pub(crate) async fn run<T, F>(&self, input: Value, streaming: bool, finish: F) -> Result<T>
    where
        F: FnOnce(&Value) -> Result<T> + Send,
    {
        let _turn = self.turn.lock().await;
        self.begin()?;
        let scope = self.scope(streaming);

        let outcome = self
            .adapter
            .execute(input.clone(), &scope)
            .await
            .map_err(|e| ConclaveError::task(self.name(), &e))
            .and_then(|result| finish(&result).map(|out| (result, out)));

        match outcome {
            Ok((result, out)) => {
                self.succeed(result, &self.config.ready_event);
                Ok(out)
            }
            Err(err) => Err(self.fail(err, input)),
        }
    }

    /// Perform the side effect of an approved request
    pub async fn commit(&self, request: &WriteRequest, approval: &Approval) -> Result<Value> {
        let _turn = self.turn.lock().await;
        self.begin()?;
        let scope = self.scope(false);

        match self.adapter.commit(request, approval, &scope).await {
            Ok(result) => {
                self.succeed(result.clone(), WRITE_COMMITTED_EVENT);
                Ok(result)
            }
            Err(e) => {
                let err = ConclaveError::CommitFailure {
                    request_id: request.id.clone(),
                    message: format!("{e:#}"),
                };
                Err(self.fail(err, request.payload.clone()))
            }
        }
    }

    /// Return to `idle` and clear scratch storage
    pub fn reset(&self) -> Result<()> {
        self.transition(|current| match current {
            AgentState::Running => Err(ConclaveError::ValidationFailure(format!(
                "agent '{}' is running and cannot be reset",
                self.name()
            ))),
            _ => Ok(AgentState::Idle),
        })?;
        self.scratch.clear();
        debug!(agent = %self.name(), "Agent reset");
        Ok(())
    }

    /// Take the agent out of rotation until [`resume`](Self::resume)
    pub fn pause(&self) -> Result<()> {
        self.transition(|current| match current {
            AgentState::Running => Err(ConclaveError::ValidationFailure(format!(
                "agent '{}' is running and cannot be paused",
                self.name()
            ))),
            _ => Ok(AgentState::Paused),
        })
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(|current| match current {
            AgentState::Paused => Ok(AgentState::Idle),
            other => Err(ConclaveError::ValidationFailure(format!(
                "agent '{}' is {other}, not paused",
                self.name()
            ))),
        })
    }

    fn begin(&self) -> Result<()> {
        self.transition(|current| {
            if current.can_start() {
                Ok(AgentState::Running)
            } else {
                Err(ConclaveError::ValidationFailure(format!(
                    "agent '{}' is {current} and cannot be invoked",
                    self.name()
                )))
            }
        })
    }

    fn succeed(&self, result: Value, ready_event: &str) {
        self.scratch.insert(LAST_RESULT_KEY, result.clone());
        self.transition(|_| Ok(AgentState::Completed)).ok();
        self.bus.publish(Event::UnitReady {
            agent: self.name().to_string(),
            event: ready_event.to_string(),
            result,
            at: Utc::now(),
        });
    }

    fn fail(&self, err: ConclaveError, input: Value) -> ConclaveError {
        warn!(agent = %self.name(), error = %err, "Agent task failed");
        self.transition(|_| Ok(AgentState::Failed)).ok();
        self.bus.publish(Event::Error {
            agent: self.name().to_string(),
            error: err.to_string(),
            input,
            at: Utc::now(),
        });
        err
    }

    /// Apply a state change under the lock and emit it once the lock is released.
    /// Unchanged states emit nothing.
    fn transition<F>(&self, next: F) -> Result<()>
    where
        F: FnOnce(AgentState) -> Result<AgentState>,
    {
        let mut guard = self.state.write();
        let previous = *guard;
        let current = next(previous)?;
        *guard = current;
        drop(guard);

        if previous != current {
            debug!(agent = %self.name(), %previous, %current, "Agent state changed");
            self.bus.publish(Event::StateChange {
                agent: self.name().to_string(),
                agent_id: self.id,
                previous,
                current,
                at: Utc::now(),
            });
        }
        Ok(())
    }

    fn scope(&self, streaming: bool) -> TaskScope {
        TaskScope {
            scratch: self.scratch.clone(),
            emitter: Emitter::new(self.name(), self.bus.clone(), streaming),
        }
    }
}

/// Handle to an agent for external interaction
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<Agent>,
}

impl AgentHandle {
    pub fn new(agent: Agent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }

    pub fn id(&self) -> AgentId {
        self.inner.id
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = Agent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
