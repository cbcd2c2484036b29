//! Identifiers, agent states and the observability event model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::approval::{CommitOutcome, WriteRequest, WriteRequestStatus};
use crate::error::{ConclaveError, Result};

/// Unique identifier of an agent instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier of an approval decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApprovalId(Uuid);

impl ApprovalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ApprovalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a workflow execution: `<workflow>-<unix millis>-<sequence>`
    ExecutionId
);

string_id!(
    /// Deterministic identifier of a write request: `wr-<execution>-<agent>`
    WriteRequestId
);

impl WriteRequestId {
    /// Derive the id for the proposal made by `agent` within `creator`
    pub fn derive(creator: &str, agent: &str) -> Self {
        Self(format!("wr-{creator}-{agent}"))
    }
}

/// Check a workflow or agent name
///
/// Names are spliced into write request ids, and stores may use those ids
/// as file names, so path separators and a leading dot are refused.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ConclaveError::ValidationFailure(format!(
            "{kind} name must not be empty"
        )));
    }
    if name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(ConclaveError::ValidationFailure(format!(
            "{kind} name '{name}' must not contain path separators or start with '.'"
        )));
    }
    Ok(())
}

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

impl AgentState {
    /// Whether an invocation may start from this state
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An agent moved between lifecycle states
    StateChange {
        agent: String,
        agent_id: AgentId,
        previous: AgentState,
        current: AgentState,
        at: DateTime<Utc>,
    },

    /// Free-form log line from an agent or the engine
    Log {
        source: String,
        level: LogLevel,
        message: String,
        at: DateTime<Utc>,
    },

    /// Incremental output from an agent running in a streaming step
    StreamChunk {
        agent: String,
        chunk: Value,
        at: DateTime<Utc>,
    },

    /// An agent finished a unit of work ("events_extracted", "summary_ready", ...)
    UnitReady {
        agent: String,
        event: String,
        result: Value,
        at: DateTime<Utc>,
    },

    /// An agent task failed
    Error {
        agent: String,
        error: String,
        input: Value,
        at: DateTime<Utc>,
    },

    WorkflowStarted {
        execution_id: ExecutionId,
        workflow: String,
        at: DateTime<Utc>,
    },

    StepStarted {
        execution_id: ExecutionId,
        step: usize,
        agents: Vec<String>,
    },

    StepCompleted {
        execution_id: ExecutionId,
        step: usize,
        agents: Vec<String>,
    },

    WorkflowCompleted {
        execution_id: ExecutionId,
        context: Map<String, Value>,
        at: DateTime<Utc>,
    },

    WorkflowFailed {
        execution_id: ExecutionId,
        step: usize,
        error: String,
        context: Map<String, Value>,
        at: DateTime<Utc>,
    },

    WriteRequestCreated {
        request: WriteRequest,
    },

    WriteRequestResolved {
        request_id: WriteRequestId,
        status: WriteRequestStatus,
        approver: String,
        at: DateTime<Utc>,
    },

    WriteCommitted {
        request_id: WriteRequestId,
        outcome: CommitOutcome,
        at: DateTime<Utc>,
    },
}

impl Event {
    /// The serialized `type` tag of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => "state_change",
            Self::Log { .. } => "log",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::UnitReady { .. } => "unit_ready",
            Self::Error { .. } => "error",
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WriteRequestCreated { .. } => "write_request_created",
            Self::WriteRequestResolved { .. } => "write_request_resolved",
            Self::WriteCommitted { .. } => "write_committed",
        }
    }
}
