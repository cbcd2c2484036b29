//! Conclave error types

use serde_json::{Map, Value};
use thiserror::Error;

use crate::approval::WriteRequestStatus;
use crate::protocol::{ExecutionId, WriteRequestId};

/// Result alias used throughout the engine
pub type Result<T> = std::result::Result<T, ConclaveError>;

/// Errors that can occur in the orchestration engine
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Unknown workflow definition
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Unknown agent
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Unknown write request
    #[error("Write request not found: {0}")]
    WriteRequestNotFound(WriteRequestId),

    /// Unknown workflow execution
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// A decision was already recorded for this write request
    #[error("Write request {id} already resolved as {status}")]
    AlreadyResolved {
        id: WriteRequestId,
        status: WriteRequestStatus,
    },

    /// An agent's underlying operation failed
    #[error("Task failed in agent '{agent}': {message}")]
    TaskFailure { agent: String, message: String },

    /// Malformed input or definition
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// The downstream side effect of an approved write failed
    #[error("Commit failed for write request {request_id}: {message}")]
    CommitFailure {
        request_id: WriteRequestId,
        message: String,
    },

    /// A workflow step failed, aborting the execution
    #[error("Workflow {execution_id} failed at step {step} ({agent}): {source}")]
    StepFailed {
        execution_id: ExecutionId,
        step: usize,
        agent: String,
        /// Context accumulated before the failing step
        context: Box<Map<String, Value>>,
        #[source]
        source: Box<ConclaveError>,
    },

    /// Durable store error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConclaveError {
    /// Stable machine-readable reason code
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound(_)
            | Self::AgentNotFound(_)
            | Self::WriteRequestNotFound(_)
            | Self::ExecutionNotFound(_) => "not_found",
            Self::AlreadyResolved { .. } => "already_resolved",
            Self::TaskFailure { .. } => "task_failure",
            Self::ValidationFailure(_) => "validation_failure",
            Self::CommitFailure { .. } => "commit_failure",
            Self::StepFailed { source, .. } => source.reason_code(),
            Self::Store(_) | Self::Io(_) => "store_failure",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the caller caused this error (as opposed to the system)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self.reason_code(),
            "not_found" | "already_resolved" | "validation_failure"
        )
    }

    pub(crate) fn task(agent: &str, err: &anyhow::Error) -> Self {
        Self::TaskFailure {
            agent: agent.to_string(),
            message: format!("{err:#}"),
        }
    }
}
