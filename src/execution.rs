//! Workflow execution records

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{ConclaveError, Result};
use crate::protocol::ExecutionId;

/// Status of a workflow execution. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Record of one workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow: String,
    pub status: ExecutionStatus,
    /// Index of the last step entered
    pub current_step: usize,
    /// Accumulated results keyed by agent name, seeded with the input
    pub results: Map<String, Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn start(id: ExecutionId, workflow: &str, input: Map<String, Value>) -> Self {
        Self {
            id,
            workflow: workflow.to_string(),
            status: ExecutionStatus::Running,
            current_step: 0,
            results: input,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ConclaveError::ValidationFailure(format!(
                "execution {} is already {:?}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn enter_step(&mut self, step: usize) -> Result<()> {
        self.ensure_running()?;
        self.current_step = step;
        Ok(())
    }

    /// Merge step results into the accumulated context
    pub fn merge(&mut self, outputs: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        self.ensure_running()?;
        self.results.extend(outputs);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.status = ExecutionStatus::Completed;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: &ConclaveError) -> Result<()> {
        self.ensure_running()?;
        self.status = ExecutionStatus::Failed;
        self.error = Some(error.to_string());
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

/// In-memory map of executions owned by the orchestrator
#[derive(Default)]
pub struct ExecutionRegistry {
    executions: RwLock<HashMap<ExecutionId, WorkflowExecution>>,
    sequence: AtomicU64,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh id: workflow name, wall-clock millis, monotonic sequence
    pub fn next_id(&self, workflow: &str) -> ExecutionId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        ExecutionId::from(format!(
            "{workflow}-{}-{seq}",
            Utc::now().timestamp_millis()
        ))
    }

    pub fn insert(&self, execution: WorkflowExecution) {
        self.executions
            .write()
            .insert(execution.id.clone(), execution);
    }

    /// Apply `f` to a stored execution
    pub fn update<T>(
        &self,
        id: &ExecutionId,
        f: impl FnOnce(&mut WorkflowExecution) -> Result<T>,
    ) -> Result<T> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| ConclaveError::ExecutionNotFound(id.clone()))?;
        f(execution).inspect_err(|e| {
            warn!(execution_id = %id, error = %e, "Execution update rejected");
        })
    }

    pub fn get(&self, id: &ExecutionId) -> Option<WorkflowExecution> {
        self.executions.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<ExecutionId> {
        self.executions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.executions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.read().is_empty()
    }
}
