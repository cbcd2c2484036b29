//! Write requests, approvals and commit records
//!
//! A step that would mutate an external system instead produces a
//! [`WriteRequest`] in the `pending` state. A human decision ([`Approval`])
//! moves it to `approved` or `rejected`, exactly once. Only an approved
//! request is committed, and every commit attempt is kept as its own
//! [`CommitRecord`] so a failed commit can be retried without re-approval.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConclaveError, Result};
use crate::protocol::{ApprovalId, WriteRequestId};

/// Status of a write request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteRequestStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for WriteRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Human decision on a write request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    /// Status a pending request moves to under this decision
    pub fn resulting_status(self) -> WriteRequestStatus {
        match self {
            Self::Approve => WriteRequestStatus::Approved,
            Self::Reject => WriteRequestStatus::Rejected,
        }
    }
}

impl std::str::FromStr for Decision {
    type Err = ConclaveError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "approve" | "approved" => Ok(Self::Approve),
            "reject" | "rejected" => Ok(Self::Reject),
            other => Err(ConclaveError::ValidationFailure(format!(
                "unknown decision '{other}'"
            ))),
        }
    }
}

/// What an approval-gated agent returns instead of performing its write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteProposal {
    /// Logical destination, e.g. a named spreadsheet
    pub target: String,
    /// Opaque payload handed back to the agent on commit
    #[serde(default)]
    pub payload: Value,
}

impl WriteProposal {
    pub fn new(target: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            payload,
        }
    }

    /// Interpret an agent result as a proposal
    pub fn from_result(agent: &str, result: Value) -> Result<Self> {
        let proposal: Self = serde_json::from_value(result).map_err(|e| {
            ConclaveError::ValidationFailure(format!(
                "agent '{agent}' must return {{target, payload}} for an approval step: {e}"
            ))
        })?;

        if proposal.target.trim().is_empty() {
            return Err(ConclaveError::ValidationFailure(format!(
                "agent '{agent}' proposed a write with an empty target"
            )));
        }

        Ok(proposal)
    }
}

/// A durable proposal for an external side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub id: WriteRequestId,
    pub target: String,
    pub payload: Value,
    /// Originating workflow execution or session
    pub creator: String,
    /// Agent whose `commit` performs the write
    pub agent: String,
    pub status: WriteRequestStatus,
    pub created_at: DateTime<Utc>,
    pub approver: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Present only when rejected
    pub rejection_reason: Option<String>,
}

impl WriteRequest {
    /// Build the pending request for a proposal made by `agent` within `creator`
    pub fn pending(creator: &str, agent: &str, proposal: WriteProposal) -> Self {
        Self {
            id: WriteRequestId::derive(creator, agent),
            target: proposal.target,
            payload: proposal.payload,
            creator: creator.to_string(),
            agent: agent.to_string(),
            status: WriteRequestStatus::Pending,
            created_at: Utc::now(),
            approver: None,
            resolved_at: None,
            rejection_reason: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == WriteRequestStatus::Pending
    }

    /// Move out of `pending`. Fails with `AlreadyResolved` otherwise.
    pub fn resolve(
        &mut self,
        status: WriteRequestStatus,
        approver: &str,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<()> {
        if !self.is_pending() {
            return Err(ConclaveError::AlreadyResolved {
                id: self.id.clone(),
                status: self.status,
            });
        }
        if status == WriteRequestStatus::Pending {
            return Err(ConclaveError::ValidationFailure(
                "cannot resolve a write request back to pending".into(),
            ));
        }

        self.status = status;
        self.approver = Some(approver.to_string());
        self.resolved_at = Some(at);
        self.rejection_reason = match status {
            WriteRequestStatus::Rejected => reason,
            _ => None,
        };
        Ok(())
    }
}

/// A human decision resolving a write request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub request_id: WriteRequestId,
    pub approver: String,
    pub decision: Decision,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

impl Approval {
    pub fn new(
        request_id: WriteRequestId,
        approver: impl Into<String>,
        decision: Decision,
        comment: Option<String>,
    ) -> Self {
        Self {
            id: ApprovalId::new(),
            request_id,
            approver: approver.into(),
            decision,
            comment,
            at: Utc::now(),
        }
    }
}

/// Result of running the side effect of an approved request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Succeeded { result: Value },
    Failed { error: String },
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// One commit attempt for a write request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub request_id: WriteRequestId,
    pub outcome: CommitOutcome,
    pub at: DateTime<Utc>,
}

impl CommitRecord {
    pub fn new(request_id: WriteRequestId, outcome: CommitOutcome) -> Self {
        Self {
            request_id,
            outcome,
            at: Utc::now(),
        }
    }
}

/// What `submit_approval` hands back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub request: WriteRequest,
    pub approval: Approval,
    /// Present when the decision was `approve`
    pub commit: Option<CommitRecord>,
}
