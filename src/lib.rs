//! # Conclave
//!
//! Agent orchestration engine with human approval of external writes.
//!
//! Independent agents are composed into named workflows. A workflow runs
//! its steps in order, each step either a single agent or a parallel group,
//! and every step sees the input plus all earlier results. Agents that write
//! to external systems do not write directly: they propose, a human
//! approves or rejects, and only an approved proposal is committed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │   Workflow   │  │    Agent     │  │  Execution   │               │
//! │  │   Registry   │  │   Registry   │  │   Records    │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └──────────┬─────────────────────┬──────────────────────┬─────────────┘
//!            │ steps               │ proposals            │ events
//!            ▼                     ▼                      ▼
//!   ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐
//!   │  Agent ─ Agent  │   │  Write Request  │   │    Event Bus    │
//!   │  (parallel)     │   │  Store          │   │  (broadcast)    │
//!   └─────────────────┘   └────────┬────────┘   └─────────────────┘
//!                                  │ approve
//!                                  ▼
//!                            ┌───────────┐
//!                            │  Commit   │
//!                            └───────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: A stateful worker wrapping one [`TaskAdapter`]
//! - **Workflow**: Ordered steps over registered agents
//! - **Execution**: The record of one workflow run
//! - **Write request**: A proposed external write awaiting a decision
//! - **Event bus**: Broadcast of every state change, log line and result

pub mod agent;
pub mod approval;
pub mod channel;
pub mod config;
pub mod error;
pub mod execution;
pub mod orchestrator;
pub mod protocol;
pub mod store;
pub mod workflow;

pub use agent::{Agent, AgentConfig, AgentHandle, AgentHealth, Scratchpad, TaskAdapter, TaskScope};
pub use approval::{
    Approval, ApprovalOutcome, CommitOutcome, CommitRecord, Decision, WriteProposal,
    WriteRequest, WriteRequestStatus,
};
pub use channel::{Emitter, EventBus, Subscription};
pub use config::{EngineConfig, StoreConfig};
pub use error::{ConclaveError, Result};
pub use execution::{ExecutionStatus, WorkflowExecution};
pub use orchestrator::{Orchestrator, WorkflowRun};
pub use protocol::{AgentId, AgentState, ApprovalId, Event, ExecutionId, LogLevel, WriteRequestId};
pub use store::{FileStore, MemoryStore, WriteRequestStore};
pub use workflow::{ParallelMember, Step, WorkflowDefinition};
