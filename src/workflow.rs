//! Workflow definitions and their registry

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};
use crate::protocol::validate_name;

/// One member of a parallel group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelMember {
    pub agent: String,
    #[serde(default)]
    pub requires_approval: bool,
}

impl ParallelMember {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            requires_approval: false,
        }
    }

    pub fn gated(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            requires_approval: true,
        }
    }
}

/// A single step of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Invoke one agent with the accumulated context
    Sequential {
        agent: String,
        #[serde(default)]
        streaming: bool,
        #[serde(default)]
        requires_approval: bool,
    },
    /// Invoke every member concurrently against the same context snapshot
    Parallel { members: Vec<ParallelMember> },
}

impl Step {
    pub fn sequential(agent: impl Into<String>) -> Self {
        Self::Sequential {
            agent: agent.into(),
            streaming: false,
            requires_approval: false,
        }
    }

    pub fn streaming(agent: impl Into<String>) -> Self {
        Self::Sequential {
            agent: agent.into(),
            streaming: true,
            requires_approval: false,
        }
    }

    /// A sequential step whose result is a write proposal
    pub fn gated(agent: impl Into<String>) -> Self {
        Self::Sequential {
            agent: agent.into(),
            streaming: false,
            requires_approval: true,
        }
    }

    pub fn parallel<I, M>(members: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<ParallelMember>,
    {
        Self::Parallel {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Names of the agents this step invokes, in declaration order
    pub fn agents(&self) -> Vec<&str> {
        match self {
            Self::Sequential { agent, .. } => vec![agent.as_str()],
            Self::Parallel { members } => members.iter().map(|m| m.agent.as_str()).collect(),
        }
    }
}

impl From<&str> for ParallelMember {
    fn from(agent: &str) -> Self {
        Self::new(agent)
    }
}

impl From<String> for ParallelMember {
    fn from(agent: String) -> Self {
        Self::new(agent)
    }
}

/// A named, ordered composition of steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Agents whose results must go through approval, in declaration order
    pub fn gated_agents(&self) -> Vec<&str> {
        self.steps
            .iter()
            .flat_map(|step| match step {
                Step::Sequential {
                    agent,
                    requires_approval: true,
                    ..
                } => vec![agent.as_str()],
                Step::Sequential { .. } => vec![],
                Step::Parallel { members } => members
                    .iter()
                    .filter(|m| m.requires_approval)
                    .map(|m| m.agent.as_str())
                    .collect(),
            })
            .collect()
    }

    /// Every agent referenced by any step, deduplicated, in first-use order
    pub fn agent_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .flat_map(Step::agents)
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Structural checks that need no knowledge of registered agents
    pub fn validate(&self) -> Result<()> {
        validate_name("workflow", &self.name)?;

        for (index, step) in self.steps.iter().enumerate() {
            if let Step::Parallel { members } = step {
                if members.is_empty() {
                    return Err(ConclaveError::ValidationFailure(format!(
                        "workflow '{}' step {index} is an empty parallel group",
                        self.name
                    )));
                }
            }

            let mut seen = HashSet::new();
            for agent in step.agents() {
                validate_name("agent", agent).map_err(|e| {
                    ConclaveError::ValidationFailure(format!(
                        "workflow '{}' step {index}: {e}",
                        self.name
                    ))
                })?;
                if !seen.insert(agent) {
                    return Err(ConclaveError::ValidationFailure(format!(
                        "workflow '{}' step {index} lists agent '{agent}' twice",
                        self.name
                    )));
                }
            }
        }

        // write request ids are derived from execution and agent
        let mut gated = HashSet::new();
        for agent in self.gated_agents() {
            if !gated.insert(agent) {
                return Err(ConclaveError::ValidationFailure(format!(
                    "workflow '{}' gates agent '{agent}' more than once",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Read-mostly registry of workflow definitions
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: BTreeMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition. Names are unique; re-registration is rejected.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;

        if self.definitions.contains_key(&definition.name) {
            return Err(ConclaveError::ValidationFailure(format!(
                "workflow '{}' is already registered",
                definition.name
            )));
        }

        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meeting_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "meeting",
            vec![
                Step::streaming("transcriber"),
                Step::parallel(["extractor", "summarizer"]),
                Step::parallel([ParallelMember::gated("sheet_writer"), "notifier".into()]),
            ],
        )
    }

    #[test]
    fn test_agent_names_dedup_in_order() {
        let mut def = meeting_workflow();
        def.steps.push(Step::sequential("summarizer"));
        assert_eq!(
            def.agent_names(),
            vec!["transcriber", "extractor", "summarizer", "sheet_writer", "notifier"]
        );
    }

    #[test]
    fn test_validate_ok() {
        assert!(meeting_workflow().validate().is_ok());
        assert!(WorkflowDefinition::new("noop", vec![]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_group() {
        let def = WorkflowDefinition::new("bad", vec![Step::Parallel { members: vec![] }]);
        let err = def.validate().unwrap_err();
        assert_eq!(err.reason_code(), "validation_failure");
    }

    #[test]
    fn test_validate_rejects_duplicate_member() {
        let def = WorkflowDefinition::new("bad", vec![Step::parallel(["a", "a"])]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_names() {
        assert!(WorkflowDefinition::new(" ", vec![]).validate().is_err());
        assert!(WorkflowDefinition::new("x", vec![Step::sequential("")])
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_path_like_names() {
        let def = WorkflowDefinition::new("team/meeting", vec![Step::gated("writer")]);
        assert_eq!(def.validate().unwrap_err().reason_code(), "validation_failure");

        let def = WorkflowDefinition::new("meeting", vec![Step::parallel([".writer", "b"])]);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("step 0"));

        let mut registry = WorkflowRegistry::new();
        assert!(registry
            .register(WorkflowDefinition::new("team\\meeting", vec![]))
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_validate_rejects_agent_gated_twice() {
        let def = WorkflowDefinition::new(
            "bad",
            vec![
                Step::gated("writer"),
                Step::parallel([ParallelMember::gated("writer")]),
            ],
        );
        assert_eq!(meeting_workflow().gated_agents(), vec!["sheet_writer"]);
        assert!(def.validate().is_err());

        // ungated reuse is fine
        let def = WorkflowDefinition::new(
            "ok",
            vec![Step::gated("writer"), Step::sequential("writer")],
        );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_registry() {
        let mut registry = WorkflowRegistry::new();
        assert!(registry.is_empty());

        registry.register(meeting_workflow()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("meeting").unwrap().steps.len(), 3);
        assert!(registry.get("missing").is_none());

        let err = registry.register(meeting_workflow()).unwrap_err();
        assert!(err.is_caller_error());
        assert_eq!(registry.names(), vec!["meeting".to_string()]);
    }

    #[test]
    fn test_step_deserialize() {
        let step: Step = serde_json::from_str(r#"{"kind":"sequential","agent":"a"}"#).unwrap();
        assert_eq!(step, Step::sequential("a"));

        let step: Step = serde_json::from_str(
            r#"{"kind":"parallel","members":[{"agent":"b","requires_approval":true}]}"#,
        )
        .unwrap();
        assert_eq!(step, Step::parallel([ParallelMember::gated("b")]));
    }
}
