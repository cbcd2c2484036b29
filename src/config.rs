//! Engine configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channel::DEFAULT_EVENT_CAPACITY;
use crate::error::{ConclaveError, Result};
use crate::store::{FileStore, MemoryStore, WriteRequestStore};
use crate::workflow::WorkflowDefinition;

/// Where write requests and approvals are persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    File { dir: PathBuf },
}

impl StoreConfig {
    /// Open the configured store
    pub async fn open(&self) -> Result<Arc<dyn WriteRequestStore>> {
        Ok(match self {
            Self::Memory => Arc::new(MemoryStore::new()),
            Self::File { dir } => Arc::new(FileStore::new(dir.clone()).await?),
        })
    }
}

/// Top-level engine configuration
///
/// ```toml
/// event_capacity = 256
///
/// [store]
/// kind = "file"
/// dir = "/var/lib/conclave"
///
/// [[workflows]]
/// name = "meeting"
///
/// [[workflows.steps]]
/// kind = "sequential"
/// agent = "transcriber"
/// streaming = true
///
/// [[workflows.steps]]
/// kind = "parallel"
/// members = [{ agent = "extractor" }, { agent = "sheet_writer", requires_approval = true }]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Events buffered per bus subscriber before it starts lagging
    pub event_capacity: usize,
    pub store: StoreConfig,
    /// Workflows registered when the engine is built
    pub workflows: Vec<WorkflowDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            store: StoreConfig::default(),
            workflows: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ConclaveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConclaveError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_capacity == 0 {
            return Err(ConclaveError::Config(
                "event_capacity must be at least 1".into(),
            ));
        }
        for workflow in &self.workflows {
            workflow
                .validate()
                .map_err(|e| ConclaveError::Config(e.to_string()))?;
        }
        Ok(())
    }
}
