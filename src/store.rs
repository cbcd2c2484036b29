//! Durable state for write requests, approvals and commit attempts
//!
//! The store is the authority of record for the approval protocol. Its
//! status update is conditional on the request still being `pending`, which
//! is what makes a second decision fail with `AlreadyResolved` even when two
//! submissions race.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::approval::{Approval, CommitRecord, WriteRequest, WriteRequestStatus};
use crate::error::{ConclaveError, Result};
use crate::protocol::WriteRequestId;

#[async_trait]
pub trait WriteRequestStore: Send + Sync {
    async fn save_write_request(&self, request: &WriteRequest) -> Result<()>;

    async fn find_write_request(&self, id: &WriteRequestId) -> Result<Option<WriteRequest>>;

    /// Move a pending request to `status`. Fails with `NotFound` for unknown
    /// ids and `AlreadyResolved` when the request is no longer pending.
    async fn update_write_request_status(
        &self,
        id: &WriteRequestId,
        status: WriteRequestStatus,
        approver: &str,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<WriteRequest>;

    async fn save_approval(&self, approval: &Approval) -> Result<()>;

    async fn find_approval(&self, request_id: &WriteRequestId) -> Result<Option<Approval>>;

    /// Requests in `status`, oldest first
    async fn list_by_status(&self, status: WriteRequestStatus) -> Result<Vec<WriteRequest>>;

    async fn list_pending(&self) -> Result<Vec<WriteRequest>> {
        self.list_by_status(WriteRequestStatus::Pending).await
    }

    async fn save_commit(&self, record: &CommitRecord) -> Result<()>;

    /// Commit attempts for a request, oldest first
    async fn commits(&self, request_id: &WriteRequestId) -> Result<Vec<CommitRecord>>;
}

fn sort_oldest_first(requests: &mut [WriteRequest]) {
    requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Default)]
struct MemoryState {
    requests: HashMap<WriteRequestId, WriteRequest>,
    approvals: HashMap<WriteRequestId, Approval>,
    commits: HashMap<WriteRequestId, Vec<CommitRecord>>,
}

/// Process-local store, for tests and single-run deployments
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WriteRequestStore for MemoryStore {
    async fn save_write_request(&self, request: &WriteRequest) -> Result<()> {
        self.state
            .lock()
            .requests
            .insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn find_write_request(&self, id: &WriteRequestId) -> Result<Option<WriteRequest>> {
        Ok(self.state.lock().requests.get(id).cloned())
    }

    async fn update_write_request_status(
        &self,
        id: &WriteRequestId,
        status: WriteRequestStatus,
        approver: &str,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<WriteRequest> {
        let mut state = self.state.lock();
        let request = state
            .requests
            .get_mut(id)
            .ok_or_else(|| ConclaveError::WriteRequestNotFound(id.clone()))?;
        request.resolve(status, approver, at, reason)?;
        Ok(request.clone())
    }

    async fn save_approval(&self, approval: &Approval) -> Result<()> {
        self.state
            .lock()
            .approvals
            .insert(approval.request_id.clone(), approval.clone());
        Ok(())
    }

    async fn find_approval(&self, request_id: &WriteRequestId) -> Result<Option<Approval>> {
        Ok(self.state.lock().approvals.get(request_id).cloned())
    }

    async fn list_by_status(&self, status: WriteRequestStatus) -> Result<Vec<WriteRequest>> {
        let mut requests: Vec<WriteRequest> = self
            .state
            .lock()
            .requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        sort_oldest_first(&mut requests);
        Ok(requests)
    }

    async fn save_commit(&self, record: &CommitRecord) -> Result<()> {
        self.state
            .lock()
            .commits
            .entry(record.request_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn commits(&self, request_id: &WriteRequestId) -> Result<Vec<CommitRecord>> {
        Ok(self
            .state
            .lock()
            .commits
            .get(request_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// JSON-file store, one document per record
///
/// Layout under the root directory:
/// `write_requests/<id>.json`, `approvals/<request id>.json`,
/// `commits/<request id>.json` (array of attempts).
pub struct FileStore {
    root: PathBuf,
    /// Serialises read-modify-write cycles within this process
    write_lock: tokio::sync::Mutex<()>,
}

const REQUESTS_DIR: &str = "write_requests";
const APPROVALS_DIR: &str = "approvals";
const COMMITS_DIR: &str = "commits";

impl FileStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [REQUESTS_DIR, APPROVALS_DIR, COMMITS_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), "Opened file store");
        Ok(Self {
            root,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, dir: &str, id: &WriteRequestId) -> Result<PathBuf> {
        let name = id.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ConclaveError::ValidationFailure(format!(
                "write request id '{name}' is not usable as a file name"
            )));
        }
        Ok(self.root.join(dir).join(format!("{name}.json")))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data).map(Some).map_err(|e| {
                ConclaveError::Store(format!("failed to parse {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temporary file and rename so readers never see partial JSON
    async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl WriteRequestStore for FileStore {
    async fn save_write_request(&self, request: &WriteRequest) -> Result<()> {
        let path = self.path(REQUESTS_DIR, &request.id)?;
        let _guard = self.write_lock.lock().await;
        Self::write_json(&path, request).await
    }

    async fn find_write_request(&self, id: &WriteRequestId) -> Result<Option<WriteRequest>> {
        Self::read_json(&self.path(REQUESTS_DIR, id)?).await
    }

    async fn update_write_request_status(
        &self,
        id: &WriteRequestId,
        status: WriteRequestStatus,
        approver: &str,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<WriteRequest> {
        let path = self.path(REQUESTS_DIR, id)?;
        let _guard = self.write_lock.lock().await;

        let mut request: WriteRequest = Self::read_json(&path)
            .await?
            .ok_or_else(|| ConclaveError::WriteRequestNotFound(id.clone()))?;
        request.resolve(status, approver, at, reason)?;
        Self::write_json(&path, &request).await?;
        Ok(request)
    }

    async fn save_approval(&self, approval: &Approval) -> Result<()> {
        let path = self.path(APPROVALS_DIR, &approval.request_id)?;
        let _guard = self.write_lock.lock().await;
        Self::write_json(&path, approval).await
    }

    async fn find_approval(&self, request_id: &WriteRequestId) -> Result<Option<Approval>> {
        Self::read_json(&self.path(APPROVALS_DIR, request_id)?).await
    }

    async fn list_by_status(&self, status: WriteRequestStatus) -> Result<Vec<WriteRequest>> {
        let mut entries = tokio::fs::read_dir(self.root.join(REQUESTS_DIR)).await?;
        let mut requests = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(request) = Self::read_json::<WriteRequest>(&path).await? {
                if request.status == status {
                    requests.push(request);
                }
            }
        }

        sort_oldest_first(&mut requests);
        Ok(requests)
    }

    async fn save_commit(&self, record: &CommitRecord) -> Result<()> {
        let path = self.path(COMMITS_DIR, &record.request_id)?;
        let _guard = self.write_lock.lock().await;

        let mut records: Vec<CommitRecord> = Self::read_json(&path).await?.unwrap_or_default();
        records.push(record.clone());
        Self::write_json(&path, &records).await
    }

    async fn commits(&self, request_id: &WriteRequestId) -> Result<Vec<CommitRecord>> {
        Ok(Self::read_json(&self.path(COMMITS_DIR, request_id)?)
            .await?
            .unwrap_or_default())
    }
}
