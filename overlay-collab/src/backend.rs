//! Backend collaborator boundary.
//!
//! Business state (membership, roles, invites, chat history) lives behind a
//! remote service. The collaboration core only needs to read and write a
//! per-workspace JSON blob and to hand over recorded sessions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;

use crate::storage::SessionEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend rejected request: {0}")]
    Rejected(String),
}

/// Remote workspace service.
pub trait WorkspaceBackend: Send + Sync {
    /// Stored blob for `workspace`, if any.
    fn fetch_blob(
        &self,
        workspace: &str,
    ) -> impl Future<Output = Result<Option<Value>, BackendError>> + Send;

    /// Replace the blob for `workspace`.
    fn put_blob(
        &self,
        workspace: &str,
        blob: Value,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Submit a recorded session. Returns the backend's id for it.
    fn submit_events(
        &self,
        workspace: &str,
        events: Vec<SessionEvent>,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;
}

type Submission = (String, Vec<SessionEvent>);

/// In-process backend for tests and offline embedding.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<HashMap<String, Value>>,
    submissions: Mutex<HashMap<String, Vec<Submission>>>,
    offline: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Sessions submitted for `workspace`, oldest first.
    pub fn submissions(&self, workspace: &str) -> Vec<Submission> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workspace)
            .cloned()
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::Relaxed) {
            Err(BackendError::Unavailable("offline".into()))
        } else {
            Ok(())
        }
    }
}

impl WorkspaceBackend for MemoryBackend {
    async fn fetch_blob(&self, workspace: &str) -> Result<Option<Value>, BackendError> {
        self.check_online()?;
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workspace)
            .cloned())
    }

    async fn put_blob(&self, workspace: &str, blob: Value) -> Result<(), BackendError> {
        self.check_online()?;
        if !blob.is_object() {
            return Err(BackendError::Rejected("blob must be a JSON object".into()));
        }
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workspace.to_string(), blob);
        Ok(())
    }

    async fn submit_events(
        &self,
        workspace: &str,
        events: Vec<SessionEvent>,
    ) -> Result<String, BackendError> {
        self.check_online()?;
        let id = format!("session-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(workspace.to_string())
            .or_default()
            .push((id.clone(), events));
        Ok(id)
    }
}
