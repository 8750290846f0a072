//! Audit store for persisted RPC calls
//!
//! Only calls submitted with `persisted = true` are written here. The store records
//! the request and its status progression; the live wait stays in the registry.

use async_trait::async_trait;
use devrpc_shared::{now_ms, RpcId, RpcRequest, RpcStatus, TransitionResult};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("rpc {0} not found")]
    NotFound(RpcId),

    #[error("rpc {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: RpcId,
        from: RpcStatus,
        to: RpcStatus,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable view of one persisted call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRecord {
    pub request: RpcRequest,
    pub status: RpcStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub created_time: u64,
    pub updated_time: u64,
}

impl RpcRecord {
    /// Record for a call that was just registered
    pub fn queued(request: RpcRequest) -> Self {
        let now = now_ms();
        Self {
            request,
            status: RpcStatus::Queued,
            response: None,
            created_time: now,
            updated_time: now,
        }
    }
}

/// Storage backend for persisted calls
#[async_trait]
pub trait RpcStore: Send + Sync {
    /// Store `record`, replacing any earlier record with the same id
    ///
    /// The registry admits one live call per id, so a replaced record always belongs
    /// to a call that already resolved.
    async fn insert(&self, record: RpcRecord) -> Result<(), StoreError>;

    /// Advance the status of `id`; backward and post-terminal moves are rejected
    async fn update_status(
        &self,
        id: RpcId,
        status: RpcStatus,
        response: Option<String>,
    ) -> Result<(), StoreError>;

    /// Look up a record owned by `tenant_id`
    async fn get(&self, tenant_id: &str, id: RpcId) -> Result<Option<RpcRecord>, StoreError>;
}

/// Process-local store, used by the server binary and tests
#[derive(Default)]
pub struct InMemoryRpcStore {
    records: RwLock<HashMap<RpcId, RpcRecord>>,
}

impl InMemoryRpcStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RpcStore for InMemoryRpcStore {
    async fn insert(&self, record: RpcRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.insert(record.request.id, record);
        Ok(())
    }

    async fn update_status(
        &self,
        id: RpcId,
        status: RpcStatus,
        response: Option<String>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        match record.status.advance(status) {
            TransitionResult::Success(_) => {
                if response.is_some() {
                    record.response = response;
                }
                record.updated_time = now_ms();
                Ok(())
            }
            TransitionResult::Invalid { from, to } => {
                Err(StoreError::InvalidTransition { id, from, to })
            }
        }
    }

    async fn get(&self, tenant_id: &str, id: RpcId) -> Result<Option<RpcRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(&id)
            .filter(|record| record.request.tenant_id == tenant_id)
            .cloned())
    }
}
