//! Remote apply adapter interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{EntitySnapshot, EntityType, QueuedOperation};

/// How the remote authority answered a single operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Success,
    /// Version mismatch; the server copy diverged from the operation's base
    Conflict,
    /// Network error, timeout or 5xx-class response
    Retryable,
    /// Validation or other 4xx rejection
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub status: ApplyStatus,
    #[serde(default)]
    pub server_snapshot: Option<EntitySnapshot>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApplyResponse {
    pub const fn success(server_snapshot: Option<EntitySnapshot>) -> Self {
        Self {
            status: ApplyStatus::Success,
            server_snapshot,
            error: None,
        }
    }

    pub const fn conflict(server_snapshot: EntitySnapshot) -> Self {
        Self {
            status: ApplyStatus::Conflict,
            server_snapshot: Some(server_snapshot),
            error: None,
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            status: ApplyStatus::Retryable,
            server_snapshot: None,
            error: Some(error.into()),
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            status: ApplyStatus::Fatal,
            server_snapshot: None,
            error: Some(error.into()),
        }
    }
}

/// Server changes since a watermark
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub snapshots: Vec<EntitySnapshot>,
    /// Watermark to resume from on the next pull (Unix ms, server clock)
    pub server_time: i64,
}

/// The networked service that accepts one operation at a time
#[async_trait]
pub trait RemoteApply: Send + Sync {
    /// Apply one operation. Replays carrying the same [`QueuedOperation::request_key`] must be harmless.
    async fn apply_operation(&self, operation: &QueuedOperation) -> Result<ApplyResponse>;

    /// Fetch server snapshots changed after `since` for the given entity types
    async fn fetch_changes_since(
        &self,
        since: Option<i64>,
        entity_types: &[EntityType],
    ) -> Result<ChangeBatch>;
}
