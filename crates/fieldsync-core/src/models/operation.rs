//! Queued operation model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityKey, EntityType};
use super::payload::Payload;
use crate::error::{Error, Result};

/// Default priority for routine updates
pub const DEFAULT_PRIORITY: i32 = 5;

/// Priority at or above which an operation is considered urgent
pub const HIGH_PRIORITY: i32 = 10;

/// A unique identifier for a queued operation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new unique operation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    /// Failed with a retryable error, waiting for its backoff gate
    Failed,
    /// Excluded from automatic dispatch until a manual action
    Dead,
}

impl OperationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Still headed for the server without manual action
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Dead)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(Error::InvalidInput(format!("unknown operation status: {other}"))),
        }
    }
}

/// Why an operation stopped being dispatched automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadReason {
    ExhaustedRetries,
    /// Server rejected the payload (validation / 4xx)
    Rejected,
}

impl DeadReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExhaustedRetries => "exhausted_retries",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for DeadReason {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exhausted_retries" => Ok(Self::ExhaustedRetries),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::InvalidInput(format!("unknown dead reason: {other}"))),
        }
    }
}

/// A durable pending mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: OperationId,
    pub entity_type: EntityType,
    /// Remote-canonical identifier of the target entity
    pub entity_id: String,
    pub kind: OperationKind,
    pub payload: Payload,
    /// Higher is more urgent
    pub priority: i32,
    /// `entity_type:entity_id:kind:sha256(payload)`, used to drop repeated submissions
    pub idempotency_key: String,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    /// Last status change (Unix ms)
    pub updated_at: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    /// Backoff gate for `Failed` operations (Unix ms)
    pub next_attempt_at: Option<i64>,
    /// Server version assumed when the operation was dispatched
    pub base_version: Option<i64>,
    pub dead_reason: Option<DeadReason>,
}

impl QueuedOperation {
    /// Build a validated operation ready to append
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        payload: Payload,
        priority: i32,
    ) -> Result<Self> {
        let entity_id = entity_id.into();
        if entity_id.trim().is_empty() {
            return Err(Error::InvalidInput("entity id cannot be empty".into()));
        }
        payload.validate(entity_type)?;

        let kind = payload.kind();
        let idempotency_key = format!(
            "{entity_type}:{entity_id}:{kind}:{}",
            payload.content_hash()?
        );
        let now = crate::util::now_ms();

        Ok(Self {
            id: OperationId::new(),
            entity_type,
            entity_id,
            kind,
            payload,
            priority,
            idempotency_key,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            last_error: None,
            status: OperationStatus::Pending,
            next_attempt_at: None,
            base_version: None,
            dead_reason: None,
        })
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Replay key for the remote authority.
    ///
    /// Stable across retries of this row and distinct for every appended
    /// operation, even when two operations carry the same payload.
    pub fn request_key(&self) -> String {
        self.id.to_string()
    }

    /// The error that took this operation out of automatic dispatch, if it is dead
    pub fn dead_error(&self) -> Option<Error> {
        match self.dead_reason? {
            DeadReason::ExhaustedRetries => Some(Error::ExhaustedRetries {
                operation_id: self.id.to_string(),
                attempts: self.retry_count,
            }),
            DeadReason::Rejected => Some(Error::Validation(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| "rejected by server".to_string()),
            )),
        }
    }

    pub const fn is_high_priority(&self, threshold: i32) -> bool {
        self.priority >= threshold
    }

    /// Eligible for automatic dispatch at `now`
    pub fn is_due(&self, now: i64, ignore_backoff: bool) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed => {
                ignore_backoff || self.next_attempt_at.is_none_or(|at| at <= now)
            }
            OperationStatus::InFlight | OperationStatus::Dead => false,
        }
    }
}
