//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::{EntityKey, EntitySnapshot, EntityType};
use super::operation::OperationId;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Shape of the divergence between local and server copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed, but different fields
    ConcurrentEditDisjoint,
    /// Both sides changed at least one common field to different values
    ConcurrentEditOverlapping,
    /// One side deleted while the other updated
    DeleteVsUpdate,
}

impl ConflictKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConcurrentEditDisjoint => "concurrent_edit_disjoint",
            Self::ConcurrentEditOverlapping => "concurrent_edit_overlapping",
            Self::DeleteVsUpdate => "delete_vs_update",
        }
    }

    /// Can be settled by a field-union merge without user input
    pub const fn is_auto_mergeable(self) -> bool {
        matches!(self, Self::ConcurrentEditDisjoint)
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concurrent_edit_disjoint" => Ok(Self::ConcurrentEditDisjoint),
            "concurrent_edit_overlapping" => Ok(Self::ConcurrentEditOverlapping),
            "delete_vs_update" => Ok(Self::DeleteVsUpdate),
            other => Err(Error::InvalidInput(format!("unknown conflict kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    ServerWins,
    Merged,
}

impl Resolution {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::ServerWins => "server_wins",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "local_wins" | "local" => Ok(Self::LocalWins),
            "server_wins" | "server" => Ok(Self::ServerWins),
            "merged" | "merge" => Ok(Self::Merged),
            other => Err(Error::InvalidInput(format!("unknown resolution: {other}"))),
        }
    }
}

/// Persisted evidence of divergent local/server state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub local_snapshot: EntitySnapshot,
    pub server_snapshot: EntitySnapshot,
    pub kind: ConflictKind,
    /// Fields changed on this device since the last sync
    pub local_changed_fields: Vec<String>,
    /// Fields changed on the server since the last sync
    pub server_changed_fields: Vec<String>,
    /// Operation that was being pushed when the conflict surfaced
    pub operation_id: Option<OperationId>,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
    /// Field set produced by a merge resolution
    pub merged_snapshot: Option<EntitySnapshot>,
    /// Detection timestamp (Unix ms)
    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl ConflictRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Fields both sides changed
    pub fn overlapping_fields(&self) -> Vec<String> {
        self.local_changed_fields
            .iter()
            .filter(|field| self.server_changed_fields.contains(field))
            .cloned()
            .collect()
    }
}
