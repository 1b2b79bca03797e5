//! Domain entity identity and snapshots

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Field-level view of an entity, keyed by field name.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// Domain entities that flow through the mutation queue
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Client,
    Photo,
    MaterialUsage,
}

impl EntityType {
    /// Every entity type, in declaration order
    pub const ALL: [Self; 4] = [Self::Job, Self::Client, Self::Photo, Self::MaterialUsage];

    /// Storage/wire name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Client => "client",
            Self::Photo => "photo",
            Self::MaterialUsage => "material_usage",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "job" => Ok(Self::Job),
            "client" => Ok(Self::Client),
            "photo" => Ok(Self::Photo),
            "material_usage" | "material" => Ok(Self::MaterialUsage),
            other => Err(Error::InvalidInput(format!("unknown entity type: {other}"))),
        }
    }
}

/// Identity of a single entity across local and remote copies
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Full copy of an entity as known by one side (local device or server)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: EntityType,
    /// Remote-canonical identifier
    pub entity_id: String,
    /// Server version this copy corresponds to (0 for never-synced local copies)
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub fields: FieldMap,
    /// Tombstone flag
    #[serde(default)]
    pub deleted: bool,
    /// Last modification timestamp (Unix ms)
    #[serde(default)]
    pub updated_at: i64,
}

impl EntitySnapshot {
    /// Create an unversioned snapshot with the given fields
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            version: 0,
            fields,
            deleted: false,
            updated_at: crate::util::now_ms(),
        }
    }

    #[must_use]
    pub const fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Mark this copy as deleted, keeping the last known fields
    #[must_use]
    pub const fn into_tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Local store row for an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub snapshot: EntitySnapshot,
    /// Has unsynced local changes
    pub dirty: bool,
    /// Server version of the last successful sync
    pub synced_version: Option<i64>,
    /// When the entity last synced (Unix ms)
    pub synced_at: Option<i64>,
    /// Fields as of the last successful sync
    pub shadow: Option<FieldMap>,
}

impl LocalEntity {
    /// True when the server holds a version this device has not seen yet.
    pub fn is_behind(&self, server_version: i64) -> bool {
        self.synced_version.is_none_or(|synced| server_version > synced)
    }
}
