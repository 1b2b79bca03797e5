//! Conflict resolution policies.

use std::sync::Arc;

use tracing::info;

use crate::error::{Error, Result};
use crate::models::{
    project_fields, ConflictId, ConflictRecord, EntitySnapshot, FieldMap, OperationKind, Payload,
    QueuedOperation, Resolution, DEFAULT_PRIORITY,
};
use crate::store::{LocalStore, ResolutionCommit};
use crate::util::now_ms;

/// Field-union merge: the server copy with the locally changed fields on top.
pub fn merge_fields(record: &ConflictRecord) -> FieldMap {
    let mut merged = record.server_snapshot.fields.clone();
    for name in &record.local_changed_fields {
        match record.local_snapshot.fields.get(name) {
            Some(value) => {
                merged.insert(name.clone(), value.clone());
            }
            None => {
                merged.remove(name);
            }
        }
    }
    merged
}

/// Applies resolutions and writes them through the local store
pub struct ConflictResolver {
    store: Arc<dyn LocalStore>,
    auto_merge_disjoint: bool,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn LocalStore>, auto_merge_disjoint: bool) -> Self {
        Self {
            store,
            auto_merge_disjoint,
        }
    }

    /// Settle a conflict without user input, when policy allows it.
    ///
    /// Returns `Ok(None)` when automatic merging is switched off. Kinds that
    /// require an explicit decision are an `InvalidState` error.
    pub async fn auto_resolve(&self, record: &ConflictRecord) -> Result<Option<ConflictRecord>> {
        if !record.kind.is_auto_mergeable() {
            return Err(Error::InvalidState(format!(
                "{} conflicts must be resolved explicitly",
                record.kind
            )));
        }
        if !self.auto_merge_disjoint {
            return Ok(None);
        }

        let merged = merge_fields(record);
        self.resolve(&record.id, Resolution::Merged, Some(merged))
            .await
            .map(Some)
    }

    /// Resolve a conflict with an explicit policy.
    pub async fn resolve(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged_fields: Option<FieldMap>,
    ) -> Result<ConflictRecord> {
        let mut record = self
            .store
            .get_conflict(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        if record.resolved {
            return Err(Error::InvalidState(format!(
                "conflict {id} is already resolved"
            )));
        }

        let base = record.server_snapshot.clone();
        let now = now_ms();
        let (local, payload) = match resolution {
            Resolution::LocalWins => local_wins(&record, &base)?,
            Resolution::ServerWins => (base.clone(), None),
            Resolution::Merged => {
                let fields = merged_fields.ok_or_else(|| {
                    Error::InvalidInput("a merged resolution needs a field map".into())
                })?;
                merged(&record, &base, &fields)?
            }
        };

        let key = record.key();
        let superseded_ops = self.store.superseded_operations(&record.id).await?;
        let priority = superseded_ops
            .iter()
            .map(|operation| operation.priority)
            .max()
            .unwrap_or(DEFAULT_PRIORITY);

        let follow_up = payload
            .map(|payload| QueuedOperation::new(key.entity_type, &key.entity_id, payload, priority))
            .transpose()?;

        record.resolved = true;
        record.resolution = Some(resolution);
        record.resolved_at = Some(now);
        if resolution == Resolution::Merged {
            record.merged_snapshot = Some(local.clone());
        }

        let commit = ResolutionCommit {
            conflict: record.clone(),
            base,
            local,
            superseded: superseded_ops.iter().map(|operation| operation.id).collect(),
            follow_up,
        };
        self.store.apply_resolution(&commit).await?;

        info!(
            conflict_id = %record.id,
            entity_id = %record.entity_id,
            resolution = %resolution,
            superseded = commit.superseded.len(),
            resubmitted = commit.follow_up.is_some(),
            "Conflict resolved"
        );
        Ok(record)
    }
}

/// Resubmit the local copy on top of the server's current version.
fn local_wins(
    record: &ConflictRecord,
    base: &EntitySnapshot,
) -> Result<(EntitySnapshot, Option<Payload>)> {
    let mut local = record.local_snapshot.clone();
    local.version = base.version;
    local.updated_at = now_ms();

    let payload = if local.deleted {
        (!base.deleted).then_some(Payload::Delete)
    } else {
        let fields = project_fields(record.entity_type, &local.fields);
        if base.deleted {
            Some(Payload::from_parts(
                record.entity_type,
                OperationKind::Create,
                &fields,
            )?)
        } else if fields.is_empty() {
            None
        } else {
            Some(Payload::from_parts(
                record.entity_type,
                OperationKind::Update,
                &fields,
            )?)
        }
    };
    Ok((local, payload))
}

/// Validate a caller-supplied field map and resubmit it.
fn merged(
    record: &ConflictRecord,
    base: &EntitySnapshot,
    fields: &FieldMap,
) -> Result<(EntitySnapshot, Option<Payload>)> {
    let kind = if base.deleted {
        OperationKind::Create
    } else {
        OperationKind::Update
    };
    let payload = Payload::from_parts(record.entity_type, kind, fields)?;
    let fields = payload.changed_fields()?;

    let mut local = base.clone();
    local.fields = fields;
    local.deleted = false;
    local.updated_at = now_ms();
    Ok((local, Some(payload)))
}
