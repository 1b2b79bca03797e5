//! Conflict detection between a local copy and a newer server copy.
//!
//! Both sides are diffed against the shadow (fields as of the last sync).
//! Fields that changed on both sides to the same value are treated as
//! converged and dropped from both change sets.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{
    ConflictId, ConflictKind, ConflictRecord, EntitySnapshot, FieldMap, LocalEntity,
    OperationKind, OperationStatus, QueuedOperation,
};
use crate::store::LocalStore;
use crate::util::now_ms;

/// Outcome of comparing a server snapshot with local state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// Server copy is not newer than what this device already synced
    None,
    /// Server changes do not touch local work; local state was rebased
    Convergent,
    /// Conflict record persisted (new, or refreshed with the newer server copy)
    Conflict(ConflictRecord),
}

/// Local state as the user sees it: stored snapshot overlaid with queued changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalView {
    pub snapshot: EntitySnapshot,
    pub changed_fields: BTreeSet<String>,
}

impl LocalView {
    /// Build the view from the stored entity and its live operations (oldest first).
    pub fn build(
        server: &EntitySnapshot,
        entity: Option<&LocalEntity>,
        operations: &[QueuedOperation],
    ) -> Result<Self> {
        let mut snapshot = entity.map_or_else(
            || {
                let mut snapshot = server.clone();
                snapshot.fields = FieldMap::new();
                snapshot.version = 0;
                snapshot.deleted = false;
                snapshot
            },
            |entity| entity.snapshot.clone(),
        );
        let shadow = entity.and_then(|entity| entity.shadow.as_ref());

        let mut changed_fields = BTreeSet::new();
        for operation in operations {
            match operation.kind {
                OperationKind::Delete => snapshot.deleted = true,
                OperationKind::Create | OperationKind::Update => {
                    for (name, value) in operation.payload.changed_fields()? {
                        changed_fields.insert(name.clone());
                        snapshot.fields.insert(name, value);
                    }
                    if operation.kind == OperationKind::Create {
                        snapshot.deleted = false;
                    }
                }
            }
        }

        if let Some(shadow) = shadow {
            changed_fields.extend(changed_keys(shadow, &snapshot.fields));
        }
        snapshot.version = entity
            .and_then(|entity| entity.synced_version)
            .unwrap_or(snapshot.version);

        Ok(Self {
            snapshot,
            changed_fields,
        })
    }
}

/// Fields whose value differs between two maps (missing counts as null)
pub fn changed_keys(before: &FieldMap, after: &FieldMap) -> BTreeSet<String> {
    before
        .keys()
        .chain(after.keys())
        .filter(|name| {
            let old = before.get(*name).filter(|value| !value.is_null());
            let new = after.get(*name).filter(|value| !value.is_null());
            old != new
        })
        .cloned()
        .collect()
}

/// Classification of a divergence, before anything is persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    /// `None` when the two copies converge
    pub kind: Option<ConflictKind>,
    pub local_changed: Vec<String>,
    pub server_changed: Vec<String>,
}

/// Compare the local view with a server copy.
pub fn assess(
    local: &LocalView,
    shadow: Option<&FieldMap>,
    server: &EntitySnapshot,
) -> Assessment {
    let baseline = shadow.unwrap_or(&local.snapshot.fields);
    let mut server_changed = changed_keys(baseline, &server.fields);
    let mut local_changed = local.changed_fields.clone();

    let converged = local_changed
        .intersection(&server_changed)
        .filter(|name| local.snapshot.fields.get(*name) == server.fields.get(*name))
        .cloned()
        .collect::<Vec<_>>();
    for name in &converged {
        local_changed.remove(name);
        server_changed.remove(name);
    }

    let local_deleted = local.snapshot.deleted;
    let kind = match (local_deleted, server.deleted) {
        (true, true) => None,
        (true, false) if server_changed.is_empty() => None,
        (false, true) if local_changed.is_empty() => None,
        (true, false) | (false, true) => Some(ConflictKind::DeleteVsUpdate),
        (false, false) if local_changed.is_empty() || server_changed.is_empty() => None,
        (false, false) => {
            if local_changed.is_disjoint(&server_changed) {
                Some(ConflictKind::ConcurrentEditDisjoint)
            } else {
                Some(ConflictKind::ConcurrentEditOverlapping)
            }
        }
    };

    Assessment {
        kind,
        local_changed: local_changed.into_iter().collect(),
        server_changed: server_changed.into_iter().collect(),
    }
}

/// Detects conflicts and records them through the local store
pub struct ConflictDetector {
    store: Arc<dyn LocalStore>,
}

impl ConflictDetector {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Compare `server` with local state for the same entity.
    ///
    /// `originating` is the operation whose push reported a version mismatch;
    /// a detected conflict removes it from the queue in the same transaction.
    /// Without one (pull path) the server copy must be newer than the synced
    /// version to be considered at all.
    pub async fn detect(
        &self,
        server: &EntitySnapshot,
        originating: Option<&QueuedOperation>,
    ) -> Result<Divergence> {
        let key = server.key();
        let entity = self
            .store
            .read_entity(key.entity_type, &key.entity_id)
            .await?;

        if originating.is_none() && entity.as_ref().is_some_and(|entity| !entity.is_behind(server.version))
        {
            return Ok(Divergence::None);
        }

        let mut operations = self
            .store
            .list_pending()
            .await?
            .into_iter()
            .filter(|operation| {
                operation.key() == key && operation.status != OperationStatus::Dead
            })
            .collect::<Vec<_>>();
        operations.sort_by_key(|operation| operation.created_at);

        let shadow = entity.as_ref().and_then(|entity| entity.shadow.as_ref());
        let view = LocalView::build(server, entity.as_ref(), &operations)?;
        let assessment = assess(&view, shadow, server);

        if let Some(existing) = self.unresolved_for(server).await? {
            return self.refresh(existing, view, assessment, server).await;
        }

        let Some(kind) = assessment.kind else {
            self.rebase(&view, &assessment, server).await?;
            debug!(
                entity_id = %key.entity_id,
                version = server.version,
                "Server changes converge with local state"
            );
            return Ok(Divergence::Convergent);
        };

        let record = ConflictRecord {
            id: ConflictId::new(),
            entity_type: key.entity_type,
            entity_id: key.entity_id.clone(),
            local_snapshot: view.snapshot,
            server_snapshot: server.clone(),
            kind,
            local_changed_fields: assessment.local_changed,
            server_changed_fields: assessment.server_changed,
            operation_id: originating.map(|operation| operation.id),
            resolved: false,
            resolution: None,
            merged_snapshot: None,
            created_at: now_ms(),
            resolved_at: None,
        };

        self.store
            .record_conflict(&record, originating.map(|operation| &operation.id))
            .await?;

        warn!(
            conflict_id = %record.id,
            entity_id = %record.entity_id,
            kind = %record.kind,
            server_version = server.version,
            "Sync conflict detected"
        );
        Ok(Divergence::Conflict(record))
    }

    async fn unresolved_for(&self, server: &EntitySnapshot) -> Result<Option<ConflictRecord>> {
        let key = server.key();
        Ok(self
            .store
            .list_conflicts(true)
            .await?
            .into_iter()
            .find(|record| record.key() == key))
    }

    /// Carry a newer server copy into a still-open conflict.
    async fn refresh(
        &self,
        mut existing: ConflictRecord,
        view: LocalView,
        assessment: Assessment,
        server: &EntitySnapshot,
    ) -> Result<Divergence> {
        if server.version > existing.server_snapshot.version {
            existing.server_snapshot = server.clone();
            existing.local_snapshot = view.snapshot;
            if let Some(kind) = assessment.kind {
                existing.kind = kind;
            }
            existing.local_changed_fields = assessment.local_changed;
            existing.server_changed_fields = assessment.server_changed;
            self.store.update_conflict(&existing).await?;
            debug!(
                conflict_id = %existing.id,
                server_version = server.version,
                "Refreshed open conflict with newer server copy"
            );
        }
        Ok(Divergence::Conflict(existing))
    }

    /// Move the local copy onto the server version, keeping local changes on top.
    async fn rebase(
        &self,
        view: &LocalView,
        assessment: &Assessment,
        server: &EntitySnapshot,
    ) -> Result<()> {
        let mut rebased = server.clone();
        for name in &assessment.local_changed {
            match view.snapshot.fields.get(name) {
                Some(value) => {
                    rebased.fields.insert(name.clone(), value.clone());
                }
                None => {
                    rebased.fields.remove(name);
                }
            }
        }
        rebased.deleted = view.snapshot.deleted || server.deleted;
        rebased.updated_at = view.snapshot.updated_at.max(server.updated_at);

        self.store.write_entity(&rebased, false).await?;
        self.store.mark_synced(server, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{EntityFields, EntityType, JobFields, JobStatus, Payload};
    use crate::sync::{EnqueueRequest, MutationQueue, RetryManager};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    fn base_job() -> EntitySnapshot {
        EntitySnapshot::new(
            EntityType::Job,
            "J1",
            fields(&[
                ("title", json!("Boiler service")),
                ("status", json!("scheduled")),
            ]),
        )
        .with_version(1)
    }

    fn server_with(pairs: &[(&str, serde_json::Value)], version: i64) -> EntitySnapshot {
        let mut server = base_job().with_version(version);
        for (name, value) in pairs {
            server.fields.insert((*name).to_string(), value.clone());
        }
        server
    }

    async fn setup() -> (Arc<SqliteStore>, MutationQueue, ConflictDetector) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.mark_synced(&base_job(), true).await.unwrap();
        let queue = MutationQueue::new(store.clone(), RetryManager::default());
        let detector = ConflictDetector::new(store.clone());
        (store, queue, detector)
    }

    fn job_update(fields: JobFields) -> EnqueueRequest {
        EnqueueRequest::new(
            EntityType::Job,
            "J1",
            Payload::Update(EntityFields::Job(fields)),
        )
    }

    #[test]
    fn changed_keys_treats_missing_as_null() {
        let before = fields(&[("notes", json!(null)), ("title", json!("A"))]);
        let after = fields(&[("title", json!("B"))]);
        assert_eq!(
            changed_keys(&before, &after).into_iter().collect::<Vec<_>>(),
            vec!["title".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disjoint_field_edits_are_classified_disjoint() {
        let (_, queue, detector) = setup().await;
        queue
            .enqueue(job_update(JobFields {
                status: Some(JobStatus::Working),
                ..JobFields::default()
            }))
            .await
            .unwrap();

        let server = server_with(&[("notes", json!("Dog on site"))], 2);
        let Divergence::Conflict(record) = detector.detect(&server, None).await.unwrap() else {
            panic!("expected a conflict");
        };

        assert_eq!(record.kind, ConflictKind::ConcurrentEditDisjoint);
        assert_eq!(record.local_changed_fields, vec!["status".to_string()]);
        assert_eq!(record.server_changed_fields, vec!["notes".to_string()]);
        assert_eq!(record.local_snapshot.field("status"), Some(&json!("working")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_field_edits_overlap() {
        let (_, queue, detector) = setup().await;
        queue
            .enqueue(job_update(JobFields {
                status: Some(JobStatus::Working),
                ..JobFields::default()
            }))
            .await
            .unwrap();

        let server = server_with(&[("status", json!("cancelled"))], 2);
        let Divergence::Conflict(record) = detector.detect(&server, None).await.unwrap() else {
            panic!("expected a conflict");
        };
        assert_eq!(record.kind, ConflictKind::ConcurrentEditOverlapping);
        assert_eq!(record.overlapping_fields(), vec!["status".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_edits_converge() {
        let (store, queue, detector) = setup().await;
        queue
            .enqueue(job_update(JobFields {
                status: Some(JobStatus::Working),
                ..JobFields::default()
            }))
            .await
            .unwrap();

        let server = server_with(&[("status", json!("working"))], 2);
        assert_eq!(
            detector.detect(&server, None).await.unwrap(),
            Divergence::Convergent
        );

        let entity = store.read_entity(EntityType::Job, "J1").await.unwrap().unwrap();
        assert_eq!(entity.synced_version, Some(2));
        assert!(store.list_conflicts(true).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_delete_against_server_update() {
        let (_, queue, detector) = setup().await;
        queue
            .enqueue(EnqueueRequest::new(EntityType::Job, "J1", Payload::Delete))
            .await
            .unwrap();

        let server = server_with(&[("title", json!("Boiler service + flue"))], 2);
        let Divergence::Conflict(record) = detector.detect(&server, None).await.unwrap() else {
            panic!("expected a conflict");
        };
        assert_eq!(record.kind, ConflictKind::DeleteVsUpdate);
        assert!(record.local_snapshot.deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_delete_against_local_update() {
        let (_, queue, detector) = setup().await;
        queue
            .enqueue(job_update(JobFields {
                notes: Some("Bring ladder".into()),
                ..JobFields::default()
            }))
            .await
            .unwrap();

        let server = base_job().with_version(2).into_tombstone();
        let Divergence::Conflict(record) = detector.detect(&server, None).await.unwrap() else {
            panic!("expected a conflict");
        };
        assert_eq!(record.kind, ConflictKind::DeleteVsUpdate);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_server_copy_is_ignored_on_pull() {
        let (_, _, detector) = setup().await;
        assert_eq!(
            detector.detect(&base_job(), None).await.unwrap(),
            Divergence::None
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn push_conflict_removes_originating_operation() {
        let (store, queue, detector) = setup().await;
        queue
            .enqueue(job_update(JobFields {
                status: Some(JobStatus::Working),
                ..JobFields::default()
            }))
            .await
            .unwrap();
        let op = queue.dequeue_batch(1).await.unwrap().remove(0);

        let server = server_with(&[("status", json!("paused"))], 3);
        let divergence = detector.detect(&server, Some(&op)).await.unwrap();
        let Divergence::Conflict(record) = divergence else {
            panic!("expected a conflict");
        };

        assert_eq!(record.operation_id, Some(op.id));
        assert!(store.get_operation(&op.id).await.unwrap().is_none());
        assert_eq!(store.list_conflicts(true).await.unwrap(), vec![record]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_server_copy_refreshes_open_conflict() {
        let (store, queue, detector) = setup().await;
        queue
            .enqueue(job_update(JobFields {
                status: Some(JobStatus::Working),
                ..JobFields::default()
            }))
            .await
            .unwrap();

        let first = server_with(&[("status", json!("paused"))], 2);
        detector.detect(&first, None).await.unwrap();
        let newer = server_with(&[("status", json!("cancelled"))], 3);
        let Divergence::Conflict(record) = detector.detect(&newer, None).await.unwrap() else {
            panic!("expected the open conflict");
        };

        let open = store.list_conflicts(true).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, record.id);
        assert_eq!(open[0].server_snapshot.version, 3);
    }
}
