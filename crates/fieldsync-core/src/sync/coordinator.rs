//! Sync coordinator: drives push/pull cycles and owns the session state.
//!
//! One cycle runs at a time. A trigger that arrives while a cycle is running
//! only records a rerun request; the running cycle makes one more pass once
//! it settles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::detector::{ConflictDetector, Divergence};
use super::queue::{EnqueueOutcome, EnqueueRequest, MutationQueue};
use super::resolver::ConflictResolver;
use super::retry::{classify_error, FailureClass, RetryDecision, RetryManager};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    ConflictId, ConflictRecord, EntitySnapshot, FieldMap, OperationId, QueuedOperation,
    Resolution,
};
use crate::remote::{ApplyResponse, ApplyStatus, RemoteApply};
use crate::state::{SyncPhase, SyncSession, SyncStatus};
use crate::store::LocalStore;
use crate::util::now_ms;

/// What asked for a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Connectivity,
    Manual,
    Periodic,
    Foreground,
}

impl SyncTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Manual => "manual",
            Self::Periodic => "periodic",
            Self::Foreground => "foreground",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tally of one trigger's work (including coalesced reruns)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Push/pull passes executed
    pub passes: usize,
    pub pushed: usize,
    /// Version mismatches that turned out not to conflict
    pub rebased: usize,
    pub conflicts: usize,
    pub auto_merged: usize,
    pub retried: usize,
    pub dead: usize,
    pub rejected: usize,
    /// Server snapshots written over clean local copies
    pub pulled: usize,
    /// Server snapshots handed to the conflict detector
    pub deferred: usize,
    pub pull_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushOutcome {
    Succeeded,
    Rebased,
    Conflicted { auto_merged: bool },
    Retrying,
    Dead,
    Rejected,
}

impl CycleReport {
    fn record(&mut self, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Succeeded => self.pushed += 1,
            PushOutcome::Rebased => self.rebased += 1,
            PushOutcome::Conflicted { auto_merged } => {
                self.conflicts += 1;
                if auto_merged {
                    self.auto_merged += 1;
                }
            }
            PushOutcome::Retrying => self.retried += 1,
            PushOutcome::Dead => self.dead += 1,
            PushOutcome::Rejected => self.rejected += 1,
        }
    }
}

enum PullOutcome {
    Completed,
    Interrupted,
    Failed(String),
}

struct Inner {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApply>,
    config: SyncConfig,
    queue: MutationQueue,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    session: watch::Sender<SyncSession>,
    running: watch::Sender<bool>,
    initialized: AtomicBool,
    rerun: AtomicBool,
    force: AtomicBool,
    cancelled: AtomicBool,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

/// Orchestrates the queue, detector and resolver against a remote authority
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApply>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (session, _) = watch::channel(SyncSession::default());
        let (running, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                queue: MutationQueue::new(store.clone(), RetryManager::new(config.retry.clone())),
                detector: ConflictDetector::new(store.clone()),
                resolver: ConflictResolver::new(store.clone(), config.auto_merge_disjoint),
                store,
                remote,
                config,
                session,
                running,
                initialized: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                force: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                periodic: Mutex::new(None),
            }),
        })
    }

    /// Recover interrupted operations and load the session counters.
    pub async fn init(&self) -> Result<SyncStatus> {
        let recovered = self.inner.queue.recover().await?;
        self.inner.cancelled.store(false, Ordering::SeqCst);
        self.inner.refresh_session().await?;
        self.inner.initialized.store(true, Ordering::SeqCst);

        let status = self.get_sync_status();
        info!(
            recovered,
            pending = status.pending_operations,
            conflicts = status.conflicts,
            "Sync coordinator initialized"
        );
        Ok(status)
    }

    /// Stop the periodic trigger, cancel any running cycle and wait for it to settle.
    pub async fn teardown(&self) {
        self.inner.initialized.store(false, Ordering::SeqCst);
        self.cancel();

        let mut running = self.inner.running.subscribe();
        if running.wait_for(|running| !*running).await.is_err() {
            warn!("Sync cycle state channel closed during teardown");
        }
        if let Ok(mut slot) = self.inner.periodic.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        self.inner.set_phase(SyncPhase::Idle);
        info!("Sync coordinator torn down");
    }

    /// Queue a mutation.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        let outcome = self.inner.queue.enqueue(request).await?;
        self.inner.refresh_session().await?;
        Ok(outcome)
    }

    /// Write the optimistic snapshot and queue the mutation as one unit.
    pub async fn record_mutation(
        &self,
        request: EnqueueRequest,
        snapshot: &EntitySnapshot,
    ) -> Result<EnqueueOutcome> {
        let outcome = self.inner.queue.record_mutation(request, snapshot).await?;
        self.inner.refresh_session().await?;
        Ok(outcome)
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.inner.queue
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        self.inner.session.borrow().status()
    }

    /// Observe session changes
    pub fn subscribe(&self) -> watch::Receiver<SyncSession> {
        self.inner.session.subscribe()
    }

    /// Run a cycle now, ignoring backoff gates.
    pub async fn trigger_manual_sync(&self) -> Result<Option<CycleReport>> {
        self.trigger(SyncTrigger::Manual).await
    }

    /// Request a cycle.
    ///
    /// Returns `Ok(None)` when the request was folded into a running cycle.
    pub async fn trigger(&self, trigger: SyncTrigger) -> Result<Option<CycleReport>> {
        let inner = &self.inner;
        if !inner.initialized.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "sync coordinator is not initialized".into(),
            ));
        }

        if trigger == SyncTrigger::Manual {
            inner.force.store(true, Ordering::SeqCst);
        }
        if !inner.try_start() {
            inner.rerun.store(true, Ordering::SeqCst);
            debug!(%trigger, "Sync already running; request coalesced");
            return Ok(None);
        }

        inner.cancelled.store(false, Ordering::SeqCst);
        debug!(%trigger, "Sync cycle starting");

        let mut report = CycleReport::default();
        let result = loop {
            let forced = inner.force.swap(false, Ordering::SeqCst);
            if let Err(error) = inner.run_cycle(forced, &mut report).await {
                break Err(error);
            }
            if inner.is_cancelled() {
                break Ok(());
            }
            if inner.rerun.swap(false, Ordering::SeqCst) {
                continue;
            }

            inner.finish();
            // A trigger may have slipped in between the rerun check and finish.
            if inner.rerun.swap(false, Ordering::SeqCst) && inner.try_start() {
                continue;
            }
            info!(
                passes = report.passes,
                pushed = report.pushed,
                conflicts = report.conflicts,
                pulled = report.pulled,
                "Sync cycle finished"
            );
            return Ok(Some(report));
        };

        inner.rerun.store(false, Ordering::SeqCst);
        inner.finish();
        result.map(|()| Some(report))
    }

    /// Record connectivity; coming back online fires a sync.
    pub async fn set_online(&self, online: bool) -> Result<Option<CycleReport>> {
        let mut was_online = false;
        self.inner.session.send_modify(|session| {
            was_online = session.is_online;
            session.is_online = online;
        });
        if was_online == online {
            return Ok(None);
        }

        info!(online, "Connectivity changed");
        if online && self.inner.initialized.load(Ordering::SeqCst) {
            return self.trigger(SyncTrigger::Connectivity).await;
        }
        Ok(None)
    }

    /// Stop dispatching; in-flight calls complete and claimed operations are released.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Fire periodic triggers while online, replacing any previous timer.
    pub fn spawn_periodic(&self, interval: Duration) {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !coordinator.get_sync_status().is_online {
                    continue;
                }
                if let Err(error) = coordinator.trigger(SyncTrigger::Periodic).await {
                    error!(%error, "Periodic sync failed");
                }
            }
        });

        if let Ok(mut slot) = self.inner.periodic.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Unresolved conflicts, newest first
    pub async fn list_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.inner.store.list_conflicts(true).await
    }

    pub async fn resolve_conflict(
        &self,
        id: &ConflictId,
        resolution: Resolution,
        merged_fields: Option<FieldMap>,
    ) -> Result<ConflictRecord> {
        let record = self
            .inner
            .resolver
            .resolve(id, resolution, merged_fields)
            .await?;
        self.inner.refresh_session().await?;
        Ok(record)
    }

    pub async fn list_dead_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.inner.queue.list_dead().await
    }

    /// Requeue a dead operation with a fresh retry budget.
    pub async fn retry_operation(&self, id: &OperationId) -> Result<QueuedOperation> {
        let operation = self.inner.queue.retry_dead(id).await?;
        self.inner.refresh_session().await?;
        Ok(operation)
    }

    pub async fn discard_operation(&self, id: &OperationId) -> Result<QueuedOperation> {
        let operation = self.inner.queue.discard(id).await?;
        self.inner.refresh_session().await?;
        Ok(operation)
    }
}

impl Inner {
    fn try_start(&self) -> bool {
        self.running.send_if_modified(|running| {
            if *running {
                false
            } else {
                *running = true;
                true
            }
        })
    }

    fn finish(&self) {
        self.running.send_replace(false);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_online(&self) -> bool {
        self.session.borrow().is_online
    }

    fn should_stop(&self) -> bool {
        self.is_cancelled() || !self.is_online()
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.session.send_modify(|session| session.phase = phase);
    }

    fn fail(&self, error: Error) -> Error {
        error!(%error, "Sync cycle aborted");
        let message = error.to_string();
        self.session.send_modify(|session| {
            session.phase = SyncPhase::Error;
            session.last_error = Some(message);
        });
        error
    }

    async fn refresh_session(&self) -> Result<()> {
        let counts = self.queue.counts().await?;
        let conflicts = self.store.list_conflicts(true).await?.len();
        let last_sync = self.store.last_sync_timestamp().await?;
        self.session.send_modify(|session| {
            session.pending_operations = counts.live;
            session.dead_operations = counts.dead;
            session.conflicts = conflicts;
            session.last_sync_timestamp = last_sync;
        });
        Ok(())
    }

    async fn run_cycle(&self, forced: bool, report: &mut CycleReport) -> Result<()> {
        report.passes += 1;
        if !self.is_online() {
            debug!("Offline; skipping push and pull");
            self.set_phase(SyncPhase::Idle);
            return self.refresh_session().await;
        }

        let started = now_ms();
        self.session.send_modify(|session| {
            session.phase = SyncPhase::Pushing;
            session.last_error = None;
        });
        if let Err(error) = self.push_phase(forced.then_some(started), report).await {
            return Err(self.fail(error));
        }

        if self.is_cancelled() {
            self.set_phase(SyncPhase::Cancelled);
            return self.refresh_session().await;
        }

        self.set_phase(SyncPhase::Pulling);
        let outcome = match self.pull_phase(report).await {
            Ok(outcome) => outcome,
            Err(error) => return Err(self.fail(error)),
        };

        match outcome {
            PullOutcome::Completed => {
                report.pull_completed = true;
                self.set_phase(SyncPhase::Idle);
            }
            PullOutcome::Interrupted => self.set_phase(if self.is_cancelled() {
                SyncPhase::Cancelled
            } else {
                SyncPhase::Idle
            }),
            PullOutcome::Failed(message) => {
                warn!(error = %message, "Pull failed; watermark unchanged");
                self.session.send_modify(|session| {
                    session.phase = SyncPhase::Error;
                    session.last_error = Some(message);
                });
            }
        }

        self.refresh_session().await
    }

    async fn push_phase(&self, force_before: Option<i64>, report: &mut CycleReport) -> Result<()> {
        for _ in 0..self.config.max_batches_per_cycle {
            if self.should_stop() {
                break;
            }

            let batch = self
                .queue
                .dequeue_batch_at(self.config.batch_size, now_ms(), force_before)
                .await?;
            if batch.is_empty() {
                break;
            }

            let results = stream::iter(group_by_entity(batch))
                .map(|group| self.push_group(group))
                .buffer_unordered(self.config.max_concurrent_entities)
                .collect::<Vec<_>>()
                .await;

            let mut failure = None;
            for result in results {
                match result {
                    Ok(outcomes) => outcomes.into_iter().for_each(|outcome| report.record(outcome)),
                    Err(error) => failure = failure.or(Some(error)),
                }
            }
            if let Some(error) = failure {
                return Err(error);
            }

            self.refresh_session().await?;
        }
        Ok(())
    }

    /// Push one entity's operations in order, stopping at the first non-success.
    ///
    /// Operations not sent (or whose push errored before a transition) go back
    /// to pending, so an error never leaves the entity stuck in flight.
    async fn push_group(&self, group: Vec<QueuedOperation>) -> Result<Vec<PushOutcome>> {
        let mut outcomes = Vec::with_capacity(group.len());
        let mut remaining = group.into_iter();
        let mut failure = None;

        while let Some(operation) = remaining.next() {
            if self.should_stop() {
                self.queue.release(&operation.id).await?;
                break;
            }

            let id = operation.id;
            match self.push_one(operation).await {
                Ok(outcome) => {
                    outcomes.push(outcome);
                    if outcome != PushOutcome::Succeeded {
                        break;
                    }
                }
                Err(error) => {
                    if let Err(release_error) = self.queue.release(&id).await {
                        debug!(
                            operation_id = %id,
                            error = %release_error,
                            "Operation not released after push error"
                        );
                    }
                    failure = Some(error);
                    break;
                }
            }
        }

        for operation in remaining {
            if let Err(error) = self.queue.release(&operation.id).await {
                failure.get_or_insert(error);
            }
        }
        failure.map_or(Ok(outcomes), Err)
    }

    async fn push_one(&self, mut operation: QueuedOperation) -> Result<PushOutcome> {
        // Earlier operations in the same group may have moved the synced version.
        operation.base_version = self
            .store
            .read_entity(operation.entity_type, &operation.entity_id)
            .await?
            .and_then(|entity| entity.synced_version);

        let response = self.apply_with_timeout(&operation).await;
        let id = operation.id;

        match response.status {
            ApplyStatus::Success => {
                self.queue
                    .mark_succeeded(&id, response.server_snapshot.as_ref())
                    .await?;
                Ok(PushOutcome::Succeeded)
            }
            ApplyStatus::Conflict => {
                let Some(server) = response.server_snapshot else {
                    return self
                        .fail_retryable(&id, "conflict reported without a server copy")
                        .await;
                };

                match self.detector.detect(&server, Some(&operation)).await? {
                    Divergence::Conflict(record) => {
                        if record.operation_id != Some(id) {
                            self.queue.release(&id).await?;
                        }
                        let auto_merged = self.try_auto_merge(&record).await?;
                        Ok(PushOutcome::Conflicted { auto_merged })
                    }
                    Divergence::Convergent | Divergence::None => {
                        self.queue.release(&id).await?;
                        Ok(PushOutcome::Rebased)
                    }
                }
            }
            ApplyStatus::Retryable => {
                let error = response.error.as_deref().unwrap_or("retryable failure");
                self.fail_retryable(&id, error).await
            }
            ApplyStatus::Fatal => {
                let error = response.error.as_deref().unwrap_or("rejected by server");
                self.queue.mark_rejected(&id, error).await?;
                Ok(PushOutcome::Rejected)
            }
        }
    }

    async fn apply_with_timeout(&self, operation: &QueuedOperation) -> ApplyResponse {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.remote.apply_operation(operation)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => match classify_error(&error) {
                FailureClass::Retryable => ApplyResponse::retryable(error.to_string()),
                FailureClass::Fatal => ApplyResponse::fatal(error.to_string()),
            },
            Err(_) => ApplyResponse::retryable(Error::Timeout(timeout).to_string()),
        }
    }

    async fn fail_retryable(&self, id: &OperationId, error: &str) -> Result<PushOutcome> {
        Ok(match self.queue.mark_failed(id, error).await? {
            RetryDecision::Retry { .. } => PushOutcome::Retrying,
            RetryDecision::Exhausted { .. } => PushOutcome::Dead,
        })
    }

    /// Auto-merge a disjoint conflict when policy allows. Returns whether it merged.
    async fn try_auto_merge(&self, record: &ConflictRecord) -> Result<bool> {
        if record.resolved || !record.kind.is_auto_mergeable() {
            return Ok(false);
        }

        match self.resolver.auto_resolve(record).await {
            Ok(resolved) => Ok(resolved.is_some()),
            Err(error) if error.is_durability() => Err(error),
            Err(error) => {
                warn!(
                    conflict_id = %record.id,
                    %error,
                    "Automatic merge failed; conflict left for manual resolution"
                );
                Ok(false)
            }
        }
    }

    async fn pull_phase(&self, report: &mut CycleReport) -> Result<PullOutcome> {
        let since = self.store.last_sync_timestamp().await?;
        let scope = &self.config.entity_scope;
        let timeout = self.config.request_timeout();

        let batch =
            match tokio::time::timeout(timeout, self.remote.fetch_changes_since(since, scope)).await
            {
                Ok(Ok(batch)) => batch,
                Ok(Err(error)) => return Ok(PullOutcome::Failed(error.to_string())),
                Err(_) => return Ok(PullOutcome::Failed(Error::Timeout(timeout).to_string())),
            };

        for server in &batch.snapshots {
            if self.should_stop() {
                return Ok(PullOutcome::Interrupted);
            }
            if !scope.contains(&server.entity_type) {
                continue;
            }

            let key = server.key();
            let entity = self
                .store
                .read_entity(key.entity_type, &key.entity_id)
                .await?;
            let has_live = !self.queue.live_for(&key).await?.is_empty();
            let dirty = has_live || entity.as_ref().is_some_and(|entity| entity.dirty);

            if dirty {
                match self.detector.detect(server, None).await? {
                    Divergence::Conflict(record) => {
                        report.deferred += 1;
                        if self.try_auto_merge(&record).await? {
                            report.auto_merged += 1;
                        }
                    }
                    Divergence::Convergent => report.rebased += 1,
                    Divergence::None => {}
                }
            } else if entity
                .as_ref()
                .is_none_or(|entity| entity.is_behind(server.version))
            {
                self.store.mark_synced(server, true).await?;
                report.pulled += 1;
            }
        }

        self.store.set_last_sync_timestamp(batch.server_time).await?;
        debug!(
            server_time = batch.server_time,
            snapshots = batch.snapshots.len(),
            "Pull complete"
        );
        Ok(PullOutcome::Completed)
    }
}

/// Split a claimed batch into per-entity groups, keeping batch order within each group.
fn group_by_entity(batch: Vec<QueuedOperation>) -> Vec<Vec<QueuedOperation>> {
    let mut groups: Vec<Vec<QueuedOperation>> = Vec::new();
    for operation in batch {
        let key = operation.key();
        match groups.iter_mut().find(|group| group[0].key() == key) {
            Some(group) => group.push(operation),
            None => groups.push(vec![operation]),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::models::{
        ClientFields, ConflictKind, EntityFields, EntityType, JobFields, JobStatus,
        OperationKind, OperationStatus, Payload,
    };
    use crate::sync::test_support::{FakeRemote, Scripted};
    use crate::sync::RetryPolicy;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn instant_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 0,
            high_priority_base_delay_ms: 0,
            ..RetryPolicy::default()
        }
    }

    async fn coordinator_with(
        config: SyncConfig,
    ) -> (SyncCoordinator, Arc<SqliteStore>, Arc<FakeRemote>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let remote = Arc::new(FakeRemote::new());
        let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), config).unwrap();
        coordinator.init().await.unwrap();
        (coordinator, store, remote)
    }

    async fn online(config: SyncConfig) -> (SyncCoordinator, Arc<SqliteStore>, Arc<FakeRemote>) {
        let (coordinator, store, remote) = coordinator_with(config).await;
        coordinator.set_online(true).await.unwrap();
        (coordinator, store, remote)
    }

    fn create_job(entity_id: &str, title: &str) -> EnqueueRequest {
        EnqueueRequest::new(
            EntityType::Job,
            entity_id,
            Payload::Create(EntityFields::Job(JobFields {
                title: Some(title.into()),
                ..JobFields::default()
            })),
        )
    }

    fn job_status(entity_id: &str, status: JobStatus) -> EnqueueRequest {
        EnqueueRequest::new(
            EntityType::Job,
            entity_id,
            Payload::Update(EntityFields::Job(JobFields {
                status: Some(status),
                ..JobFields::default()
            })),
        )
    }

    /// Server-side job that this device has already pulled
    async fn synced_job(coordinator: &SyncCoordinator, remote: &FakeRemote) {
        remote.server_edit(
            EntityType::Job,
            "J1",
            &[("title", json!("Boiler service")), ("status", json!("scheduled"))],
        );
        coordinator.trigger_manual_sync().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_push_removes_operation() {
        let (coordinator, store, remote) = online(SyncConfig::default()).await;
        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();
        assert_eq!(coordinator.get_sync_status().pending_operations, 1);

        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.pushed, 1);
        assert!(report.pull_completed);

        let status = coordinator.get_sync_status();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.phase, SyncPhase::Idle);
        assert!(status.last_sync.is_some());

        let server = remote.snapshot(EntityType::Job, "J1").unwrap();
        assert_eq!(server.field("title"), Some(&json!("Install heat pump")));
        let entity = store.read_entity(EntityType::Job, "J1").await.unwrap().unwrap();
        assert!(!entity.dirty);
        assert_eq!(entity.synced_version, Some(server.version));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_cycle_never_calls_remote() {
        let (coordinator, _, remote) = coordinator_with(SyncConfig::default()).await;
        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();

        coordinator.trigger_manual_sync().await.unwrap();

        assert!(remote.calls().is_empty());
        let status = coordinator.get_sync_status();
        assert!(!status.is_online);
        assert_eq!(status.pending_operations, 1);
        assert_eq!(status.last_sync, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_triggers_sync() {
        let (coordinator, _, remote) = coordinator_with(SyncConfig::default()).await;
        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();

        let report = coordinator.set_online(true).await.unwrap().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(remote.calls().len(), 1);
        assert_eq!(coordinator.set_online(true).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn higher_priority_update_is_sent_first() {
        let (coordinator, _, remote) = online(SyncConfig::default()).await;
        synced_job(&coordinator, &remote).await;

        coordinator
            .enqueue(job_status("J1", JobStatus::EnCamino))
            .await
            .unwrap();
        coordinator
            .enqueue(job_status("J1", JobStatus::Completed).with_priority(10))
            .await
            .unwrap();

        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.pushed, 2);

        let calls = remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].priority, 10);
        assert_eq!(calls[1].priority, 5);
        assert_eq!(
            remote
                .snapshot(EntityType::Job, "J1")
                .unwrap()
                .field("status"),
            Some(&json!("en_camino"))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replay_after_lost_response_has_single_effect() {
        let config = SyncConfig::default().with_retry_policy(instant_retry());
        let (coordinator, _, remote) = online(config).await;
        remote.script(Scripted::ApplyThenDrop);

        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();
        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(report.pushed, 1);
        assert_eq!(remote.calls().len(), 2);
        assert_eq!(remote.effects(), 1);
        assert_eq!(coordinator.get_sync_status().pending_operations, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn five_retryable_failures_kill_operation() {
        let config = SyncConfig::default().with_retry_policy(instant_retry());
        let (coordinator, _, remote) = online(config).await;
        for _ in 0..5 {
            remote.script(Scripted::Respond(ApplyResponse::retryable(
                "503 service unavailable",
            )));
        }

        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();
        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.retried, 4);
        assert_eq!(report.dead, 1);

        let status = coordinator.get_sync_status();
        assert_eq!(status.pending_operations, 0);
        assert_eq!(status.dead_operations, 1);
        assert!(status.needs_attention());

        coordinator.trigger_manual_sync().await.unwrap();
        assert_eq!(remote.calls().len(), 5);

        let dead = coordinator.list_dead_operations().await.unwrap();
        assert_eq!(dead.len(), 1);
        coordinator.retry_operation(&dead[0].id).await.unwrap();
        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(coordinator.get_sync_status().dead_operations, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_rejection_marks_operation_dead() {
        let (coordinator, _, remote) = online(SyncConfig::default()).await;
        remote.script(Scripted::Fail(Error::Validation(
            "422 unknown client".into(),
        )));

        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();
        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();

        assert_eq!(report.rejected, 1);
        let dead = coordinator.list_dead_operations().await.unwrap();
        assert_eq!(dead[0].retry_count, 0);
        assert_eq!(
            dead[0].dead_reason,
            Some(crate::models::DeadReason::Rejected)
        );

        coordinator.discard_operation(&dead[0].id).await.unwrap();
        assert_eq!(coordinator.get_sync_status().dead_operations, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disjoint_push_conflict_auto_merges() {
        let (coordinator, store, remote) = online(SyncConfig::default()).await;
        synced_job(&coordinator, &remote).await;

        let mut local = store
            .read_entity(EntityType::Job, "J1")
            .await
            .unwrap()
            .unwrap()
            .snapshot;
        local.fields.insert("status".into(), json!("working"));
        coordinator
            .record_mutation(job_status("J1", JobStatus::Working), &local)
            .await
            .unwrap();
        remote.server_edit(EntityType::Job, "J1", &[("notes", json!("Dog on site"))]);

        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.auto_merged, 1);
        assert_eq!(report.pushed, 1);

        let server = remote.snapshot(EntityType::Job, "J1").unwrap();
        assert_eq!(server.field("status"), Some(&json!("working")));
        assert_eq!(server.field("notes"), Some(&json!("Dog on site")));

        assert!(coordinator.list_conflicts().await.unwrap().is_empty());
        let history = store.list_conflicts(false).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, ConflictKind::ConcurrentEditDisjoint);
        assert_eq!(history[0].resolution, Some(Resolution::Merged));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_vs_update_waits_for_user() {
        let (coordinator, _, remote) = online(SyncConfig::default()).await;
        synced_job(&coordinator, &remote).await;

        coordinator
            .enqueue(EnqueueRequest::new(EntityType::Job, "J1", Payload::Delete))
            .await
            .unwrap();
        remote.server_edit(EntityType::Job, "J1", &[("status", json!("working"))]);
        coordinator.trigger_manual_sync().await.unwrap();

        let conflicts = coordinator.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::DeleteVsUpdate);
        assert!(!conflicts[0].resolved);

        coordinator
            .enqueue(job_status("J1", JobStatus::Paused))
            .await
            .unwrap();
        let calls_before = remote.calls().len();
        coordinator.trigger_manual_sync().await.unwrap();
        assert_eq!(remote.calls().len(), calls_before);

        coordinator
            .resolve_conflict(&conflicts[0].id, Resolution::ServerWins, None)
            .await
            .unwrap();
        assert_eq!(coordinator.get_sync_status().conflicts, 0);

        coordinator.trigger_manual_sync().await.unwrap();
        let server = remote.snapshot(EntityType::Job, "J1").unwrap();
        assert!(!server.deleted);
        assert_eq!(server.field("status"), Some(&json!("paused")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_defers_to_detector_for_dirty_entity() {
        let config = SyncConfig::default().with_auto_merge_disjoint(false);
        let (coordinator, store, remote) = online(config).await;
        remote.server_edit(EntityType::Client, "C1", &[("name", json!("Acme Plumbing"))]);
        coordinator.trigger_manual_sync().await.unwrap();
        coordinator.set_online(false).await.unwrap();

        let mut local = store
            .read_entity(EntityType::Client, "C1")
            .await
            .unwrap()
            .unwrap()
            .snapshot;
        local.fields.insert("phone".into(), json!("555-0100"));
        coordinator
            .record_mutation(
                EnqueueRequest::new(
                    EntityType::Client,
                    "C1",
                    Payload::Update(EntityFields::Client(ClientFields {
                        phone: Some("555-0100".into()),
                        ..ClientFields::default()
                    })),
                ),
                &local,
            )
            .await
            .unwrap();
        remote.server_edit(
            EntityType::Client,
            "C1",
            &[("email", json!("office@acme.test"))],
        );
        remote.script(Scripted::Fail(Error::Network("connection refused".into())));

        let report = coordinator.set_online(true).await.unwrap().unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.pulled, 0);

        let entity = store
            .read_entity(EntityType::Client, "C1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.snapshot.fields, local.fields);
        assert_eq!(entity.synced_version, Some(1));
        assert!(entity.dirty);

        let conflicts = coordinator.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::ConcurrentEditDisjoint);
        assert_eq!(conflicts[0].operation_id, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_entities_are_overwritten_by_pull() {
        let (coordinator, store, remote) = online(SyncConfig::default()).await;
        synced_job(&coordinator, &remote).await;
        remote.server_delete(EntityType::Job, "J1").unwrap();

        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.pulled, 1);

        let entity = store.read_entity(EntityType::Job, "J1").await.unwrap().unwrap();
        assert!(entity.snapshot.deleted);
        assert_eq!(entity.synced_version, Some(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watermark_only_advances_after_complete_pull() {
        let (coordinator, _, remote) = online(SyncConfig::default()).await;
        let first = coordinator.get_sync_status().last_sync;

        remote.server_edit(EntityType::Job, "J1", &[("title", json!("Fit radiator"))]);
        remote.fail_feed("502 bad gateway");
        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert!(!report.pull_completed);

        let status = coordinator.get_sync_status();
        assert_eq!(status.last_sync, first);
        assert_eq!(status.phase, SyncPhase::Error);
        assert!(status.last_error.unwrap().contains("502"));

        coordinator.trigger_manual_sync().await.unwrap();
        let status = coordinator.get_sync_status();
        assert!(status.last_sync > first);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_remote_call_times_out_as_retryable() {
        let config = SyncConfig::default().with_request_timeout(Duration::from_millis(50));
        let (coordinator, _, remote) = online(config).await;
        remote.set_delay(Duration::from_millis(300));

        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();
        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.retried, 1);

        let queued = coordinator.queue().list().await.unwrap();
        assert_eq!(queued[0].status, OperationStatus::Failed);
        assert!(queued[0].last_error.as_deref().unwrap().contains("timed out"));
        assert_eq!(remote.effects(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_triggers_are_coalesced() {
        let (coordinator, _, remote) = online(SyncConfig::default()).await;
        remote.set_delay(Duration::from_millis(200));
        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.trigger_manual_sync().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let coalesced = coordinator.trigger(SyncTrigger::Foreground).await.unwrap();
        assert_eq!(coalesced, None);

        let report = running.await.unwrap().unwrap().unwrap();
        assert_eq!(report.passes, 2);
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_timer_drains_queue() {
        let (coordinator, _, _) = online(SyncConfig::default()).await;
        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();

        coordinator.spawn_periodic(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(coordinator.get_sync_status().pending_operations, 0);

        coordinator.teardown().await;
        assert!(matches!(
            coordinator.trigger_manual_sync().await.unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_see_queue_changes() {
        let (coordinator, _, _) = coordinator_with(SyncConfig::default()).await;
        let mut receiver = coordinator.subscribe();

        coordinator
            .enqueue(create_job("J1", "Install heat pump"))
            .await
            .unwrap();

        assert!(receiver.has_changed().unwrap());
        assert_eq!(receiver.borrow_and_update().pending_operations, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupted_operations_recover_after_restart() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("fieldsync.db");

        {
            let store = Arc::new(SqliteStore::open(&db_path).unwrap());
            let queue = MutationQueue::new(store, RetryManager::default());
            queue.enqueue(create_job("J1", "Install heat pump")).await.unwrap();
            let claimed = queue.dequeue_batch(1).await.unwrap();
            assert_eq!(claimed[0].status, OperationStatus::InFlight);
        }

        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let remote = Arc::new(FakeRemote::new());
        let coordinator =
            SyncCoordinator::new(store.clone(), remote.clone(), SyncConfig::default()).unwrap();
        let status = coordinator.init().await.unwrap();
        assert_eq!(status.pending_operations, 1);

        let queued = coordinator.queue().list().await.unwrap();
        assert_eq!(queued[0].status, OperationStatus::Pending);
        assert_eq!(queued[0].kind, OperationKind::Create);

        coordinator.set_online(true).await.unwrap();
        assert_eq!(coordinator.get_sync_status().pending_operations, 0);
        assert_eq!(remote.effects(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn returning_to_an_earlier_value_still_reaches_server() {
        let (coordinator, store, remote) = online(SyncConfig::default()).await;
        synced_job(&coordinator, &remote).await;

        for status in [JobStatus::Working, JobStatus::Paused, JobStatus::Working] {
            coordinator.enqueue(job_status("J1", status)).await.unwrap();
            let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
            assert_eq!(report.pushed, 1);
        }

        assert_eq!(remote.effects(), 3);
        let server = remote.snapshot(EntityType::Job, "J1").unwrap();
        assert_eq!(server.field("status"), Some(&json!("working")));
        assert_eq!(server.version, 4);

        let entity = store.read_entity(EntityType::Job, "J1").await.unwrap().unwrap();
        assert_eq!(entity.synced_version, Some(4));
        assert_eq!(entity.snapshot.field("status"), Some(&json!("working")));
        assert!(!entity.dirty);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_failure_mid_group_releases_claimed_operations() {
        let config = SyncConfig::default().with_auto_merge_disjoint(false);
        let (coordinator, store, remote) = online(config).await;
        synced_job(&coordinator, &remote).await;
        remote.server_edit(EntityType::Job, "J1", &[("status", json!("cancelled"))]);

        coordinator
            .enqueue(job_status("J1", JobStatus::Working))
            .await
            .unwrap();
        coordinator
            .enqueue(job_status("J1", JobStatus::Paused))
            .await
            .unwrap();
        store
            .execute_batch(
                "CREATE TRIGGER reject_conflicts BEFORE INSERT ON sync_conflicts
                 BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
            )
            .await
            .unwrap();

        let error = coordinator.trigger_manual_sync().await.unwrap_err();
        assert!(error.is_durability());
        assert_eq!(coordinator.get_sync_status().phase, SyncPhase::Error);
        let statuses = store
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.status)
            .collect::<Vec<_>>();
        assert_eq!(statuses, vec![OperationStatus::Pending, OperationStatus::Pending]);

        store
            .execute_batch("DROP TRIGGER reject_conflicts;")
            .await
            .unwrap();
        let report = coordinator.trigger_manual_sync().await.unwrap().unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(coordinator.list_conflicts().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_during_remote_call_keeps_result_and_releases_rest() {
        let (coordinator, store, remote) = online(SyncConfig::default()).await;
        synced_job(&coordinator, &remote).await;
        coordinator
            .enqueue(job_status("J1", JobStatus::EnCamino))
            .await
            .unwrap();
        coordinator
            .enqueue(job_status("J1", JobStatus::Working))
            .await
            .unwrap();
        remote.set_delay(Duration::from_millis(200));

        let running = coordinator.clone();
        let cycle = tokio::spawn(async move { running.trigger_manual_sync().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.cancel();

        let report = cycle.await.unwrap().unwrap().unwrap();
        assert_eq!(report.pushed, 1);
        assert!(!report.pull_completed);
        assert_eq!(remote.effects(), 1);
        assert_eq!(
            remote
                .snapshot(EntityType::Job, "J1")
                .unwrap()
                .field("status"),
            Some(&json!("en_camino"))
        );
        assert_eq!(coordinator.get_sync_status().phase, SyncPhase::Cancelled);

        let remaining = store.list_pending().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, OperationStatus::Pending);
    }

    #[test]
    fn groups_keep_batch_order_per_entity() {
        let ops = ["J1", "J2", "J1"]
            .into_iter()
            .map(|entity_id| {
                QueuedOperation::new(
                    EntityType::Job,
                    entity_id,
                    Payload::Update(EntityFields::Job(JobFields {
                        notes: Some(format!("note for {entity_id}")),
                        ..JobFields::default()
                    })),
                    5,
                )
                .unwrap()
            })
            .collect::<Vec<_>>();
        let expected_first = vec![ops[0].id, ops[2].id];

        let groups = group_by_entity(ops);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0].iter().map(|op| op.id).collect::<Vec<_>>(),
            expected_first
        );
        assert_eq!(groups[1][0].entity_id, "J2");
    }
}
