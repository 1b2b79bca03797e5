//! Durable, priority-ordered mutation queue.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::retry::{RetryDecision, RetryManager};
use crate::error::{Error, Result};
use crate::models::{
    DeadReason, EntityKey, EntitySnapshot, EntityType, OperationId, OperationStatus, Payload,
    QueuedOperation, DEFAULT_PRIORITY,
};
use crate::store::{AppendOutcome, LocalStore};
use crate::util::now_ms;

/// Result of an enqueue: a new row, or the id of the identical operation already queued
pub type EnqueueOutcome = AppendOutcome;

/// A domain-layer mutation to queue
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: Payload,
    pub priority: i32,
}

impl EnqueueRequest {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            payload,
            priority: DEFAULT_PRIORITY,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn into_operation(self) -> Result<QueuedOperation> {
        QueuedOperation::new(
            self.entity_type,
            self.entity_id,
            self.payload,
            self.priority,
        )
    }
}

/// Queue size as shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Pending, in-flight or waiting on backoff
    pub live: usize,
    pub dead: usize,
}

/// Mutation queue backed by a [`LocalStore`]
pub struct MutationQueue {
    store: Arc<dyn LocalStore>,
    retry: RetryManager,
    claim_lock: Mutex<()>,
}

impl MutationQueue {
    pub fn new(store: Arc<dyn LocalStore>, retry: RetryManager) -> Self {
        Self {
            store,
            retry,
            claim_lock: Mutex::new(()),
        }
    }

    /// Validate and durably append an operation.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        let operation = request.into_operation()?;
        let outcome = self.store.append_operation(&operation, None).await?;
        log_enqueue(&operation, outcome);
        Ok(outcome)
    }

    /// Write the optimistic local snapshot and append the operation as one unit.
    pub async fn record_mutation(
        &self,
        request: EnqueueRequest,
        snapshot: &EntitySnapshot,
    ) -> Result<EnqueueOutcome> {
        if snapshot.entity_type != request.entity_type || snapshot.entity_id != request.entity_id
        {
            return Err(Error::InvalidInput(format!(
                "snapshot {} does not match operation target {}/{}",
                snapshot.key(),
                request.entity_type,
                request.entity_id
            )));
        }

        let operation = request.into_operation()?;
        let outcome = self
            .store
            .append_operation(&operation, Some(snapshot))
            .await?;
        log_enqueue(&operation, outcome);
        Ok(outcome)
    }

    /// Claim up to `max` eligible operations.
    pub async fn dequeue_batch(&self, max: usize) -> Result<Vec<QueuedOperation>> {
        self.dequeue_batch_at(max, now_ms(), None).await
    }

    /// Claim up to `max` eligible operations as of `now`.
    ///
    /// Failed operations last touched before `force_before` are treated as due
    /// regardless of their backoff gate (manual sync).
    pub async fn dequeue_batch_at(
        &self,
        max: usize,
        now: i64,
        force_before: Option<i64>,
    ) -> Result<Vec<QueuedOperation>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let _claim = self.claim_lock.lock().await;

        let conflicted = self
            .store
            .list_conflicts(true)
            .await?
            .into_iter()
            .map(|record| record.key())
            .collect::<HashSet<_>>();

        let mut held = HashSet::new();
        let mut claimed = Vec::new();

        for operation in self.store.list_pending().await? {
            if claimed.len() >= max {
                break;
            }
            if operation.status == OperationStatus::Dead {
                continue;
            }

            let key = operation.key();
            if conflicted.contains(&key) || held.contains(&key) {
                continue;
            }

            let forced = force_before.is_some_and(|before| operation.updated_at < before);
            if !operation.is_due(now, forced) {
                held.insert(key);
                continue;
            }

            if let Some(operation) = self.claim(operation, now).await? {
                claimed.push(operation);
            } else {
                held.insert(key);
            }
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed operations for dispatch");
        }
        Ok(claimed)
    }

    /// Claim a single pending or failed operation for dispatch.
    pub async fn mark_in_flight(&self, id: &OperationId) -> Result<QueuedOperation> {
        let _claim = self.claim_lock.lock().await;
        let operation = self.require(id).await?;
        let status = operation.status;
        self.claim(operation, now_ms())
            .await?
            .ok_or_else(|| invalid_transition(id, status, OperationStatus::InFlight))
    }

    /// Remove a confirmed operation and record the server copy.
    pub async fn mark_succeeded(
        &self,
        id: &OperationId,
        server: Option<&EntitySnapshot>,
    ) -> Result<()> {
        if self.store.complete_operation(id, server).await? {
            debug!(operation_id = %id, "Operation confirmed by server");
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "operation {id} is not in flight"
            )))
        }
    }

    /// Count a retryable failure and schedule the next attempt (or kill the operation).
    pub async fn mark_failed(&self, id: &OperationId, error: &str) -> Result<RetryDecision> {
        let mut operation = self.require(id).await?;
        if operation.status != OperationStatus::InFlight {
            return Err(invalid_transition(
                id,
                operation.status,
                OperationStatus::Failed,
            ));
        }

        let decision = self.retry.record_failure(&mut operation, error, now_ms());
        self.transition(&operation, &[OperationStatus::InFlight])
            .await?;
        Ok(decision)
    }

    /// Mark an operation dead after a fatal rejection.
    pub async fn mark_rejected(&self, id: &OperationId, error: &str) -> Result<()> {
        let mut operation = self.require(id).await?;
        operation.status = OperationStatus::Dead;
        operation.dead_reason = Some(DeadReason::Rejected);
        operation.last_error = Some(error.to_string());
        operation.next_attempt_at = None;
        operation.updated_at = now_ms();
        self.transition(&operation, &[OperationStatus::InFlight])
            .await?;

        warn!(
            operation_id = %id,
            entity_id = %operation.entity_id,
            error,
            "Operation rejected by server"
        );
        Ok(())
    }

    /// Return an unsent in-flight operation to pending without consuming a retry.
    pub async fn release(&self, id: &OperationId) -> Result<()> {
        let mut operation = self.require(id).await?;
        operation.status = OperationStatus::Pending;
        operation.base_version = None;
        operation.updated_at = now_ms();
        self.transition(&operation, &[OperationStatus::InFlight])
            .await
    }

    /// Requeue a dead operation with a fresh retry budget.
    pub async fn retry_dead(&self, id: &OperationId) -> Result<QueuedOperation> {
        let mut operation = self.require(id).await?;
        operation.status = OperationStatus::Pending;
        operation.retry_count = 0;
        operation.last_error = None;
        operation.dead_reason = None;
        operation.next_attempt_at = None;
        operation.base_version = None;
        operation.updated_at = now_ms();
        self.transition(&operation, &[OperationStatus::Dead])
            .await?;

        info!(operation_id = %id, "Dead operation requeued");
        Ok(operation)
    }

    /// Drop an operation that is not currently being sent.
    pub async fn discard(&self, id: &OperationId) -> Result<QueuedOperation> {
        let _claim = self.claim_lock.lock().await;
        let operation = self.require(id).await?;
        if operation.status == OperationStatus::InFlight {
            return Err(Error::InvalidState(format!(
                "operation {id} is in flight and cannot be discarded"
            )));
        }

        self.store.delete_operations(std::slice::from_ref(id)).await?;
        info!(
            operation_id = %id,
            entity_id = %operation.entity_id,
            "Operation discarded"
        );
        Ok(operation)
    }

    /// Reset operations left in flight by an interrupted process.
    pub async fn recover(&self) -> Result<usize> {
        let _claim = self.claim_lock.lock().await;
        let mut recovered = 0;
        for mut operation in self.store.list_pending().await? {
            if operation.status != OperationStatus::InFlight {
                continue;
            }
            operation.status = OperationStatus::Pending;
            operation.base_version = None;
            operation.updated_at = now_ms();
            if self
                .store
                .transition_operation(&operation, &[OperationStatus::InFlight])
                .await?
            {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!(recovered, "Recovered interrupted operations");
        }
        Ok(recovered)
    }

    pub async fn get(&self, id: &OperationId) -> Result<Option<QueuedOperation>> {
        self.store.get_operation(id).await
    }

    /// Every queue row in dispatch order
    pub async fn list(&self) -> Result<Vec<QueuedOperation>> {
        self.store.list_pending().await
    }

    pub async fn list_dead(&self) -> Result<Vec<QueuedOperation>> {
        Ok(self
            .store
            .list_pending()
            .await?
            .into_iter()
            .filter(|operation| operation.status == OperationStatus::Dead)
            .collect())
    }

    /// Live operations for one entity, oldest first
    pub async fn live_for(&self, key: &EntityKey) -> Result<Vec<QueuedOperation>> {
        let mut operations = self
            .store
            .list_pending()
            .await?
            .into_iter()
            .filter(|operation| operation.status.is_live() && operation.key() == *key)
            .collect::<Vec<_>>();
        operations.sort_by_key(|operation| operation.created_at);
        Ok(operations)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        let operations = self.store.list_pending().await?;
        let dead = operations
            .iter()
            .filter(|operation| operation.status == OperationStatus::Dead)
            .count();
        Ok(QueueCounts {
            live: operations.len() - dead,
            dead,
        })
    }

    async fn require(&self, id: &OperationId) -> Result<QueuedOperation> {
        self.store
            .get_operation(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("operation {id}")))
    }

    async fn transition(
        &self,
        operation: &QueuedOperation,
        expected: &[OperationStatus],
    ) -> Result<()> {
        if self.store.transition_operation(operation, expected).await? {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "operation {} changed concurrently; expected {:?}",
                operation.id, expected
            )))
        }
    }

    /// Compare-and-set a due operation to in-flight, stamping its base version.
    async fn claim(
        &self,
        mut operation: QueuedOperation,
        now: i64,
    ) -> Result<Option<QueuedOperation>> {
        let previous = operation.status;
        if !matches!(previous, OperationStatus::Pending | OperationStatus::Failed) {
            return Ok(None);
        }

        let entity = self
            .store
            .read_entity(operation.entity_type, &operation.entity_id)
            .await?;
        operation.base_version = entity.and_then(|entity| entity.synced_version);
        operation.status = OperationStatus::InFlight;
        operation.updated_at = now;

        let claimed = self
            .store
            .transition_operation(&operation, &[previous])
            .await?;
        Ok(claimed.then_some(operation))
    }
}

fn log_enqueue(operation: &QueuedOperation, outcome: EnqueueOutcome) {
    if outcome.is_duplicate() {
        debug!(
            operation_id = %outcome.operation_id(),
            entity_id = %operation.entity_id,
            "Skipped duplicate operation"
        );
    } else {
        debug!(
            operation_id = %operation.id,
            entity_id = %operation.entity_id,
            kind = %operation.kind,
            priority = operation.priority,
            "Operation queued"
        );
    }
}

fn invalid_transition(id: &OperationId, from: OperationStatus, to: OperationStatus) -> Error {
    Error::InvalidState(format!("operation {id} cannot move from {from} to {to}"))
}
