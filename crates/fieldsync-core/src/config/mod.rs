//! Sync engine configuration.
//!
//! Every field has a default so partial JSON profiles deserialize cleanly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::EntityType;
use crate::sync::RetryPolicy;

const DEFAULT_BATCH_SIZE: usize = 25;
const DEFAULT_MAX_BATCHES_PER_CYCLE: usize = 20;
const DEFAULT_MAX_CONCURRENT_ENTITIES: usize = 4;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_PERIODIC_INTERVAL_MS: u64 = 60_000;

/// Coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operations claimed per dequeue
    pub batch_size: usize,
    /// Upper bound on dequeues in one push phase
    pub max_batches_per_cycle: usize,
    /// Entities dispatched concurrently (each entity stays sequential)
    pub max_concurrent_entities: usize,
    /// Deadline for each remote call
    pub request_timeout_ms: u64,
    /// Periodic trigger interval; `None` disables the timer
    pub periodic_interval_ms: Option<u64>,
    /// Resolve `concurrent_edit_disjoint` conflicts automatically
    pub auto_merge_disjoint: bool,
    /// Entity types requested from the change feed
    pub entity_scope: Vec<EntityType>,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_batches_per_cycle: DEFAULT_MAX_BATCHES_PER_CYCLE,
            max_concurrent_entities: DEFAULT_MAX_CONCURRENT_ENTITIES,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            periodic_interval_ms: Some(DEFAULT_PERIODIC_INTERVAL_MS),
            auto_merge_disjoint: true,
            entity_scope: EntityType::ALL.to_vec(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_max_concurrent_entities(mut self, max: usize) -> Self {
        self.max_concurrent_entities = max;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Set the periodic trigger interval
    #[must_use]
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval_ms = Some(duration_to_ms(interval));
        self
    }

    /// Disable the periodic trigger (manual and connectivity triggers only)
    #[must_use]
    pub const fn without_periodic_sync(mut self) -> Self {
        self.periodic_interval_ms = None;
        self
    }

    #[must_use]
    pub const fn with_auto_merge_disjoint(mut self, enabled: bool) -> Self {
        self.auto_merge_disjoint = enabled;
        self
    }

    #[must_use]
    pub fn with_entity_scope(mut self, scope: impl Into<Vec<EntityType>>) -> Self {
        self.entity_scope = scope.into();
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_ms.map(Duration::from_millis)
    }

    /// Reject settings the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".into()));
        }
        if self.max_batches_per_cycle == 0 {
            return Err(Error::InvalidInput(
                "max_batches_per_cycle must be at least 1".into(),
            ));
        }
        if self.max_concurrent_entities == 0 {
            return Err(Error::InvalidInput(
                "max_concurrent_entities must be at least 1".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidInput(
                "request_timeout_ms must be positive".into(),
            ));
        }
        if self.periodic_interval_ms == Some(0) {
            return Err(Error::InvalidInput(
                "periodic_interval_ms must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::InvalidInput(
                "retry.jitter must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
