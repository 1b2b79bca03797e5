//! Offline mutation queue and sync engine.
//!
//! Local writes land in the [`MutationQueue`] first. The [`SyncCoordinator`]
//! pushes them to the remote authority, pulls the change feed, and hands any
//! divergence to the [`ConflictDetector`] and [`ConflictResolver`].

mod coordinator;
mod detector;
mod queue;
mod resolver;
mod retry;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{CycleReport, SyncCoordinator, SyncTrigger};
pub use detector::{assess, changed_keys, Assessment, ConflictDetector, Divergence, LocalView};
pub use queue::{EnqueueOutcome, EnqueueRequest, MutationQueue, QueueCounts};
pub use resolver::{merge_fields, ConflictResolver};
pub use retry::{classify_error, FailureClass, RetryDecision, RetryManager, RetryPolicy};
