//! Sync session state shared with observers.

use serde::{Deserialize, Serialize};

/// Coordinator state machine position
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Cancelled,
    Error,
}

impl SyncPhase {
    pub const fn is_syncing(self) -> bool {
        matches!(self, Self::Pushing | Self::Pulling)
    }
}

/// Process-wide session, one per coordinator
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub is_online: bool,
    pub phase: SyncPhase,
    /// Live operations (pending, in flight or waiting on backoff)
    pub pending_operations: usize,
    /// Operations waiting on a manual retry or discard
    pub dead_operations: usize,
    /// Unresolved conflict records
    pub conflicts: usize,
    /// Server watermark of the last completed pull (Unix ms)
    pub last_sync_timestamp: Option<i64>,
    pub last_error: Option<String>,
}

impl SyncSession {
    pub const fn is_syncing(&self) -> bool {
        self.phase.is_syncing()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.is_online,
            is_syncing: self.is_syncing(),
            phase: self.phase,
            pending_operations: self.pending_operations,
            dead_operations: self.dead_operations,
            conflicts: self.conflicts,
            last_sync: self.last_sync_timestamp,
            last_error: self.last_error.clone(),
        }
    }
}

/// Snapshot returned by the status surface
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub phase: SyncPhase,
    pub pending_operations: usize,
    pub dead_operations: usize,
    pub conflicts: usize,
    pub last_sync: Option<i64>,
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Anything the user has to act on
    pub const fn needs_attention(&self) -> bool {
        self.conflicts > 0 || self.dead_operations > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reflects_phase() {
        let session = SyncSession {
            phase: SyncPhase::Pulling,
            pending_operations: 2,
            ..SyncSession::default()
        };
        let status = session.status();
        assert!(status.is_syncing);
        assert_eq!(status.pending_operations, 2);
        assert!(!status.needs_attention());
    }

    #[test]
    fn cancelled_and_error_are_not_syncing() {
        assert!(!SyncPhase::Cancelled.is_syncing());
        assert!(!SyncPhase::Error.is_syncing());
        assert!(SyncPhase::Pushing.is_syncing());
    }
}
