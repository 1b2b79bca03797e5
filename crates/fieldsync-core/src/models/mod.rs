//! Data models for fieldsync

mod conflict;
mod entity;
mod operation;
mod payload;

pub use conflict::{ConflictId, ConflictKind, ConflictRecord, Resolution};
pub use entity::{EntityKey, EntitySnapshot, EntityType, FieldMap, LocalEntity};
pub use operation::{
    DeadReason, OperationId, OperationKind, OperationStatus, QueuedOperation, DEFAULT_PRIORITY,
    HIGH_PRIORITY,
};
pub use payload::{
    field_names, project_fields, required_fields, ClientFields, EntityFields, JobFields,
    JobStatus, MaterialUsageFields, Payload, PhotoFields,
};
