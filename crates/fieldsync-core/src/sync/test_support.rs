//! In-memory remote authority used by the sync tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{EntityKey, EntitySnapshot, EntityType, FieldMap, Payload, QueuedOperation};
use crate::remote::{ApplyResponse, ChangeBatch, RemoteApply};

/// Scripted behaviour for the next `apply_operation` call
#[derive(Debug)]
pub enum Scripted {
    Respond(ApplyResponse),
    Fail(Error),
    /// Apply the operation, then report a retryable failure (lost response)
    ApplyThenDrop,
}

#[derive(Default)]
struct State {
    entities: HashMap<EntityKey, EntitySnapshot>,
    /// Request key -> snapshot produced by the first application
    applied: HashMap<String, EntitySnapshot>,
    changes: Vec<(i64, EntitySnapshot)>,
    clock: i64,
    effects: usize,
    calls: Vec<QueuedOperation>,
    script: VecDeque<Scripted>,
    feed_error: Option<String>,
    delay: Option<Duration>,
}

impl State {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn store(&mut self, snapshot: EntitySnapshot) {
        let at = self.tick();
        self.changes.push((at, snapshot.clone()));
        self.entities.insert(snapshot.key(), snapshot);
    }

    fn apply(&mut self, operation: &QueuedOperation) -> Result<ApplyResponse> {
        if let Some(snapshot) = self.applied.get(&operation.request_key()) {
            return Ok(ApplyResponse::success(Some(snapshot.clone())));
        }

        let key = operation.key();
        let current = self.entities.get(&key).cloned();
        let current_version = current.as_ref().map(|snapshot| snapshot.version);
        if let Some(current) = &current {
            if operation.base_version != Some(current.version) {
                return Ok(ApplyResponse::conflict(current.clone()));
            }
        }

        let version = current_version.unwrap_or(0) + 1;
        let mut next = current.unwrap_or_else(|| {
            EntitySnapshot::new(key.entity_type, key.entity_id.clone(), FieldMap::new())
        });
        match &operation.payload {
            Payload::Create(_) | Payload::Update(_) => {
                for (name, value) in operation.payload.changed_fields()? {
                    next.fields.insert(name, value);
                }
                next.deleted = false;
            }
            Payload::Delete => next.deleted = true,
        }
        next.version = version;

        self.effects += 1;
        self.applied
            .insert(operation.request_key(), next.clone());
        self.store(next.clone());
        Ok(ApplyResponse::success(Some(next)))
    }
}

/// Remote authority that honours request keys and base versions
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edit made by another device: bumps the version and lands in the change feed.
    pub fn server_edit(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        fields: &[(&str, serde_json::Value)],
    ) -> EntitySnapshot {
        let mut state = self.state.lock().unwrap();
        let key = EntityKey::new(entity_type, entity_id);
        let mut snapshot = state
            .entities
            .get(&key)
            .cloned()
            .unwrap_or_else(|| EntitySnapshot::new(entity_type, entity_id, FieldMap::new()));
        for (name, value) in fields {
            snapshot.fields.insert((*name).to_string(), value.clone());
        }
        snapshot.version += 1;
        state.store(snapshot.clone());
        snapshot
    }

    pub fn server_delete(&self, entity_type: EntityType, entity_id: &str) -> Option<EntitySnapshot> {
        let mut state = self.state.lock().unwrap();
        let key = EntityKey::new(entity_type, entity_id);
        let mut snapshot = state.entities.get(&key).cloned()?;
        snapshot.version += 1;
        snapshot.deleted = true;
        state.store(snapshot.clone());
        Some(snapshot)
    }

    pub fn script(&self, step: Scripted) {
        self.state.lock().unwrap().script.push_back(step);
    }

    /// Hold every apply call for `delay` before it reaches the server state.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn fail_feed(&self, error: impl Into<String>) {
        self.state.lock().unwrap().feed_error = Some(error.into());
    }

    pub fn snapshot(&self, entity_type: EntityType, entity_id: &str) -> Option<EntitySnapshot> {
        self.state
            .lock()
            .unwrap()
            .entities
            .get(&EntityKey::new(entity_type, entity_id))
            .cloned()
    }

    /// Server-side writes actually performed
    pub fn effects(&self) -> usize {
        self.state.lock().unwrap().effects
    }

    /// Every operation received, in arrival order
    pub fn calls(&self) -> Vec<QueuedOperation> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl RemoteApply for FakeRemote {
    async fn apply_operation(&self, operation: &QueuedOperation) -> Result<ApplyResponse> {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.calls.push(operation.clone());

        match state.script.pop_front() {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::ApplyThenDrop) => {
                state.apply(operation)?;
                Err(Error::Network("connection reset after write".into()))
            }
            None => state.apply(operation),
        }
    }

    async fn fetch_changes_since(
        &self,
        since: Option<i64>,
        entity_types: &[EntityType],
    ) -> Result<ChangeBatch> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.feed_error.take() {
            return Err(Error::Network(error));
        }

        let since = since.unwrap_or(0);
        let mut latest: HashMap<EntityKey, EntitySnapshot> = HashMap::new();
        for (at, snapshot) in &state.changes {
            if *at > since && entity_types.contains(&snapshot.entity_type) {
                latest.insert(snapshot.key(), snapshot.clone());
            }
        }
        let mut snapshots = latest.into_values().collect::<Vec<_>>();
        snapshots.sort_by(|a, b| a.key().cmp(&b.key()));

        Ok(ChangeBatch {
            snapshots,
            server_time: state.clock,
        })
    }
}
