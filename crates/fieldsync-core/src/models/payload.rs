//! Typed operation payloads
//!
//! Each queued operation carries a payload keyed by operation kind and entity
//! type. Field sets are partial (every field optional) and reject unknown
//! fields, so a payload can always be converted to and from a [`FieldMap`]
//! for field-level diffing without losing its schema.

use serde::{Deserialize, Serialize};

use super::entity::{EntityType, FieldMap};
use super::operation::OperationKind;
use crate::error::{Error, Result};
use crate::util::sha256_hex;

/// Job lifecycle states as reported by technicians
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    EnCamino,
    Working,
    Paused,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhotoFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Path of the captured file on the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaterialUsageFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<i64>,
}

const JOB_FIELDS: &[&str] = &[
    "title",
    "status",
    "client_id",
    "address",
    "scheduled_for",
    "started_at",
    "completed_at",
    "notes",
    "signature_ref",
];
const CLIENT_FIELDS: &[&str] = &["name", "phone", "email", "address", "notes"];
const PHOTO_FIELDS: &[&str] = &[
    "job_id",
    "local_path",
    "remote_url",
    "caption",
    "taken_at",
    "latitude",
    "longitude",
];
const MATERIAL_USAGE_FIELDS: &[&str] = &[
    "job_id",
    "material_code",
    "description",
    "quantity",
    "unit",
    "recorded_at",
];

/// Field names accepted for an entity type
pub const fn field_names(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Job => JOB_FIELDS,
        EntityType::Client => CLIENT_FIELDS,
        EntityType::Photo => PHOTO_FIELDS,
        EntityType::MaterialUsage => MATERIAL_USAGE_FIELDS,
    }
}

/// Fields a create operation must carry
pub const fn required_fields(entity_type: EntityType) -> &'static [&'static str] {
    match entity_type {
        EntityType::Job => &["title"],
        EntityType::Client => &["name"],
        EntityType::Photo => &["job_id", "local_path"],
        EntityType::MaterialUsage => &["job_id", "material_code", "quantity"],
    }
}

/// Keep only schema fields with non-null values.
pub fn project_fields(entity_type: EntityType, fields: &FieldMap) -> FieldMap {
    let allowed = field_names(entity_type);
    fields
        .iter()
        .filter(|(name, value)| allowed.contains(&name.as_str()) && !value.is_null())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Partial field set for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "fields", rename_all = "snake_case")]
pub enum EntityFields {
    Job(JobFields),
    Client(ClientFields),
    Photo(PhotoFields),
    MaterialUsage(MaterialUsageFields),
}

impl EntityFields {
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Job(_) => EntityType::Job,
            Self::Client(_) => EntityType::Client,
            Self::Photo(_) => EntityType::Photo,
            Self::MaterialUsage(_) => EntityType::MaterialUsage,
        }
    }

    /// Set fields as a generic map (unset fields omitted)
    pub fn to_field_map(&self) -> Result<FieldMap> {
        let value = match self {
            Self::Job(fields) => serde_json::to_value(fields)?,
            Self::Client(fields) => serde_json::to_value(fields)?,
            Self::Photo(fields) => serde_json::to_value(fields)?,
            Self::MaterialUsage(fields) => serde_json::to_value(fields)?,
        };

        match value {
            serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
            other => Err(Error::InvalidState(format!(
                "entity fields serialized to non-object: {other}"
            ))),
        }
    }

    /// Parse a generic map against the entity schema
    pub fn from_field_map(entity_type: EntityType, fields: &FieldMap) -> Result<Self> {
        let value = serde_json::Value::Object(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        );
        let invalid =
            |error: serde_json::Error| Error::Validation(format!("invalid {entity_type} fields: {error}"));

        Ok(match entity_type {
            EntityType::Job => Self::Job(serde_json::from_value(value).map_err(invalid)?),
            EntityType::Client => Self::Client(serde_json::from_value(value).map_err(invalid)?),
            EntityType::Photo => Self::Photo(serde_json::from_value(value).map_err(invalid)?),
            EntityType::MaterialUsage => {
                Self::MaterialUsage(serde_json::from_value(value).map_err(invalid)?)
            }
        })
    }

    fn validate_values(&self) -> Result<()> {
        match self {
            Self::MaterialUsage(fields) => {
                if let Some(quantity) = fields.quantity {
                    if !quantity.is_finite() || quantity <= 0.0 {
                        return Err(Error::Validation(format!(
                            "material quantity must be positive, got {quantity}"
                        )));
                    }
                }
            }
            Self::Photo(fields) => {
                if fields.latitude.is_some_and(|lat| !(-90.0..=90.0).contains(&lat)) {
                    return Err(Error::Validation("photo latitude out of range".into()));
                }
                if fields
                    .longitude
                    .is_some_and(|lon| !(-180.0..=180.0).contains(&lon))
                {
                    return Err(Error::Validation("photo longitude out of range".into()));
                }
            }
            Self::Job(_) | Self::Client(_) => {}
        }
        Ok(())
    }
}

/// Operation payload: a tagged union over operation kind and entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Create(EntityFields),
    Update(EntityFields),
    Delete,
}

impl Payload {
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Create(_) => OperationKind::Create,
            Self::Update(_) => OperationKind::Update,
            Self::Delete => OperationKind::Delete,
        }
    }

    pub const fn fields(&self) -> Option<&EntityFields> {
        match self {
            Self::Create(fields) | Self::Update(fields) => Some(fields),
            Self::Delete => None,
        }
    }

    pub fn entity_type(&self) -> Option<EntityType> {
        self.fields().map(EntityFields::entity_type)
    }

    /// Fields this payload writes (empty for deletes)
    pub fn changed_fields(&self) -> Result<FieldMap> {
        self.fields()
            .map_or_else(|| Ok(FieldMap::new()), EntityFields::to_field_map)
    }

    /// Build a payload from a generic field map
    pub fn from_parts(
        entity_type: EntityType,
        kind: OperationKind,
        fields: &FieldMap,
    ) -> Result<Self> {
        let payload = match kind {
            OperationKind::Create => {
                Self::Create(EntityFields::from_field_map(entity_type, fields)?)
            }
            OperationKind::Update => {
                Self::Update(EntityFields::from_field_map(entity_type, fields)?)
            }
            OperationKind::Delete => Self::Delete,
        };
        payload.validate(entity_type)?;
        Ok(payload)
    }

    /// Check the payload against the target entity's schema
    pub fn validate(&self, entity_type: EntityType) -> Result<()> {
        let Some(fields) = self.fields() else {
            return Ok(());
        };

        if fields.entity_type() != entity_type {
            return Err(Error::Validation(format!(
                "payload is for {} but operation targets {entity_type}",
                fields.entity_type()
            )));
        }

        let map = fields.to_field_map()?;
        match self {
            Self::Update(_) if map.is_empty() => {
                return Err(Error::Validation(format!(
                    "update for {entity_type} must set at least one field"
                )));
            }
            Self::Create(_) => {
                for required in required_fields(entity_type) {
                    let present = map.get(*required).is_some_and(|value| match value {
                        serde_json::Value::String(text) => !text.trim().is_empty(),
                        serde_json::Value::Null => false,
                        _ => true,
                    });
                    if !present {
                        return Err(Error::Validation(format!(
                            "create for {entity_type} requires field `{required}`"
                        )));
                    }
                }
            }
            _ => {}
        }

        fields.validate_values()
    }

    /// Stable content hash used for idempotency keys
    pub fn content_hash(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(sha256_hex(&encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn job_update(status: JobStatus) -> Payload {
        Payload::Update(EntityFields::Job(JobFields {
            status: Some(status),
            ..JobFields::default()
        }))
    }

    #[test]
    fn job_status_uses_snake_case() {
        assert_eq!(
            serde_json::to_value(JobStatus::EnCamino).unwrap(),
            json!("en_camino")
        );
    }

    #[test]
    fn payload_serializes_as_tagged_union() {
        let value = serde_json::to_value(job_update(JobStatus::Working)).unwrap();
        assert_eq!(
            value,
            json!({
                "kind": "update",
                "data": {"entity_type": "job", "fields": {"status": "working"}}
            })
        );

        let delete = serde_json::to_value(Payload::Delete).unwrap();
        assert_eq!(delete, json!({"kind": "delete"}));
    }

    #[test]
    fn field_map_round_trip_keeps_only_set_fields() {
        let payload = job_update(JobStatus::Working);
        let map = payload.changed_fields().unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["status"]);

        let rebuilt = Payload::from_parts(EntityType::Job, OperationKind::Update, &map).unwrap();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut map = FieldMap::new();
        map.insert("colour".into(), json!("red"));
        let error =
            Payload::from_parts(EntityType::Client, OperationKind::Update, &map).unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
    }

    #[test]
    fn mistyped_fields_are_rejected() {
        let mut map = FieldMap::new();
        map.insert("quantity".into(), json!("three"));
        assert!(
            Payload::from_parts(EntityType::MaterialUsage, OperationKind::Update, &map).is_err()
        );
    }

    #[test]
    fn empty_update_is_rejected() {
        let payload = Payload::Update(EntityFields::Client(ClientFields::default()));
        assert!(payload.validate(EntityType::Client).is_err());
    }

    #[test]
    fn create_requires_fields() {
        let missing = Payload::Create(EntityFields::Photo(PhotoFields {
            job_id: Some("J1".into()),
            ..PhotoFields::default()
        }));
        assert!(missing.validate(EntityType::Photo).is_err());

        let complete = Payload::Create(EntityFields::Photo(PhotoFields {
            job_id: Some("J1".into()),
            local_path: Some("/sdcard/dcim/0001.jpg".into()),
            ..PhotoFields::default()
        }));
        assert!(complete.validate(EntityType::Photo).is_ok());
    }

    #[test]
    fn blank_required_field_is_rejected() {
        let payload = Payload::Create(EntityFields::Client(ClientFields {
            name: Some("   ".into()),
            ..ClientFields::default()
        }));
        assert!(payload.validate(EntityType::Client).is_err());
    }

    #[test]
    fn entity_type_mismatch_is_rejected() {
        let payload = job_update(JobStatus::Paused);
        assert!(payload.validate(EntityType::Client).is_err());
        assert!(Payload::Delete.validate(EntityType::Client).is_ok());
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let payload = Payload::Update(EntityFields::MaterialUsage(MaterialUsageFields {
            quantity: Some(0.0),
            ..MaterialUsageFields::default()
        }));
        assert!(payload.validate(EntityType::MaterialUsage).is_err());
    }

    #[test]
    fn content_hash_distinguishes_payloads() {
        let a = job_update(JobStatus::Working).content_hash().unwrap();
        let b = job_update(JobStatus::Working).content_hash().unwrap();
        let c = job_update(JobStatus::Completed).content_hash().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn project_fields_drops_unknown_and_null() {
        let mut map = FieldMap::new();
        map.insert("name".into(), json!("Acme"));
        map.insert("id".into(), json!("C1"));
        map.insert("phone".into(), serde_json::Value::Null);

        let projected = project_fields(EntityType::Client, &map);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected.get("name"), Some(&json!("Acme")));
    }
}
