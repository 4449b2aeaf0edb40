//! Core record model and field-mapping types for the reconciliation engine.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "recon-core";

/// Placeholder some editors write instead of leaving a field blank.
pub const EMPTY_PLACEHOLDER: &str = "(empty)";

/// Portal keys that carry the foreign keys into the CRM rather than deal data.
pub const REMOTE_OPPORTUNITY_ID_KEY: &str = "remoteOpportunityId";
pub const REMOTE_CONTACT_ID_KEY: &str = "remoteContactId";

pub const SUPPORTED_FIELD_MAP_VERSION: u32 = 1;

/// Render a JSON value as comparison text. `null` is absent.
pub fn value_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(items) => {
            let parts = items
                .iter()
                .filter_map(value_to_text)
                .filter(|s| !s.trim().is_empty())
                .collect::<Vec<_>>();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        JsonValue::Object(_) => Some(value.to_string()),
    }
}

/// Trim, and fold blank text and the `(empty)` placeholder into absence.
pub fn normalize_value(raw: Option<&str>) -> Option<&str> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() || trimmed == EMPTY_PLACEHOLDER {
        None
    } else {
        Some(trimmed)
    }
}

/// Textual equality after normalization. Numbers are not parsed.
pub fn values_equal(a: Option<&str>, b: Option<&str>) -> bool {
    normalize_value(a) == normalize_value(b)
}

fn non_empty_id(id: &Option<String>) -> Option<&str> {
    id.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Deal record owned by the portal. Everything except the id and the two
/// CRM foreign keys is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalRecord {
    pub id: String,
    #[serde(
        default,
        rename = "remoteOpportunityId",
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_opportunity_id: Option<String>,
    #[serde(
        default,
        rename = "remoteContactId",
        skip_serializing_if = "Option::is_none"
    )]
    pub remote_contact_id: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, JsonValue>,
}

impl PortalRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote_opportunity_id: None,
            remote_contact_id: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_remote_ids(
        mut self,
        opportunity_id: Option<&str>,
        contact_id: Option<&str>,
    ) -> Self {
        self.remote_opportunity_id = opportunity_id.map(ToString::to_string);
        self.remote_contact_id = contact_id.map(ToString::to_string);
        self
    }

    pub fn opportunity_id(&self) -> Option<&str> {
        non_empty_id(&self.remote_opportunity_id)
    }

    pub fn contact_id(&self) -> Option<&str> {
        non_empty_id(&self.remote_contact_id)
    }

    pub fn field_text(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(value_to_text)
    }

    /// Human-facing label used in progress and reports; falls back to the id.
    pub fn label(&self, label_field: Option<&str>) -> String {
        label_field
            .and_then(|field| self.field_text(field))
            .filter(|text| normalize_value(Some(text.as_str())).is_some())
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|| self.id.clone())
    }

    /// Apply a partial update the same way the portal store does: `null`
    /// clears a field, anything else overwrites it.
    pub fn apply_update(&mut self, payload: &Map<String, JsonValue>) {
        for (key, value) in payload {
            match key.as_str() {
                REMOTE_OPPORTUNITY_ID_KEY => {
                    self.remote_opportunity_id = value_to_text(value);
                }
                REMOTE_CONTACT_ID_KEY => {
                    self.remote_contact_id = value_to_text(value);
                }
                "id" => {}
                _ if value.is_null() => {
                    self.fields.remove(key);
                }
                _ => {
                    self.fields.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

/// Dynamically keyed attribute on a CRM opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: JsonValue,
}

impl CustomField {
    pub fn new(id: impl Into<String>, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn text(&self) -> Option<String> {
        value_to_text(&self.value)
    }

    pub fn display_name(&self) -> &str {
        if self.key.trim().is_empty() {
            &self.id
        } else {
            &self.key
        }
    }
}

/// Opportunity record held by the CRM. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(default, rename = "contactId", skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    /// Basic attributes (name, status, monetaryValue, contact{..}), kept at
    /// the top level on the wire the way the CRM sends them.
    #[serde(flatten)]
    pub attributes: Map<String, JsonValue>,
    #[serde(default, rename = "customFields")]
    pub custom_fields: Vec<CustomField>,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            contact_id: None,
            attributes: Map::new(),
            custom_fields: Vec::new(),
        }
    }

    pub fn with_contact_id(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_custom_field(mut self, field: CustomField) -> Self {
        self.custom_fields.push(field);
        self
    }

    pub fn contact(&self) -> Option<&str> {
        non_empty_id(&self.contact_id)
    }

    /// Walk a dot-separated path through the basic attributes. Missing
    /// intermediate objects resolve to absent.
    pub fn resolve_basic_path(&self, path: &str) -> Option<String> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut cur = self.attributes.get(first)?;
        for segment in segments {
            cur = cur.get(segment)?;
        }
        value_to_text(cur)
    }

    pub fn custom_field(&self, field_id: &str) -> Option<&CustomField> {
        self.custom_fields.iter().find(|f| f.id == field_id)
    }

    pub fn custom_value(&self, field_id: &str) -> Option<String> {
        self.custom_field(field_id).and_then(CustomField::text)
    }
}

/// Where a resolved remote value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    Basic,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLookup {
    pub value: Option<String>,
    pub source: LookupSource,
}

/// Equivalence between one portal field and its CRM counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub portal_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_basic_path: Option<String>,
}

impl FieldMapping {
    pub fn custom(portal_field: impl Into<String>, remote_field_id: impl Into<String>) -> Self {
        Self {
            portal_field: portal_field.into(),
            remote_field_id: Some(remote_field_id.into()),
            remote_basic_path: None,
        }
    }

    pub fn basic(portal_field: impl Into<String>, remote_basic_path: impl Into<String>) -> Self {
        Self {
            portal_field: portal_field.into(),
            remote_field_id: None,
            remote_basic_path: Some(remote_basic_path.into()),
        }
    }

    pub fn with_fallback_field_id(mut self, remote_field_id: impl Into<String>) -> Self {
        self.remote_field_id = Some(remote_field_id.into());
        self
    }

    pub fn remote_field_id(&self) -> Option<&str> {
        self.remote_field_id.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn remote_basic_path(&self) -> Option<&str> {
        self.remote_basic_path.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Locate this field's value on a remote record: the basic path first,
    /// then the custom-field id when the path yields nothing.
    pub fn resolve(&self, remote: &RemoteRecord) -> RemoteLookup {
        if let Some(path) = self.remote_basic_path() {
            let basic = remote.resolve_basic_path(path);
            if normalize_value(basic.as_deref()).is_some() {
                return RemoteLookup {
                    value: basic,
                    source: LookupSource::Basic,
                };
            }
            if let Some(field_id) = self.remote_field_id() {
                if let Some(custom) = remote.custom_value(field_id) {
                    return RemoteLookup {
                        value: Some(custom),
                        source: LookupSource::Custom,
                    };
                }
            }
            return RemoteLookup {
                value: basic,
                source: LookupSource::Basic,
            };
        }

        RemoteLookup {
            value: self.remote_field_id().and_then(|id| remote.custom_value(id)),
            source: LookupSource::Custom,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldMapError {
    #[error("unsupported field map version {0}")]
    UnsupportedVersion(u32),
    #[error("mapping #{index} has an empty portal_field")]
    EmptyPortalField { index: usize },
    #[error("mapping for {portal_field} declares neither remote_field_id nor remote_basic_path")]
    NoRemoteLocator { portal_field: String },
    #[error("portal field {0} is mapped more than once")]
    DuplicatePortalField(String),
    #[error("remote field id {0} is mapped more than once")]
    DuplicateRemoteFieldId(String),
    #[error("mapping for {portal_field} has malformed basic path {path:?}")]
    InvalidBasicPath { portal_field: String, path: String },
}

/// The full mapping table plus the field used to label records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    pub version: u32,
    #[serde(default)]
    pub label_field: Option<String>,
    pub mappings: Vec<FieldMapping>,
}

impl FieldMap {
    pub fn new(mappings: Vec<FieldMapping>) -> Result<Self, FieldMapError> {
        let map = Self {
            version: SUPPORTED_FIELD_MAP_VERSION,
            label_field: None,
            mappings,
        };
        map.validate()?;
        Ok(map)
    }

    pub fn with_label_field(mut self, label_field: impl Into<String>) -> Self {
        self.label_field = Some(label_field.into());
        self
    }

    pub fn validate(&self) -> Result<(), FieldMapError> {
        if self.version != SUPPORTED_FIELD_MAP_VERSION {
            return Err(FieldMapError::UnsupportedVersion(self.version));
        }

        let mut portal_fields = HashSet::new();
        let mut remote_ids = HashSet::new();
        for (index, mapping) in self.mappings.iter().enumerate() {
            let portal_field = mapping.portal_field.trim();
            if portal_field.is_empty() {
                return Err(FieldMapError::EmptyPortalField { index });
            }
            if mapping.remote_field_id().is_none() && mapping.remote_basic_path().is_none() {
                return Err(FieldMapError::NoRemoteLocator {
                    portal_field: portal_field.to_string(),
                });
            }
            if let Some(path) = mapping.remote_basic_path() {
                if path.split('.').any(|segment| segment.trim().is_empty()) {
                    return Err(FieldMapError::InvalidBasicPath {
                        portal_field: portal_field.to_string(),
                        path: path.to_string(),
                    });
                }
            }
            if !portal_fields.insert(portal_field) {
                return Err(FieldMapError::DuplicatePortalField(portal_field.to_string()));
            }
            if let Some(id) = mapping.remote_field_id() {
                if !remote_ids.insert(id) {
                    return Err(FieldMapError::DuplicateRemoteFieldId(id.to_string()));
                }
            }
        }
        Ok(())
    }

    pub fn label_field(&self) -> Option<&str> {
        self.label_field.as_deref()
    }

    /// Custom-field ids targeted by any mapping.
    pub fn mapped_remote_ids(&self) -> HashSet<&str> {
        self.mappings
            .iter()
            .filter_map(FieldMapping::remote_field_id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    IdMatch,
    ContactMatch,
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    Basic,
    Custom,
    RemoteOnly,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Difference {
    pub field: String,
    pub portal_value: Option<String>,
    pub remote_value: Option<String>,
    pub kind: DifferenceKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub portal_record: PortalRecord,
    pub remote_record: Option<RemoteRecord>,
    pub match_type: MatchType,
    pub differences: Vec<Difference>,
}

impl ComparisonResult {
    pub fn is_matched(&self) -> bool {
        self.remote_record.is_some()
    }

    pub fn is_in_sync(&self) -> bool {
        self.differences.is_empty()
    }

    /// Matched and carrying at least one disagreement.
    pub fn needs_sync(&self) -> bool {
        self.is_matched() && !self.differences.is_empty()
    }
}

/// Result of one record's sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub record_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub applied_fields: Vec<String>,
}

impl SyncOutcome {
    pub fn succeeded(record_id: impl Into<String>, applied_fields: Vec<String>) -> Self {
        Self {
            record_id: record_id.into(),
            success: true,
            error: None,
            applied_fields,
        }
    }

    pub fn failed(record_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            success: false,
            error: Some(error.into()),
            applied_fields: Vec::new(),
        }
    }

    /// Successful without touching the portal.
    pub fn already_in_sync(&self) -> bool {
        self.success && self.applied_fields.is_empty()
    }
}
