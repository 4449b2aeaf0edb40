//! Record source contracts, HTTP-backed portal/CRM clients and a
//! fixture-backed source for offline runs.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use recon_core::{
    value_to_text, CustomField, PortalRecord, RemoteRecord, REMOTE_CONTACT_ID_KEY,
    REMOTE_OPPORTUNITY_ID_KEY,
};
use recon_storage::{
    resource_url, ApiRequest, FetchError, HttpFetcher, PORTAL_SNAPSHOT_FILE, REMOTE_SNAPSHOT_FILE,
};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "recon-adapters";

/// Fixture directories share their layout with run snapshots, so any
/// captured run can be replayed offline.
pub const PORTAL_FIXTURE_FILE: &str = PORTAL_SNAPSHOT_FILE;
pub const REMOTE_FIXTURE_FILE: &str = REMOTE_SNAPSHOT_FILE;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Read side: pulls both datasets. Implementations never retry.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_portal(&self) -> Result<Vec<PortalRecord>, AdapterError>;

    async fn fetch_remote(&self, pipeline_id: &str) -> Result<Vec<RemoteRecord>, AdapterError>;
}

/// Write side: partial updates against the portal's own store.
#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn update_portal_record(
        &self,
        record_id: &str,
        fields: &Map<String, JsonValue>,
    ) -> Result<(), AdapterError>;
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Identifiers arrive as strings or numbers depending on the upstream.
fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_path(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Unwrap `[..]` or `{ "<key>": [..] }` for the first key present.
fn json_items<'a>(value: &'a JsonValue, keys: &[&str]) -> Result<&'a Vec<JsonValue>, AdapterError> {
    if let Some(items) = value.as_array() {
        return Ok(items);
    }
    keys.iter()
        .find_map(|key| value.get(*key).and_then(JsonValue::as_array))
        .ok_or_else(|| {
            AdapterError::Message(format!(
                "expected a JSON array or an object with one of {keys:?}"
            ))
        })
}

pub fn portal_record_from_json(value: &JsonValue) -> Result<PortalRecord, AdapterError> {
    let object = value
        .as_object()
        .ok_or_else(|| AdapterError::Message("portal record is not a JSON object".into()))?;
    let id = json_id(value, &["id"])
        .or_else(|| json_id(value, &["_id"]))
        .ok_or_else(|| AdapterError::Message("portal record without id".into()))?;

    let mut record = PortalRecord::new(id);
    record.remote_opportunity_id = json_id(value, &[REMOTE_OPPORTUNITY_ID_KEY]);
    record.remote_contact_id = json_id(value, &[REMOTE_CONTACT_ID_KEY]);
    for (key, field) in object {
        if matches!(
            key.as_str(),
            "id" | "_id" | REMOTE_OPPORTUNITY_ID_KEY | REMOTE_CONTACT_ID_KEY
        ) {
            continue;
        }
        record.fields.insert(key.clone(), field.clone());
    }
    Ok(record)
}

pub fn portal_records_from_json(value: &JsonValue) -> Result<Vec<PortalRecord>, AdapterError> {
    json_items(value, &["deals", "records", "data"])?
        .iter()
        .map(portal_record_from_json)
        .collect()
}

fn custom_field_from_json(value: &JsonValue) -> Option<CustomField> {
    let id = json_id(value, &["id"])?;
    let key = json_path(value, &["key"])
        .or_else(|| json_path(value, &["fieldKey"]))
        .and_then(value_to_text)
        .unwrap_or_default();
    let field_value = ["value", "fieldValue", "fieldValueString", "field_value"]
        .iter()
        .find_map(|k| value.get(*k).filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or(JsonValue::Null);
    Some(CustomField {
        id,
        key,
        value: field_value,
    })
}

pub fn remote_record_from_json(value: &JsonValue) -> Result<RemoteRecord, AdapterError> {
    let object = value
        .as_object()
        .ok_or_else(|| AdapterError::Message("remote record is not a JSON object".into()))?;
    let id = json_id(value, &["id"])
        .ok_or_else(|| AdapterError::Message("remote record without id".into()))?;

    let mut record = RemoteRecord::new(id);
    record.contact_id = json_id(value, &["contactId"]).or_else(|| json_id(value, &["contact", "id"]));
    for (key, attr) in object {
        match key.as_str() {
            "id" | "contactId" => {}
            "customFields" => {
                let fields = attr.as_array().map(Vec::as_slice).unwrap_or_default();
                for raw in fields {
                    match custom_field_from_json(raw) {
                        Some(field) => record.custom_fields.push(field),
                        None => warn!(remote_id = %record.id, "skipping custom field without id"),
                    }
                }
            }
            _ => {
                record.attributes.insert(key.clone(), attr.clone());
            }
        }
    }
    Ok(record)
}

pub fn remote_records_from_json(value: &JsonValue) -> Result<Vec<RemoteRecord>, AdapterError> {
    json_items(value, &["opportunities", "records", "data"])?
        .iter()
        .map(remote_record_from_json)
        .collect()
}

#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    pub base_url: String,
    pub bearer_token: Option<String>,
}

impl ApiEndpoint {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Resource url under this endpoint; each segment is escaped on its own.
    pub fn url(&self, segments: &[&str]) -> Result<String, FetchError> {
        resource_url(&self.base_url, segments)
    }

    fn bearer(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }
}

/// Portal + CRM over HTTP.
///
/// Portal: `GET /deals`, `PUT /deals/{id}`.
/// CRM: `GET /opportunities/search?pipeline_id=..[&location_id=..]`.
#[derive(Debug)]
pub struct HttpRecordSource {
    http: HttpFetcher,
    portal: ApiEndpoint,
    crm: ApiEndpoint,
    crm_location_id: Option<String>,
}

impl HttpRecordSource {
    pub fn new(http: HttpFetcher, portal: ApiEndpoint, crm: ApiEndpoint) -> Self {
        Self {
            http,
            portal,
            crm,
            crm_location_id: None,
        }
    }

    pub fn with_location_id(mut self, location_id: Option<String>) -> Self {
        self.crm_location_id = location_id.filter(|s| !s.trim().is_empty());
        self
    }
}

#[async_trait]
impl RecordFetcher for HttpRecordSource {
    fn source_id(&self) -> &str {
        "http"
    }

    async fn fetch_portal(&self) -> Result<Vec<PortalRecord>, AdapterError> {
        let url = self.portal.url(&["deals"])?;
        let resp = self
            .http
            .get(&url, ApiRequest::default().bearer(self.portal.bearer()))
            .await?;
        let body: JsonValue = resp.json()?;
        let records = portal_records_from_json(&body)?;
        info!(count = records.len(), "fetched portal records");
        Ok(records)
    }

    async fn fetch_remote(&self, pipeline_id: &str) -> Result<Vec<RemoteRecord>, AdapterError> {
        if pipeline_id.trim().is_empty() {
            return Err(AdapterError::Message("remote fetch requires a pipeline id".into()));
        }
        let url = self.crm.url(&["opportunities", "search"])?;
        let mut request = ApiRequest::default()
            .bearer(self.crm.bearer())
            .query("pipeline_id", pipeline_id);
        if let Some(location_id) = &self.crm_location_id {
            request = request.query("location_id", location_id);
        }
        let resp = self.http.get(&url, request).await?;
        let body: JsonValue = resp.json()?;
        let records = remote_records_from_json(&body)?;
        info!(count = records.len(), pipeline_id, "fetched remote records");
        Ok(records)
    }
}

#[async_trait]
impl PortalStore for HttpRecordSource {
    async fn update_portal_record(
        &self,
        record_id: &str,
        fields: &Map<String, JsonValue>,
    ) -> Result<(), AdapterError> {
        let url = self.portal.url(&["deals", record_id])?;
        let request = ApiRequest::default()
            .bearer(self.portal.bearer())
            .json(fields)?;
        self.http.put(&url, request).await?;
        Ok(())
    }
}

/// Datasets loaded from `portal_records.json` / `remote_records.json`.
/// Updates land in memory only.
#[derive(Debug)]
pub struct FixtureRecordSource {
    portal: Mutex<Vec<PortalRecord>>,
    remote: Vec<RemoteRecord>,
    rejected_ids: HashSet<String>,
}

impl FixtureRecordSource {
    pub fn new(portal: Vec<PortalRecord>, remote: Vec<RemoteRecord>) -> Self {
        Self {
            portal: Mutex::new(portal),
            remote,
            rejected_ids: HashSet::new(),
        }
    }

    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let portal = portal_records_from_json(&read_json_file(&dir.join(PORTAL_FIXTURE_FILE))?)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("decoding {}", dir.join(PORTAL_FIXTURE_FILE).display()))?;
        let remote = remote_records_from_json(&read_json_file(&dir.join(REMOTE_FIXTURE_FILE))?)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("decoding {}", dir.join(REMOTE_FIXTURE_FILE).display()))?;
        Ok(Self::new(portal, remote))
    }

    /// Make updates for these ids fail, the way a rejecting portal would.
    pub fn rejecting(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.rejected_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub async fn portal_snapshot(&self) -> Vec<PortalRecord> {
        self.portal.lock().await.clone()
    }
}

fn read_json_file(path: &Path) -> Result<JsonValue> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[async_trait]
impl RecordFetcher for FixtureRecordSource {
    fn source_id(&self) -> &str {
        "fixtures"
    }

    async fn fetch_portal(&self) -> Result<Vec<PortalRecord>, AdapterError> {
        Ok(self.portal_snapshot().await)
    }

    async fn fetch_remote(&self, pipeline_id: &str) -> Result<Vec<RemoteRecord>, AdapterError> {
        let pipeline_id = pipeline_id.trim();
        Ok(self
            .remote
            .iter()
            .filter(|r| {
                pipeline_id.is_empty()
                    || r.attributes
                        .get("pipelineId")
                        .and_then(value_to_text)
                        .map_or(true, |p| p == pipeline_id)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PortalStore for FixtureRecordSource {
    async fn update_portal_record(
        &self,
        record_id: &str,
        fields: &Map<String, JsonValue>,
    ) -> Result<(), AdapterError> {
        if self.rejected_ids.contains(record_id) {
            return Err(AdapterError::Message(format!(
                "portal rejected update for {record_id}"
            )));
        }
        let mut portal = self.portal.lock().await;
        let record = portal
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| AdapterError::Message(format!("portal record {record_id} not found")))?;
        record.apply_update(fields);
        Ok(())
    }
}
