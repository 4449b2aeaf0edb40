//! Pushes CRM values onto portal records, one record at a time.

use std::sync::Arc;
use std::time::Duration;

use recon_adapters::PortalStore;
use recon_core::{
    normalize_value, values_equal, ComparisonResult, FieldMap, MatchType, SyncOutcome,
    REMOTE_OPPORTUNITY_ID_KEY,
};
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reporter::{RunReporter, RunSummary};
use crate::ReconcileError;

#[derive(Debug, Clone)]
pub struct BulkSyncResult {
    pub outcomes: Vec<SyncOutcome>,
    pub summary: RunSummary,
}

pub struct SyncExecutor {
    store: Arc<dyn PortalStore>,
    field_map: Arc<FieldMap>,
    delay: Duration,
}

impl SyncExecutor {
    pub fn new(store: Arc<dyn PortalStore>, field_map: Arc<FieldMap>, delay: Duration) -> Self {
        Self {
            store,
            field_map,
            delay,
        }
    }

    /// Fields whose portal value disagrees with the remote record, keyed by
    /// portal field name. Values are re-derived from the remote record held
    /// in `result`, never from its cached differences. An absent remote
    /// value clears the portal field.
    pub fn build_payload(
        &self,
        result: &ComparisonResult,
    ) -> Result<Map<String, JsonValue>, ReconcileError> {
        let portal = &result.portal_record;
        let remote = result
            .remote_record
            .as_ref()
            .ok_or_else(|| ReconcileError::InvalidState {
                record_id: portal.id.clone(),
            })?;

        let mut payload = Map::new();
        for mapping in &self.field_map.mappings {
            let lookup = mapping.resolve(remote);
            let current = portal.field_text(&mapping.portal_field);
            if values_equal(current.as_deref(), lookup.value.as_deref()) {
                continue;
            }
            let value = normalize_value(lookup.value.as_deref())
                .map(|v| JsonValue::String(v.to_string()))
                .unwrap_or(JsonValue::Null);
            payload.insert(mapping.portal_field.clone(), value);
        }

        if result.match_type == MatchType::ContactMatch
            && portal.opportunity_id() != Some(remote.id.as_str())
        {
            payload.insert(
                REMOTE_OPPORTUNITY_ID_KEY.to_string(),
                JsonValue::String(remote.id.clone()),
            );
        }

        Ok(payload)
    }

    /// Sync a single matched record. An empty payload returns success
    /// without touching the portal. Update failures come back as an
    /// unsuccessful outcome; only an unmatched record is an error.
    pub async fn sync_one(&self, result: &ComparisonResult) -> Result<SyncOutcome, ReconcileError> {
        let record_id = result.portal_record.id.clone();
        let payload = self.build_payload(result)?;

        if payload.is_empty() {
            info!(record_id = %record_id, "already in sync");
            return Ok(SyncOutcome::succeeded(record_id, Vec::new()));
        }

        let fields = payload.keys().cloned().collect::<Vec<_>>();
        match self.apply(&record_id, &payload).await {
            Ok(()) => {
                info!(record_id = %record_id, fields = ?fields, "portal record updated");
                Ok(SyncOutcome::succeeded(record_id, fields))
            }
            Err(ReconcileError::Update { message, .. }) => {
                warn!(record_id = %record_id, error = %message, "portal update failed");
                Ok(SyncOutcome::failed(record_id, message))
            }
            Err(other) => Err(other),
        }
    }

    async fn apply(
        &self,
        record_id: &str,
        payload: &Map<String, JsonValue>,
    ) -> Result<(), ReconcileError> {
        self.store
            .update_portal_record(record_id, payload)
            .await
            .map_err(|err| ReconcileError::Update {
                record_id: record_id.to_string(),
                message: err.to_string(),
            })
    }

    pub async fn sync_all(
        &self,
        results: &[ComparisonResult],
        reporter: &mut RunReporter,
    ) -> BulkSyncResult {
        self.sync_all_with_cancel(results, reporter, &CancellationToken::new())
            .await
    }

    /// Sync every matched record that has differences, strictly in order,
    /// pausing between records. A failing record never stops the run. The
    /// token is only consulted between records.
    pub async fn sync_all_with_cancel(
        &self,
        results: &[ComparisonResult],
        reporter: &mut RunReporter,
        cancel: &CancellationToken,
    ) -> BulkSyncResult {
        let queue = results
            .iter()
            .filter(|r| r.needs_sync())
            .collect::<Vec<_>>();
        let label_field = self.field_map.label_field();

        reporter.begin(queue.len());
        info!(total = queue.len(), delay_ms = self.delay.as_millis() as u64, "bulk sync started");

        let mut outcomes = Vec::with_capacity(queue.len());
        let mut cancelled = false;
        for (index, result) in queue.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let outcome = match self.sync_one(result).await {
                Ok(outcome) => outcome,
                Err(err) => SyncOutcome::failed(result.portal_record.id.clone(), err.to_string()),
            };
            reporter.record(&outcome, &result.portal_record.label(label_field));
            outcomes.push(outcome);

            if index + 1 < queue.len() && !self.delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }
        }

        let summary = reporter.finish(cancelled);
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled,
            "bulk sync finished"
        );
        BulkSyncResult { outcomes, summary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recon_adapters::AdapterError;
    use recon_core::{CustomField, FieldMapping, PortalRecord, RemoteRecord};
    use std::sync::Mutex;
    use std::time::Instant;

    use crate::differ::compare;

    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<(String, Map<String, JsonValue>)>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl PortalStore for RecordingStore {
        async fn update_portal_record(
            &self,
            record_id: &str,
            fields: &Map<String, JsonValue>,
        ) -> Result<(), AdapterError> {
            self.calls
                .lock()
                .unwrap()
                .push((record_id.to_string(), fields.clone()));
            if self.fail_for.as_deref() == Some(record_id) {
                return Err(AdapterError::Message("http status 409: locked".into()));
            }
            Ok(())
        }
    }

    fn field_map() -> Arc<FieldMap> {
        Arc::new(
            FieldMap::new(vec![
                FieldMapping::custom("contactPhone", "PHONE_ID"),
                FieldMapping::basic("dealName", "name"),
            ])
            .unwrap(),
        )
    }

    fn pair(id: &str, phone: &str, remote_phone: &str) -> (PortalRecord, RemoteRecord) {
        let opp = format!("opp-{id}");
        (
            PortalRecord::new(id)
                .with_field("contactPhone", phone)
                .with_field("dealName", "Main St")
                .with_remote_ids(Some(opp.as_str()), None),
            RemoteRecord::new(opp)
                .with_attribute("name", "Main St")
                .with_custom_field(CustomField::new("PHONE_ID", "phone", remote_phone)),
        )
    }

    #[tokio::test]
    async fn unmatched_record_is_invalid_state_and_never_calls_the_store() {
        let store = Arc::new(RecordingStore::default());
        let executor = SyncExecutor::new(store.clone(), field_map(), Duration::ZERO);
        let results = compare(&[PortalRecord::new("d9")], &[], &field_map());

        let err = executor.sync_one(&results[0]).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidState { ref record_id } if record_id == "d9"));
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn payload_carries_only_disagreeing_fields_and_clears_absent_ones() {
        let store = Arc::new(RecordingStore::default());
        let executor = SyncExecutor::new(store.clone(), field_map(), Duration::ZERO);
        let (portal, remote) = pair("d1", "5551234567", "555-123-4567");
        let mut remote = remote;
        remote.attributes.remove("name");
        let results = compare(&[portal], &[remote], &field_map());

        let outcome = executor.sync_one(&results[0]).await.unwrap();
        assert!(outcome.success);
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].1.get("contactPhone"),
            Some(&JsonValue::String("555-123-4567".into()))
        );
        assert_eq!(calls[0].1.get("dealName"), Some(&JsonValue::Null));
        assert_eq!(outcome.applied_fields, vec!["contactPhone", "dealName"]);
    }

    #[tokio::test]
    async fn in_sync_record_is_a_no_op() {
        let store = Arc::new(RecordingStore::default());
        let executor = SyncExecutor::new(store.clone(), field_map(), Duration::ZERO);
        let (portal, remote) = pair("d1", "555", " 555 ");
        let results = compare(&[portal], &[remote], &field_map());

        let outcome = executor.sync_one(&results[0]).await.unwrap();
        assert!(outcome.already_in_sync());
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn contact_match_relinks_the_opportunity_id() {
        let store = Arc::new(RecordingStore::default());
        let executor = SyncExecutor::new(store.clone(), field_map(), Duration::ZERO);
        let portal = PortalRecord::new("d2")
            .with_field("contactPhone", "1")
            .with_field("dealName", "Main St")
            .with_remote_ids(None, Some("c2"));
        let remote = RemoteRecord::new("opp2")
            .with_contact_id("c2")
            .with_attribute("name", "Main St")
            .with_custom_field(CustomField::new("PHONE_ID", "phone", "1"));
        let results = compare(&[portal], &[remote], &field_map());
        assert_eq!(results[0].match_type, MatchType::ContactMatch);

        let payload = executor.build_payload(&results[0]).unwrap();
        assert_eq!(payload.len(), 1);
        assert_eq!(
            payload.get(REMOTE_OPPORTUNITY_ID_KEY),
            Some(&JsonValue::String("opp2".into()))
        );
    }

    #[tokio::test]
    async fn failing_record_is_isolated_and_run_continues() {
        let store = Arc::new(RecordingStore {
            fail_for: Some("d2".into()),
            ..Default::default()
        });
        let executor = SyncExecutor::new(store.clone(), field_map(), Duration::ZERO);
        let (p1, r1) = pair("d1", "1", "2");
        let (p2, r2) = pair("d2", "1", "2");
        let (p3, r3) = pair("d3", "1", "2");
        let (p4, r4) = pair("d4", "same", "same");
        let results = compare(&[p1, p2, p3, p4], &[r1, r2, r3, r4], &field_map());

        let mut reporter = RunReporter::new();
        let run = executor.sync_all(&results, &mut reporter).await;

        let ids = run.outcomes.iter().map(|o| o.record_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
        assert!(run.outcomes[0].success);
        assert!(!run.outcomes[1].success);
        assert!(run.outcomes[2].success);
        assert_eq!(run.summary.total, 3);
        assert_eq!(run.summary.failed, 1);
        assert_eq!(run.summary.succeeded, 2);
        assert_eq!(run.summary.failures[0].record_id, "d2");
        assert!(run.summary.failures[0].error.contains("locked"));
        assert_eq!(reporter.progress().current, 3);
    }

    #[tokio::test]
    async fn bulk_sync_pauses_between_records_only() {
        let store = Arc::new(RecordingStore::default());
        let executor = SyncExecutor::new(store, field_map(), Duration::from_millis(40));
        let (p1, r1) = pair("d1", "1", "2");
        let (p2, r2) = pair("d2", "1", "2");
        let (p3, r3) = pair("d3", "1", "2");
        let results = compare(&[p1, p2, p3], &[r1, r2, r3], &field_map());

        let start = Instant::now();
        let run = executor.sync_all(&results, &mut RunReporter::new()).await;
        let elapsed = start.elapsed();

        assert_eq!(run.summary.succeeded, 3);
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn cancellation_is_honoured_between_records() {
        let store = Arc::new(RecordingStore::default());
        let executor = SyncExecutor::new(store.clone(), field_map(), Duration::from_millis(200));
        let (p1, r1) = pair("d1", "1", "2");
        let (p2, r2) = pair("d2", "1", "2");
        let results = compare(&[p1, p2], &[r1, r2], &field_map());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let run = executor
            .sync_all_with_cancel(&results, &mut RunReporter::new(), &cancel)
            .await;
        assert_eq!(run.outcomes.len(), 1);
        assert!(run.summary.cancelled);
        assert_eq!(run.summary.skipped, 1);
        assert_eq!(run.summary.total, 2);
        assert_eq!(store.calls.lock().unwrap().len(), 1);
    }
}
