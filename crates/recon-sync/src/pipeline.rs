//! Fetch → match → diff → sync orchestration and run reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use recon_adapters::{ApiEndpoint, FixtureRecordSource, HttpRecordSource, PortalStore, RecordFetcher};
use recon_core::{ComparisonResult, DifferenceKind, FieldMap, MatchType, SyncOutcome};
use recon_storage::{HttpClientConfig, HttpFetcher, RunSnapshotStore};
use serde::Serialize;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{load_field_map, SyncConfig};
use crate::differ::compare;
use crate::executor::{BulkSyncResult, SyncExecutor};
use crate::reporter::{RunReporter, RunSummary};
use crate::ReconcileError;

#[derive(Debug, Clone, Serialize)]
pub struct CompareRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pipeline_id: String,
    pub results: Vec<ComparisonResult>,
}

impl CompareRun {
    pub fn count(&self, match_type: MatchType) -> usize {
        self.results.iter().filter(|r| r.match_type == match_type).count()
    }

    pub fn needing_sync(&self) -> usize {
        self.results.iter().filter(|r| r.needs_sync()).count()
    }

    /// Matched records disagreeing on at least one mapped field.
    pub fn mapped_differences(&self) -> usize {
        self.results
            .iter()
            .filter(|r| {
                r.is_matched()
                    && r.differences
                        .iter()
                        .any(|d| matches!(d.kind, DifferenceKind::Basic | DifferenceKind::Custom))
            })
            .count()
    }

    pub fn find(&self, record_id: &str) -> Option<&ComparisonResult> {
        self.results.iter().find(|r| r.portal_record.id == record_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    /// The comparison the run acted on.
    #[serde(skip)]
    pub comparison: CompareRun,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<SyncOutcome>,
    pub summary: RunSummary,
    /// Matched records whose mapped fields still differ after the re-fetch.
    /// Remote-only fields are never pushed and do not count. `None` when the
    /// re-fetch failed; the outcomes above are still authoritative.
    pub remaining_differences: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub convergence_error: Option<String>,
}

pub struct ReconcilePipeline {
    config: SyncConfig,
    field_map: Arc<FieldMap>,
    fetcher: Arc<dyn RecordFetcher>,
    executor: SyncExecutor,
    snapshots: Option<RunSnapshotStore>,
}

impl ReconcilePipeline {
    pub fn new(
        config: SyncConfig,
        field_map: FieldMap,
        fetcher: Arc<dyn RecordFetcher>,
        store: Arc<dyn PortalStore>,
    ) -> Self {
        let field_map = Arc::new(field_map);
        let executor = SyncExecutor::new(store, field_map.clone(), config.sync_delay);
        let snapshots = config.snapshots_dir.clone().map(RunSnapshotStore::new);
        Self {
            config,
            field_map,
            fetcher,
            executor,
            snapshots,
        }
    }

    /// Wire the HTTP portal/CRM clients described by `config`.
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        if config.pipeline_id.is_empty() {
            bail!("CRM_PIPELINE_ID is not set");
        }
        let field_map = load_field_map(&config.field_map_path)?;
        let http = HttpFetcher::new(&HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })?;
        let source = Arc::new(
            HttpRecordSource::new(
                http,
                ApiEndpoint::new(&config.portal_base_url, config.portal_api_token.clone()),
                ApiEndpoint::new(&config.crm_base_url, config.crm_api_token.clone()),
            )
            .with_location_id(config.crm_location_id.clone()),
        );
        Ok(Self::new(config, field_map, source.clone(), source))
    }

    /// Offline variant over fixture files; updates stay in memory.
    pub fn from_fixtures(config: SyncConfig, dir: impl AsRef<Path>) -> Result<Self> {
        let field_map = load_field_map(&config.field_map_path)?;
        let source = Arc::new(FixtureRecordSource::load(dir)?);
        Ok(Self::new(config, field_map, source.clone(), source))
    }

    pub fn field_map(&self) -> &FieldMap {
        &self.field_map
    }

    /// Fetch both datasets and compare them. A failed fetch aborts the
    /// whole operation.
    pub async fn compare(&self) -> Result<CompareRun, ReconcileError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("compare", %run_id, source = self.fetcher.source_id());
        let results = self.fetch_and_compare(run_id).instrument(span).await?;
        Ok(CompareRun {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pipeline_id: self.config.pipeline_id.clone(),
            results,
        })
    }

    async fn fetch_and_compare(&self, run_id: Uuid) -> Result<Vec<ComparisonResult>, ReconcileError> {
        let portal = self.fetcher.fetch_portal().await?;
        let remote = self.fetcher.fetch_remote(&self.config.pipeline_id).await?;
        if let Some(snapshots) = &self.snapshots {
            // Snapshot failures never fail the comparison.
            match snapshots
                .store_run(run_id, &self.config.pipeline_id, &portal, &remote)
                .await
            {
                Ok(_) => info!(dir = %snapshots.run_dir(run_id).display(), "datasets captured"),
                Err(err) => warn!(error = %format!("{err:#}"), "dataset snapshot failed"),
            }
        }
        let results = compare(&portal, &remote, &self.field_map);
        info!(
            portal = portal.len(),
            remote = remote.len(),
            differing = results.iter().filter(|r| r.needs_sync()).count(),
            unmatched = results.iter().filter(|r| !r.is_matched()).count(),
            "comparison complete"
        );
        Ok(results)
    }

    /// Compare, then sync the one record with this portal id.
    pub async fn sync_one(&self, record_id: &str) -> Result<SyncOutcome, ReconcileError> {
        let run = self.compare().await?;
        let result = run
            .find(record_id)
            .ok_or_else(|| ReconcileError::UnknownRecord(record_id.to_string()))?;
        self.executor.sync_one(result).await
    }

    pub async fn sync_all(&self, reporter: &mut RunReporter) -> Result<SyncRun, ReconcileError> {
        self.sync_all_with_cancel(reporter, &CancellationToken::new())
            .await
    }

    /// Compare, bulk-sync, then re-fetch and compare again to measure
    /// convergence. Only the first fetch can fail the run: once updates have
    /// been sent their outcomes are returned even if the re-fetch fails.
    pub async fn sync_all_with_cancel(
        &self,
        reporter: &mut RunReporter,
        cancel: &CancellationToken,
    ) -> Result<SyncRun, ReconcileError> {
        let before = self.compare().await?;
        let span = info_span!("sync_all", run_id = %before.run_id);
        let BulkSyncResult { outcomes, summary } = self
            .executor
            .sync_all_with_cancel(&before.results, reporter, cancel)
            .instrument(span)
            .await;

        let (remaining_differences, convergence_error) = match self.compare().await {
            Ok(after) => {
                let remaining = after.mapped_differences();
                info!(remaining_differences = remaining, "post-sync comparison complete");
                (Some(remaining), None)
            }
            Err(err) => {
                warn!(run_id = %before.run_id, error = %err, "post-sync re-fetch failed");
                (None, Some(err.to_string()))
            }
        };

        Ok(SyncRun {
            run_id: before.run_id,
            started_at: before.started_at,
            finished_at: Utc::now(),
            comparison: before,
            outcomes,
            summary,
            remaining_differences,
            convergence_error,
        })
    }

    async fn create_run_dir(&self, run_id: Uuid) -> Result<PathBuf> {
        let dir = self.config.reports_dir.join(run_id.to_string());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        Ok(dir)
    }

    async fn write_comparison(dir: &Path, run: &CompareRun) -> Result<()> {
        let json = serde_json::to_vec_pretty(run).context("serializing comparison")?;
        fs::write(dir.join("comparison.json"), json)
            .await
            .context("writing comparison.json")
    }

    /// `comparison.json` plus a markdown brief under `<reports>/<run_id>/`.
    pub async fn write_compare_report(&self, run: &CompareRun) -> Result<PathBuf> {
        let dir = self.create_run_dir(run.run_id).await?;
        Self::write_comparison(&dir, run).await?;
        fs::write(
            dir.join("run_brief.md"),
            compare_brief(run, self.field_map.label_field()),
        )
        .await
        .context("writing run_brief.md")?;
        Ok(dir)
    }

    /// The pre-sync `comparison.json`, `sync_outcomes.json` and a brief.
    pub async fn write_sync_report(&self, run: &SyncRun) -> Result<PathBuf> {
        let dir = self.create_run_dir(run.run_id).await?;
        Self::write_comparison(&dir, &run.comparison).await?;

        let json = serde_json::to_vec_pretty(run).context("serializing sync outcomes")?;
        fs::write(dir.join("sync_outcomes.json"), json)
            .await
            .context("writing sync_outcomes.json")?;
        fs::write(dir.join("run_brief.md"), sync_brief(run))
            .await
            .context("writing run_brief.md")?;
        Ok(dir)
    }
}

fn compare_brief(run: &CompareRun, label_field: Option<&str>) -> String {
    let mut lines = vec![
        "# Reconciliation Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Pipeline: `{}`", run.pipeline_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Portal records: {}", run.results.len()),
        format!("- Matched by id: {}", run.count(MatchType::IdMatch)),
        format!("- Matched by contact: {}", run.count(MatchType::ContactMatch)),
        format!("- Unmatched: {}", run.count(MatchType::NoMatch)),
        format!("- Needing sync: {}", run.needing_sync()),
        String::new(),
        "## Differences".to_string(),
    ];

    for result in run.results.iter().filter(|r| !r.differences.is_empty()) {
        lines.push(String::new());
        lines.push(format!(
            "### {} (`{}`)",
            result.portal_record.label(label_field),
            result.portal_record.id
        ));
        for diff in &result.differences {
            let kind = match diff.kind {
                DifferenceKind::Basic => "basic",
                DifferenceKind::Custom => "custom",
                DifferenceKind::RemoteOnly => "remote only",
                DifferenceKind::Missing => "no CRM match",
            };
            lines.push(format!(
                "- {} [{}]: portal `{}` / crm `{}`",
                diff.field,
                kind,
                diff.portal_value.as_deref().unwrap_or("-"),
                diff.remote_value.as_deref().unwrap_or("-"),
            ));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

fn sync_brief(run: &SyncRun) -> String {
    let summary = &run.summary;
    let mut lines = vec![
        "# Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at),
        format!("- Finished: {}", run.finished_at),
        format!("- Attempted: {}", summary.total),
        format!("- Succeeded: {}", summary.succeeded),
        format!("- Failed: {}", summary.failed),
    ];
    match (run.remaining_differences, &run.convergence_error) {
        (Some(remaining), _) => lines.push(format!("- Still differing after sync: {remaining}")),
        (None, Some(err)) => {
            lines.push(format!("- Still differing after sync: unknown (re-fetch failed: {err})"))
        }
        (None, None) => lines.push("- Still differing after sync: unknown".to_string()),
    }
    if summary.cancelled {
        lines.push(format!("- Cancelled with {} record(s) skipped", summary.skipped));
    }
    if !summary.failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for failure in &summary.failures {
            lines.push(format!("- `{}`: {}", failure.record_id, failure.error));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Compare once and write the comparison report.
pub async fn run_compare(pipeline: &ReconcilePipeline) -> Result<(CompareRun, PathBuf)> {
    let run = pipeline.compare().await?;
    let dir = pipeline.write_compare_report(&run).await?;
    Ok((run, dir))
}

/// Bulk-sync and write the sync report. The report is written whether or
/// not individual records failed.
pub async fn run_sync(
    pipeline: &ReconcilePipeline,
    reporter: &mut RunReporter,
    cancel: &CancellationToken,
) -> Result<(SyncRun, PathBuf)> {
    let run = pipeline.sync_all_with_cancel(reporter, cancel).await?;
    let dir = pipeline.write_sync_report(&run).await?;
    Ok((run, dir))
}

pub async fn run_compare_from_env() -> Result<(CompareRun, PathBuf)> {
    let pipeline = ReconcilePipeline::from_config(SyncConfig::from_env())?;
    run_compare(&pipeline).await
}

pub async fn run_sync_from_env(
    reporter: &mut RunReporter,
    cancel: &CancellationToken,
) -> Result<(SyncRun, PathBuf)> {
    let pipeline = ReconcilePipeline::from_config(SyncConfig::from_env())?;
    run_sync(&pipeline, reporter, cancel).await
}
