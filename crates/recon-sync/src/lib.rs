//! Reconciliation pipeline: match portal deals to CRM opportunities, diff
//! them field by field and push CRM values back onto the portal.

pub mod config;
pub mod differ;
pub mod executor;
pub mod matcher;
pub mod pipeline;
pub mod reporter;

use recon_adapters::AdapterError;
use thiserror::Error;

pub use config::{load_field_map, parse_field_map, SyncConfig};
pub use differ::{compare, Differ};
pub use executor::{BulkSyncResult, SyncExecutor};
pub use matcher::Matcher;
pub use pipeline::{
    run_compare, run_compare_from_env, run_sync, run_sync_from_env, CompareRun,
    ReconcilePipeline, SyncRun,
};
pub use reporter::{FailureEntry, RunReporter, RunSummary, SyncProgress};

pub const CRATE_NAME: &str = "recon-sync";

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Either dataset could not be fetched; the whole operation is aborted.
    #[error("fetch failed: {0}")]
    Fetch(#[from] AdapterError),
    #[error("record {record_id} has no matched remote record and cannot be synced")]
    InvalidState { record_id: String },
    #[error("update rejected for {record_id}: {message}")]
    Update { record_id: String, message: String },
    #[error("portal record {0} not found")]
    UnknownRecord(String),
}
