use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use recon_core::FieldMap;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub portal_base_url: String,
    pub portal_api_token: Option<String>,
    pub crm_base_url: String,
    pub crm_api_token: Option<String>,
    pub crm_location_id: Option<String>,
    pub pipeline_id: String,
    pub field_map_path: PathBuf,
    pub sync_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub reports_dir: PathBuf,
    /// When set, each comparison keeps the datasets it ran against here.
    pub snapshots_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        Self {
            portal_base_url: non_empty("PORTAL_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3000/api".to_string()),
            portal_api_token: non_empty("PORTAL_API_TOKEN"),
            crm_base_url: non_empty("CRM_BASE_URL")
                .unwrap_or_else(|| "https://services.leadconnectorhq.com".to_string()),
            crm_api_token: non_empty("CRM_API_TOKEN"),
            crm_location_id: non_empty("CRM_LOCATION_ID"),
            pipeline_id: non_empty("CRM_PIPELINE_ID").unwrap_or_default(),
            field_map_path: non_empty("RECON_FIELD_MAP")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./field_map.yaml")),
            sync_delay: Duration::from_millis(
                non_empty("RECON_SYNC_DELAY_MS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(500),
            ),
            http_timeout_secs: non_empty("RECON_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            user_agent: non_empty("RECON_USER_AGENT")
                .unwrap_or_else(|| "recon-bot/0.1".to_string()),
            reports_dir: non_empty("RECON_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            snapshots_dir: non_empty("RECON_SNAPSHOTS_DIR").map(PathBuf::from),
        }
    }
}

/// Parse and validate a YAML mapping table.
pub fn parse_field_map(text: &str) -> Result<FieldMap> {
    let map: FieldMap = serde_yaml::from_str(text).context("parsing field map yaml")?;
    map.validate().context("validating field map")?;
    Ok(map)
}

pub fn load_field_map(path: impl AsRef<Path>) -> Result<FieldMap> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_field_map(&text).with_context(|| format!("loading {}", path.display()))
}
