use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use plbg_adapters::WarehouseTables;
use serde::{Deserialize, Serialize};

use crate::reconcile::{
    default_wbs_nodes, ReconcileConfig, UmbrellaConfig, WbsNode, DEFAULT_PROGRAM_TYPES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseMode {
    Fixture,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerScopeMode {
    /// Ask the warehouse only for ledger lines of the projects just fetched.
    Projects,
    All,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub warehouse_mode: WarehouseMode,
    pub warehouse_url: Option<String>,
    pub warehouse_token: Option<String>,
    pub fixture_bundle: PathBuf,
    pub source_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub config_path: PathBuf,
    pub ledger_scope: LedgerScopeMode,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://dashboard.db".to_string()),
            warehouse_mode: match std::env::var("PLBG_WAREHOUSE_MODE") {
                Ok(v) if v.eq_ignore_ascii_case("http") => WarehouseMode::Http,
                _ => WarehouseMode::Fixture,
            },
            warehouse_url: std::env::var("PLBG_WAREHOUSE_URL").ok().filter(|v| !v.is_empty()),
            warehouse_token: std::env::var("PLBG_WAREHOUSE_TOKEN").ok().filter(|v| !v.is_empty()),
            fixture_bundle: std::env::var("PLBG_FIXTURE_BUNDLE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("fixtures/sample/bundle.json")),
            source_timeout_secs: std::env::var("PLBG_SOURCE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            scheduler_enabled: std::env::var("PLBG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            config_path: std::env::var("PLBG_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dashboard.yaml")),
            ledger_scope: match std::env::var("PLBG_LEDGER_SCOPE") {
                Ok(v) if v.eq_ignore_ascii_case("all") => LedgerScopeMode::All,
                _ => LedgerScopeMode::Projects,
            },
            user_agent: std::env::var("PLBG_USER_AGENT")
                .unwrap_or_else(|_| "plbg-dashboard/0.1".to_string()),
        }
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs.max(1))
    }
}

/// Contents of `dashboard.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub program_types: Vec<String>,
    pub tables: WarehouseTables,
    pub umbrella: UmbrellaConfig,
    pub wbs_nodes: Vec<WbsNode>,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            program_types: DEFAULT_PROGRAM_TYPES.iter().map(|t| t.to_string()).collect(),
            tables: WarehouseTables::default(),
            umbrella: UmbrellaConfig::default(),
            wbs_nodes: default_wbs_nodes(),
        }
    }
}

impl DashboardConfig {
    /// Missing file means built-in defaults; a file that does not parse is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            program_types: self.program_types.clone(),
            umbrella: self.umbrella.clone(),
            wbs_nodes: self.wbs_nodes.clone(),
        }
    }
}
