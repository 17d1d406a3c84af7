//! Sync pipeline: pull warehouse rows, reconcile them, publish one local snapshot.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use plbg_adapters::{
    decode_rows, DecodedRows, FixtureWarehouseSource, HttpWarehouseConfig, HttpWarehouseSource,
    LedgerScope, WarehouseSource,
};
use plbg_core::{
    CanonicalProjectId, ConnectorError, RawLedgerRow, RawProjectRow, RawScopeRow,
    RawUmbrellaRow, RawWbsRow, Snapshot, SnapshotHeader, SyncError, SyncIssue, SyncResult,
    SyncStatus,
};
use plbg_storage::LocalStore;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod export;
pub mod reconcile;

pub use config::{DashboardConfig, LedgerScopeMode, SyncConfig, WarehouseMode};
pub use export::{export_snapshot_parquet, ParquetManifest, ParquetManifestFile};
pub use reconcile::{
    comment_po_references, reconcile, reconcile_sources, ReconcileConfig, ReconciledSnapshot,
    SourceRows, UmbrellaConfig, WbsNode,
};

pub const CRATE_NAME: &str = "plbg-sync";

pub struct SyncPipeline {
    source: Arc<dyn WarehouseSource>,
    store: LocalStore,
    reconcile: ReconcileConfig,
    ledger_scope: LedgerScopeMode,
    source_timeout: Duration,
    run_guard: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn WarehouseSource>,
        store: LocalStore,
        reconcile: ReconcileConfig,
    ) -> Self {
        Self {
            source,
            store,
            reconcile,
            ledger_scope: LedgerScopeMode::Projects,
            source_timeout: Duration::from_secs(60),
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_ledger_scope(mut self, ledger_scope: LedgerScopeMode) -> Self {
        self.ledger_scope = ledger_scope;
        self
    }

    pub fn with_source_timeout(mut self, source_timeout: Duration) -> Self {
        self.source_timeout = source_timeout;
        self
    }

    /// Open (and migrate) the store and build the configured warehouse source.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let dashboard = DashboardConfig::load(&config.config_path)?;
        let store = LocalStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        store.migrate().await.context("running store migrations")?;

        let source: Arc<dyn WarehouseSource> = match config.warehouse_mode {
            WarehouseMode::Fixture => {
                Arc::new(FixtureWarehouseSource::load(&config.fixture_bundle)?)
            }
            WarehouseMode::Http => {
                let endpoint = config
                    .warehouse_url
                    .clone()
                    .context("PLBG_WAREHOUSE_URL is required when PLBG_WAREHOUSE_MODE=http")?;
                Arc::new(HttpWarehouseSource::new(HttpWarehouseConfig {
                    endpoint,
                    token: config.warehouse_token.clone(),
                    request_timeout: config.source_timeout(),
                    tables: dashboard.tables.clone(),
                    user_agent: Some(config.user_agent.clone()),
                })?)
            }
        };
        info!(
            source = source.source_id(),
            database_url = %config.database_url,
            "sync pipeline ready"
        );

        Ok(Self::new(source, store, dashboard.reconcile_config())
            .with_ledger_scope(config.ledger_scope)
            .with_source_timeout(config.source_timeout()))
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn ledger_scope(&self) -> LedgerScopeMode {
        self.ledger_scope
    }

    /// Run one sync. Returns at once with an `already_running` error when a run is active.
    pub async fn run_sync(&self) -> SyncResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!(%run_id, "sync requested while another run is in progress");
            let busy = SyncIssue::from(&SyncError::AlreadyRunning);
            return failed_result(run_id, started_at, vec![busy]);
        };
        self.execute(run_id, started_at)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn execute(&self, run_id: Uuid, started_at: DateTime<Utc>) -> SyncResult {
        info!(source = self.source.source_id(), "sync run started");
        let (snapshot, issues) = match self.build_snapshot(run_id).await {
            Ok(built) => built,
            Err(err) => {
                error!(error = %err, "sync run aborted");
                return failed_result(run_id, started_at, vec![SyncIssue::from(&err)]);
            }
        };

        if let Err(err) = self.store.replace_snapshot(&snapshot).await {
            let err = SyncError::Write(err.to_string());
            error!(error = %err, "sync run aborted");
            let mut errors = issues;
            errors.push(SyncIssue::from(&err));
            return failed_result(run_id, started_at, errors);
        }

        info!(
            projects = snapshot.header.projects_loaded,
            purchase_orders = snapshot.header.pos_loaded,
            orphaned = snapshot.header.orphaned_pos,
            skipped_rows = issues.len(),
            "sync run completed"
        );
        SyncResult {
            run_id,
            status: SyncStatus::Completed,
            started_at,
            finished_at: Utc::now(),
            projects_loaded: snapshot.header.projects_loaded,
            pos_loaded: snapshot.header.pos_loaded,
            orphaned_pos: snapshot.header.orphaned_pos,
            errors: issues,
        }
    }

    async fn build_snapshot(&self, run_id: Uuid) -> Result<(Snapshot, Vec<SyncIssue>), SyncError> {
        let project_set = self
            .bounded("fetch_projects", self.source.fetch_projects(&self.reconcile.program_types))
            .await?;
        let projects = decode_rows::<RawProjectRow>(&project_set)?;

        let ids = candidate_ids(&self.reconcile, &projects.rows);
        let ledger_scope = match self.ledger_scope {
            LedgerScopeMode::Projects => LedgerScope::Projects(ids.clone()),
            LedgerScopeMode::All => LedgerScope::All,
        };
        let ledger_set = self
            .bounded("fetch_po_ledger", self.source.fetch_po_ledger(&ledger_scope))
            .await?;
        let ledger = decode_rows::<RawLedgerRow>(&ledger_set)?;

        let scope_set = self
            .bounded("fetch_scope_attributes", self.source.fetch_scope_attributes(&ids))
            .await?;
        let scope = decode_rows::<RawScopeRow>(&scope_set)?;

        let umbrella = match self.reconcile.umbrella.definition() {
            Some(definition) => {
                let vendors = &self.reconcile.umbrella.vendors;
                let set = self
                    .bounded(
                        "fetch_umbrella_po_lines",
                        self.source.fetch_umbrella_po_lines(&definition, vendors),
                    )
                    .await?;
                decode_rows::<RawUmbrellaRow>(&set)?
            }
            None => DecodedRows::default(),
        };

        let missing = uncited_ledger_numbers(&self.reconcile, &projects.rows, &ledger.rows);
        let comment_lines = if missing.is_empty() {
            DecodedRows::default()
        } else {
            let set = self
                .bounded(
                    "fetch_po_lines_by_number",
                    self.source.fetch_po_lines_by_number(&missing),
                )
                .await?;
            decode_rows::<RawLedgerRow>(&set)?
        };

        let node_keys = self.reconcile.wbs_node_keys();
        let wbs = if node_keys.is_empty() {
            DecodedRows::default()
        } else {
            let set = self
                .bounded("fetch_wbs_budgets", self.source.fetch_wbs_budgets(&node_keys))
                .await?;
            decode_rows::<RawWbsRow>(&set)?
        };

        let freshness = self
            .bounded("source_freshness", self.source.source_freshness())
            .await?;

        let ReconciledSnapshot {
            projects: normalized,
            purchase_orders,
            wbs_budgets,
            issues: transform_issues,
        } = reconcile_sources(
            &self.reconcile,
            &SourceRows {
                projects: &projects.rows,
                ledger: &ledger.rows,
                scope: &scope.rows,
                umbrella: &umbrella.rows,
                comment_lines: &comment_lines.rows,
                wbs: &wbs.rows,
            },
        );

        let issues = projects
            .rejected
            .into_iter()
            .chain(ledger.rejected)
            .chain(scope.rejected)
            .chain(umbrella.rejected)
            .chain(comment_lines.rejected)
            .chain(wbs.rejected)
            .chain(transform_issues)
            .map(|issue| {
                warn!(
                    table = %issue.table,
                    row = issue.row,
                    reason = %issue.reason,
                    "skipping row"
                );
                SyncIssue::from(&SyncError::from(issue))
            })
            .collect();

        let orphaned_pos = purchase_orders.iter().filter(|po| po.orphaned).count();
        let snapshot = Snapshot {
            header: SnapshotHeader {
                run_id,
                created_at: Utc::now(),
                projects_loaded: normalized.len(),
                pos_loaded: purchase_orders.len(),
                orphaned_pos,
            },
            projects: normalized,
            purchase_orders,
            wbs_budgets,
            freshness,
        };
        Ok((snapshot, issues))
    }

    async fn bounded<T>(
        &self,
        call: &str,
        fut: impl Future<Output = Result<T, ConnectorError>>,
    ) -> Result<T, ConnectorError> {
        match tokio::time::timeout(self.source_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout {
                call: call.to_string(),
                seconds: self.source_timeout.as_secs(),
            }),
        }
    }

    /// Cron-driven runs go through the same guard as manual ones.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
        config: &SyncConfig,
    ) -> Result<Option<JobScheduler>> {
        if !config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&config.sync_cron_1, &config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    let result = pipeline.run_sync().await;
                    if !result.is_success() {
                        warn!(
                            run_id = %result.run_id,
                            errors = result.errors.len(),
                            "scheduled sync did not complete"
                        );
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

/// Ids of in-program projects with a well-formed definition; the ledger and scope fetches
/// are narrowed to these.
fn candidate_ids(config: &ReconcileConfig, rows: &[RawProjectRow]) -> Vec<CanonicalProjectId> {
    rows.iter()
        .filter(|row| config.allows(row.project_type.as_deref().unwrap_or_default()))
        .filter_map(|row| row.sap_project_definition.as_deref())
        .filter_map(|def| CanonicalProjectId::from_dashed(def).ok())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Comment-cited PO numbers the ledger fetch did not return.
fn uncited_ledger_numbers(
    config: &ReconcileConfig,
    projects: &[RawProjectRow],
    ledger: &[RawLedgerRow],
) -> Vec<String> {
    let present: BTreeSet<&str> = ledger
        .iter()
        .filter_map(|row| row.po_number.as_deref())
        .map(str::trim)
        .collect();
    comment_po_references(config, projects)
        .into_keys()
        .filter(|po| !present.contains(po.as_str()))
        .collect()
}

fn failed_result(run_id: Uuid, started_at: DateTime<Utc>, errors: Vec<SyncIssue>) -> SyncResult {
    SyncResult {
        run_id,
        status: SyncStatus::Failed,
        started_at,
        finished_at: Utc::now(),
        projects_loaded: 0,
        pos_loaded: 0,
        orphaned_pos: 0,
        errors,
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncResult> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    Ok(pipeline.run_sync().await)
}
