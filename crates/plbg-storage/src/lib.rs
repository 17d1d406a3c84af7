//! SQLite mirror of the reconciled warehouse data.
//!
//! Every row carries the id of the snapshot that wrote it and a single-row pointer table
//! names the current snapshot. Writers publish a run by moving the pointer inside the
//! same transaction that inserted the rows; readers resolve the pointer in the same
//! statement (or read transaction) they read rows with.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use plbg_core::{
    Budget, CanonicalProjectId, PoSource, Project, PurchaseOrder, Snapshot, SnapshotHeader,
    SourceFreshness, WbsNodeBudget,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "plbg-storage";

const CURRENT_SNAPSHOT: &str = "(SELECT snapshot_id FROM snapshot_pointer WHERE id = 1)";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row in {table}: {reason}")]
    Decode { table: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Connect with a `sqlite://` url, creating the database file when missing.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!().run(&self.pool).await?;
        Ok(())
    }

    /// Write `snapshot` and make it current in one transaction, then drop older snapshots.
    ///
    /// Any failure rolls the whole transaction back and the previous snapshot stays current.
    #[tracing::instrument(skip_all, fields(snapshot_id = %snapshot.header.run_id))]
    pub async fn replace_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let snapshot_id = snapshot.header.run_id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO snapshots
                (snapshot_id, created_at, projects_loaded, pos_loaded, orphaned_pos)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot_id)
        .bind(snapshot.header.created_at.to_rfc3339())
        .bind(snapshot.header.projects_loaded as i64)
        .bind(snapshot.header.pos_loaded as i64)
        .bind(snapshot.header.orphaned_pos as i64)
        .execute(&mut *tx)
        .await?;

        for p in &snapshot.projects {
            sqlx::query(
                r#"
                INSERT INTO projects
                    (snapshot_id, canonical_id, project_id, sap_project_definition, project_type,
                     project_status, store, sequence, store_sequence, city, state, store_type,
                     banner, general_contractor, brief_scope_of_work, created_date,
                     completion_date, pmo_comments, source_updated_at,
                     budget_total, budget_open, budget_committed, budget_actuals)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&snapshot_id)
            .bind(p.canonical_id.as_str())
            .bind(&p.project_id)
            .bind(&p.sap_project_definition)
            .bind(&p.category)
            .bind(&p.status)
            .bind(&p.store)
            .bind(&p.sequence)
            .bind(&p.store_sequence)
            .bind(&p.city)
            .bind(&p.state)
            .bind(&p.store_type)
            .bind(&p.banner)
            .bind(&p.general_contractor)
            .bind(&p.scope)
            .bind(&p.created_date)
            .bind(&p.completion_date)
            .bind(&p.pmo_comments)
            .bind(&p.source_updated_at)
            .bind(p.budget.total)
            .bind(p.budget.open)
            .bind(p.budget.committed)
            .bind(p.budget.actuals)
            .execute(&mut *tx)
            .await?;
        }

        for po in &snapshot.purchase_orders {
            sqlx::query(
                r#"
                INSERT INTO purchase_orders
                    (snapshot_id, po_number, project_canonical_id, vendor, ordered_total,
                     invoiced_total, remaining, po_status, created_date, last_update,
                     commitment_lines, invoice_lines, orphaned, source)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&snapshot_id)
            .bind(&po.po_number)
            .bind(po.project_canonical_id.as_str())
            .bind(&po.vendor)
            .bind(po.ordered_total)
            .bind(po.invoiced_total)
            .bind(po.remaining)
            .bind(&po.status)
            .bind(&po.created_date)
            .bind(&po.last_update)
            .bind(i64::from(po.commitment_lines))
            .bind(i64::from(po.invoice_lines))
            .bind(i64::from(po.orphaned))
            .bind(po.source.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for node in &snapshot.wbs_budgets {
            sqlx::query(
                r#"
                INSERT INTO wbs_budgets
                    (snapshot_id, node_key, approval_year, node_label, description,
                     original_budget, supplemental_budget, returned_budget, current_budget,
                     actuals, open_commitments, budget_available, distributed_budget,
                     budget_cf_from_prev, budget_cf_to_next, project_count, found)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&snapshot_id)
            .bind(&node.node_key)
            .bind(&node.approval_year)
            .bind(&node.node_label)
            .bind(&node.description)
            .bind(node.original_budget)
            .bind(node.supplemental_budget)
            .bind(node.returned_budget)
            .bind(node.current_budget)
            .bind(node.actuals)
            .bind(node.open_commitments)
            .bind(node.budget_available)
            .bind(node.distributed_budget)
            .bind(node.budget_cf_from_prev)
            .bind(node.budget_cf_to_next)
            .bind(i64::from(node.project_count))
            .bind(i64::from(node.found))
            .execute(&mut *tx)
            .await?;
        }

        for f in &snapshot.freshness {
            sqlx::query(
                r#"
                INSERT INTO source_freshness
                    (snapshot_id, source_key, source_label, source_last_updated)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&snapshot_id)
            .bind(&f.source_key)
            .bind(&f.source_label)
            .bind(&f.source_last_updated)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO snapshot_pointer (id, snapshot_id) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET snapshot_id = excluded.snapshot_id
            "#,
        )
        .bind(&snapshot_id)
        .execute(&mut *tx)
        .await?;

        for table in [
            "purchase_orders",
            "projects",
            "source_freshness",
            "wbs_budgets",
            "snapshots",
        ] {
            let removed = sqlx::query(&format!("DELETE FROM {table} WHERE snapshot_id != ?"))
                .bind(&snapshot_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            debug!(table, removed, "pruned superseded snapshot rows");
        }

        tx.commit().await?;
        info!(
            projects = snapshot.projects.len(),
            purchase_orders = snapshot.purchase_orders.len(),
            "snapshot published"
        );
        Ok(())
    }

    pub async fn current_snapshot(&self) -> Result<Option<SnapshotHeader>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT * FROM snapshots WHERE snapshot_id = {CURRENT_SNAPSHOT}"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(snapshot_header_from_row).transpose()
    }

    pub async fn source_freshness(&self) -> Result<Vec<SourceFreshness>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT source_key, source_label, source_last_updated
              FROM source_freshness
             WHERE snapshot_id = {CURRENT_SNAPSHOT}
             ORDER BY source_key
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SourceFreshness {
                    source_key: row.try_get("source_key")?,
                    source_label: row.try_get("source_label")?,
                    source_last_updated: row.try_get("source_last_updated")?,
                })
            })
            .collect()
    }

    /// WBS fund rows of the current snapshot, by node then approval year.
    pub async fn wbs_budgets(&self) -> Result<Vec<WbsNodeBudget>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT * FROM wbs_budgets
             WHERE snapshot_id = {CURRENT_SNAPSHOT}
             ORDER BY node_key, approval_year
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(wbs_budget_from_row).collect()
    }

    pub async fn summary_stats(&self, search: Option<&str>) -> Result<SummaryStats, StoreError> {
        let clause = project_search_clause(search);
        let mut tx = self.pool.begin().await?;

        let project_sql = format!(
            r#"
            SELECT COUNT(*) AS total_projects,
                   COALESCE(SUM(CASE WHEN LOWER(p.project_status) = 'active' THEN 1 ELSE 0 END), 0)
                       AS active_projects,
                   COALESCE(SUM(p.budget_total), 0.0) AS total_budget,
                   COALESCE(SUM(p.budget_actuals), 0.0) AS total_actuals
              FROM projects p
             WHERE p.snapshot_id = {CURRENT_SNAPSHOT}{}
            "#,
            clause.sql
        );
        let projects = bind_all(sqlx::query(&project_sql), &clause.params)
            .fetch_one(&mut *tx)
            .await?;

        let scope = if clause.sql.is_empty() {
            String::new()
        } else {
            format!(
                " AND po.project_canonical_id IN (SELECT p.canonical_id FROM projects p \
                 WHERE p.snapshot_id = po.snapshot_id{})",
                clause.sql
            )
        };
        let po_sql = format!(
            r#"
            SELECT COUNT(*) AS total_pos,
                   COALESCE(SUM(po.remaining), 0.0) AS remaining_to_invoice,
                   COALESCE(SUM(po.orphaned), 0) AS orphaned_pos
              FROM purchase_orders po
             WHERE po.snapshot_id = {CURRENT_SNAPSHOT}{scope}
            "#
        );
        let pos = bind_all(sqlx::query(&po_sql), &clause.params)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(SummaryStats {
            total_projects: projects.try_get("total_projects")?,
            active_projects: projects.try_get("active_projects")?,
            total_budget: projects.try_get("total_budget")?,
            total_actuals: projects.try_get("total_actuals")?,
            remaining_to_invoice: pos.try_get("remaining_to_invoice")?,
            total_pos: pos.try_get("total_pos")?,
            orphaned_pos: pos.try_get("orphaned_pos")?,
        })
    }

    pub async fn projects_by_type(
        &self,
        search: Option<&str>,
    ) -> Result<Vec<CountRow>, StoreError> {
        self.count_projects_by("p.project_type", search).await
    }

    pub async fn projects_by_status(
        &self,
        search: Option<&str>,
    ) -> Result<Vec<CountRow>, StoreError> {
        self.count_projects_by("p.project_status", search).await
    }

    async fn count_projects_by(
        &self,
        column: &'static str,
        search: Option<&str>,
    ) -> Result<Vec<CountRow>, StoreError> {
        let clause = project_search_clause(search);
        let sql = format!(
            r#"
            SELECT {column} AS label, COUNT(*) AS cnt
              FROM projects p
             WHERE p.snapshot_id = {CURRENT_SNAPSHOT}{}
             GROUP BY {column}
             ORDER BY cnt DESC, label
            "#,
            clause.sql
        );
        let rows = bind_all(sqlx::query(&sql), &clause.params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(CountRow {
                    label: row.try_get("label")?,
                    count: row.try_get("cnt")?,
                })
            })
            .collect()
    }

    pub async fn budget_by_type(
        &self,
        search: Option<&str>,
    ) -> Result<Vec<BudgetByType>, StoreError> {
        let clause = project_search_clause(search);
        let sql = format!(
            r#"
            SELECT p.project_type,
                   COALESCE(SUM(p.budget_total), 0.0) AS budget_total,
                   COALESCE(SUM(p.budget_actuals), 0.0) AS budget_actuals,
                   COALESCE(SUM(p.budget_committed), 0.0) AS budget_committed,
                   COALESCE(SUM(p.budget_open), 0.0) AS budget_open
              FROM projects p
             WHERE p.snapshot_id = {CURRENT_SNAPSHOT}{}
             GROUP BY p.project_type
             ORDER BY budget_total DESC, p.project_type
            "#,
            clause.sql
        );
        let rows = bind_all(sqlx::query(&sql), &clause.params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(BudgetByType {
                    project_type: row.try_get("project_type")?,
                    budget_total: row.try_get("budget_total")?,
                    budget_actuals: row.try_get("budget_actuals")?,
                    budget_committed: row.try_get("budget_committed")?,
                    budget_open: row.try_get("budget_open")?,
                })
            })
            .collect()
    }

    pub async fn top_contractors(
        &self,
        search: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ContractorRow>, StoreError> {
        let clause = project_search_clause(search);
        let sql = format!(
            r#"
            SELECT COALESCE(p.general_contractor, 'Unassigned') AS contractor,
                   COUNT(*) AS project_count,
                   COALESCE(SUM(p.budget_total), 0.0) AS total_budget
              FROM projects p
             WHERE p.snapshot_id = {CURRENT_SNAPSHOT}{}
             GROUP BY contractor
             ORDER BY project_count DESC, contractor
             LIMIT ?
            "#,
            clause.sql
        );
        let rows = bind_all(sqlx::query(&sql), &clause.params)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ContractorRow {
                    contractor: row.try_get("contractor")?,
                    project_count: row.try_get("project_count")?,
                    total_budget: row.try_get("total_budget")?,
                })
            })
            .collect()
    }

    pub async fn po_status_summary(
        &self,
        search: Option<&str>,
    ) -> Result<Vec<PoStatusRow>, StoreError> {
        let clause = project_search_clause(search);
        let scope = if clause.sql.is_empty() {
            String::new()
        } else {
            format!(
                " AND po.project_canonical_id IN (SELECT p.canonical_id FROM projects p \
                 WHERE p.snapshot_id = po.snapshot_id{})",
                clause.sql
            )
        };
        let sql = format!(
            r#"
            SELECT COALESCE(po.po_status, 'Unknown') AS status,
                   COUNT(*) AS cnt,
                   COALESCE(SUM(po.ordered_total), 0.0) AS total
              FROM purchase_orders po
             WHERE po.snapshot_id = {CURRENT_SNAPSHOT}{scope}
             GROUP BY status
             ORDER BY cnt DESC, status
            "#
        );
        let rows = bind_all(sqlx::query(&sql), &clause.params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(PoStatusRow {
                    status: row.try_get("status")?,
                    count: row.try_get("cnt")?,
                    total: row.try_get("total")?,
                })
            })
            .collect()
    }

    pub async fn list_projects(
        &self,
        filter: &ProjectFilter,
    ) -> Result<Vec<ProjectSummary>, StoreError> {
        let mut sql = format!(
            r#"
            SELECT p.*,
                   COALESCE(agg.po_count, 0) AS po_count,
                   COALESCE(agg.ordered, p.budget_committed) AS po_ordered,
                   COALESCE(agg.invoiced, p.budget_actuals) AS po_invoiced,
                   COALESCE(agg.ordered - agg.invoiced, p.budget_open) AS remaining
              FROM projects p
              LEFT JOIN (
                    SELECT project_canonical_id,
                           COUNT(*) AS po_count,
                           SUM(ordered_total) AS ordered,
                           SUM(invoiced_total) AS invoiced
                      FROM purchase_orders
                     WHERE snapshot_id = {CURRENT_SNAPSHOT} AND orphaned = 0
                     GROUP BY project_canonical_id
              ) agg ON agg.project_canonical_id = p.canonical_id
             WHERE p.snapshot_id = {CURRENT_SNAPSHOT}
            "#
        );
        let mut params: Vec<String> = Vec::new();
        for (column, value) in [
            ("p.project_type", &filter.project_type),
            ("p.project_status", &filter.status),
            ("p.general_contractor", &filter.contractor),
            ("p.banner", &filter.banner),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                sql.push_str(&format!(" AND {column} = ?"));
                params.push(value.to_string());
            }
        }
        let clause = project_search_clause(filter.search.as_deref());
        sql.push_str(&clause.sql);
        params.extend(clause.params);
        sql.push_str(&format!(
            " ORDER BY {} {}, p.canonical_id",
            project_sort_column(filter.sort.as_deref()),
            sort_direction(filter.order.as_deref())
        ));

        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ProjectSummary {
                    project: project_from_row(row)?,
                    po_count: row.try_get("po_count")?,
                    po_ordered: row.try_get("po_ordered")?,
                    po_invoiced: row.try_get("po_invoiced")?,
                    remaining: row.try_get("remaining")?,
                })
            })
            .collect()
    }

    /// Project and its purchase orders, read from the same snapshot.
    pub async fn project_detail(
        &self,
        canonical_id: &str,
    ) -> Result<Option<ProjectDetail>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT * FROM projects p \
             WHERE p.snapshot_id = {CURRENT_SNAPSHOT} AND p.canonical_id = ?"
        ))
        .bind(canonical_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let project = project_from_row(&row)?;

        let po_rows = sqlx::query(&format!(
            r#"
            SELECT * FROM purchase_orders po
             WHERE po.snapshot_id = {CURRENT_SNAPSHOT} AND po.project_canonical_id = ?
             ORDER BY po.created_date, po.po_number
            "#
        ))
        .bind(canonical_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let purchase_orders = po_rows
            .iter()
            .map(purchase_order_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(ProjectDetail {
            project,
            purchase_orders,
        }))
    }

    pub async fn list_purchase_orders(
        &self,
        filter: &PoFilter,
    ) -> Result<Vec<PoListRow>, StoreError> {
        let mut sql = format!("{PO_LIST_SELECT} WHERE po.snapshot_id = {CURRENT_SNAPSHOT}");
        let mut params: Vec<String> = Vec::new();
        if let Some(orphaned) = filter.orphaned {
            sql.push_str(if orphaned { " AND po.orphaned = 1" } else { " AND po.orphaned = 0" });
        }
        if let Some(vendor) = filter.vendor.as_deref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND po.vendor = ?");
            params.push(vendor.to_string());
        }
        let clause = po_search_clause(filter.search.as_deref());
        sql.push_str(&clause.sql);
        params.extend(clause.params);
        sql.push_str(&format!(
            " ORDER BY {} {}, po.po_number, po.project_canonical_id",
            po_sort_column(filter.sort.as_deref()),
            sort_direction(filter.order.as_deref())
        ));

        let rows = bind_all(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(po_list_row_from_row).collect()
    }

    /// Every aggregate carrying `po_number`; normally one, two when a PO spans projects.
    pub async fn purchase_order(&self, po_number: &str) -> Result<Vec<PoListRow>, StoreError> {
        let rows = sqlx::query(&format!(
            "{PO_LIST_SELECT} WHERE po.snapshot_id = {CURRENT_SNAPSHOT} AND po.po_number = ? \
             ORDER BY po.project_canonical_id"
        ))
        .bind(po_number)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(po_list_row_from_row).collect()
    }

    pub async fn distinct_values(&self, column: DistinctColumn) -> Result<Vec<String>, StoreError> {
        let column = column.sql_column();
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT {column} AS value
              FROM projects p
             WHERE p.snapshot_id = {CURRENT_SNAPSHOT}
               AND {column} IS NOT NULL AND {column} != ''
             ORDER BY value
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("value").map_err(StoreError::from))
            .collect()
    }
}

const PO_LIST_SELECT: &str = r#"
    SELECT po.*,
           p.project_id,
           p.store_sequence,
           p.city,
           p.state,
           p.project_status,
           p.project_type,
           p.general_contractor
      FROM purchase_orders po
      LEFT JOIN projects p
        ON p.snapshot_id = po.snapshot_id AND p.canonical_id = po.project_canonical_id
"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total_projects: i64,
    pub active_projects: i64,
    pub total_budget: f64,
    pub total_actuals: f64,
    pub remaining_to_invoice: f64,
    pub total_pos: i64,
    pub orphaned_pos: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRow {
    pub label: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetByType {
    pub project_type: String,
    pub budget_total: f64,
    pub budget_actuals: f64,
    pub budget_committed: f64,
    pub budget_open: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractorRow {
    pub contractor: String,
    pub project_count: i64,
    pub total_budget: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoStatusRow {
    pub status: String,
    pub count: i64,
    pub total: f64,
}

/// Projects table row. PO figures fall back to the SAP budget when a project has no POs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project: Project,
    pub po_count: i64,
    pub po_ordered: f64,
    pub po_invoiced: f64,
    pub remaining: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDetail {
    pub project: Project,
    pub purchase_orders: Vec<PurchaseOrder>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoListRow {
    pub purchase_order: PurchaseOrder,
    pub project_id: Option<String>,
    pub store_sequence: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub project_status: Option<String>,
    pub project_type: Option<String>,
    pub general_contractor: Option<String>,
}

impl PoListRow {
    /// Uninvoiced balance on a completed project; money that can be released.
    pub fn give_back_amount(&self) -> f64 {
        let complete = self
            .project_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("complete"));
        if complete && self.purchase_order.remaining > 0.0 {
            self.purchase_order.remaining
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectFilter {
    pub project_type: Option<String>,
    pub status: Option<String>,
    pub contractor: Option<String>,
    pub banner: Option<String>,
    pub search: Option<String>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoFilter {
    pub search: Option<String>,
    pub vendor: Option<String>,
    pub orphaned: Option<bool>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistinctColumn {
    ProjectType,
    Status,
    Contractor,
    Banner,
}

impl DistinctColumn {
    fn sql_column(self) -> &'static str {
        match self {
            Self::ProjectType => "p.project_type",
            Self::Status => "p.project_status",
            Self::Contractor => "p.general_contractor",
            Self::Banner => "p.banner",
        }
    }
}

struct SearchClause {
    sql: String,
    params: Vec<String>,
}

const PROJECT_SEARCH_COLUMNS: &[&str] = &[
    "p.project_id",
    "p.store",
    "p.city",
    "p.general_contractor",
    "p.brief_scope_of_work",
    "p.sap_project_definition",
    "p.banner",
    "p.project_status",
];

const PO_SEARCH_COLUMNS: &[&str] = &[
    "po.po_number",
    "po.vendor",
    "po.project_canonical_id",
    "p.store",
    "p.store_sequence",
    "p.city",
    "p.state",
    "p.project_status",
    "p.project_id",
    "p.project_type",
    "p.general_contractor",
];

/// `;` separates terms that must all match; each term may match any searchable column.
fn search_terms(search: Option<&str>) -> Vec<String> {
    search
        .unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| format!("%{t}%"))
        .collect()
}

fn project_search_clause(search: Option<&str>) -> SearchClause {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for like in search_terms(search) {
        let mut parts = PROJECT_SEARCH_COLUMNS
            .iter()
            .map(|col| format!("{col} LIKE ?"))
            .collect::<Vec<_>>();
        params.extend(std::iter::repeat(like.clone()).take(PROJECT_SEARCH_COLUMNS.len()));
        parts.push(
            "p.canonical_id IN (SELECT s.project_canonical_id FROM purchase_orders s \
             WHERE s.snapshot_id = p.snapshot_id AND (s.po_number LIKE ? OR s.vendor LIKE ?))"
                .to_string(),
        );
        params.push(like.clone());
        params.push(like);
        clauses.push(format!("({})", parts.join(" OR ")));
    }
    build_clause(clauses, params)
}

fn po_search_clause(search: Option<&str>) -> SearchClause {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    for like in search_terms(search) {
        let parts = PO_SEARCH_COLUMNS
            .iter()
            .map(|col| format!("{col} LIKE ?"))
            .collect::<Vec<_>>();
        params.extend(std::iter::repeat(like).take(PO_SEARCH_COLUMNS.len()));
        clauses.push(format!("({})", parts.join(" OR ")));
    }
    build_clause(clauses, params)
}

fn build_clause(clauses: Vec<String>, params: Vec<String>) -> SearchClause {
    if clauses.is_empty() {
        return SearchClause {
            sql: String::new(),
            params: Vec::new(),
        };
    }
    SearchClause {
        sql: format!(" AND ({})", clauses.join(" AND ")),
        params,
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    params: &'q [String],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for param in params {
        query = query.bind(param.as_str());
    }
    query
}

fn project_sort_column(sort: Option<&str>) -> &'static str {
    match sort.unwrap_or_default() {
        "project_type" => "p.project_type",
        "store" => "p.store",
        "banner" => "p.banner",
        "location" => "p.city",
        "project_status" => "p.project_status",
        "scope" => "p.brief_scope_of_work",
        "general_contractor" => "p.general_contractor",
        "budget_total" => "p.budget_total",
        "po_ordered" => "po_ordered",
        "po_invoiced" => "po_invoiced",
        "remaining" => "remaining",
        "created_date" => "p.created_date",
        "completion_date" => "p.completion_date",
        "canonical_id" => "p.canonical_id",
        _ => "p.project_id",
    }
}

fn po_sort_column(sort: Option<&str>) -> &'static str {
    match sort.unwrap_or_default() {
        "vendor" => "po.vendor",
        "store_sequence" => "p.store_sequence",
        "city" => "p.city",
        "state" => "p.state",
        "project_status" => "p.project_status",
        "po_status" => "po.po_status",
        "ordered_total" => "po.ordered_total",
        "invoiced_total" => "po.invoiced_total",
        "remaining" => "po.remaining",
        "created_date" => "po.created_date",
        "last_update" => "po.last_update",
        "project" => "po.project_canonical_id",
        _ => "po.po_number",
    }
}

fn sort_direction(order: Option<&str>) -> &'static str {
    if order.is_some_and(|o| o.eq_ignore_ascii_case("desc")) {
        "DESC"
    } else {
        "ASC"
    }
}

fn canonical_id(table: &'static str, raw: &str) -> Result<CanonicalProjectId, StoreError> {
    CanonicalProjectId::from_canonical(raw).map_err(|err| StoreError::Decode {
        table,
        reason: err.to_string(),
    })
}

/// Non-negative integer column; a value that does not fit is a corrupt row, not a wrap.
fn count_column<T: TryFrom<i64>>(
    row: &SqliteRow,
    table: &'static str,
    column: &str,
) -> Result<T, StoreError> {
    let raw: i64 = row.try_get(column)?;
    T::try_from(raw).map_err(|_| StoreError::Decode {
        table,
        reason: format!("{column} = {raw} is out of range"),
    })
}

fn snapshot_header_from_row(row: &SqliteRow) -> Result<SnapshotHeader, StoreError> {
    let snapshot_id: String = row.try_get("snapshot_id")?;
    let created_at: String = row.try_get("created_at")?;
    let decode = |reason: String| StoreError::Decode {
        table: "snapshots",
        reason,
    };
    Ok(SnapshotHeader {
        run_id: Uuid::parse_str(&snapshot_id).map_err(|e| decode(e.to_string()))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| decode(e.to_string()))?
            .with_timezone(&Utc),
        projects_loaded: count_column(row, "snapshots", "projects_loaded")?,
        pos_loaded: count_column(row, "snapshots", "pos_loaded")?,
        orphaned_pos: count_column(row, "snapshots", "orphaned_pos")?,
    })
}

fn project_from_row(row: &SqliteRow) -> Result<Project, StoreError> {
    let raw_id: String = row.try_get("canonical_id")?;
    Ok(Project {
        canonical_id: canonical_id("projects", &raw_id)?,
        project_id: row.try_get("project_id")?,
        sap_project_definition: row.try_get("sap_project_definition")?,
        category: row.try_get("project_type")?,
        status: row.try_get("project_status")?,
        store: row.try_get("store")?,
        sequence: row.try_get("sequence")?,
        store_sequence: row.try_get("store_sequence")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        store_type: row.try_get("store_type")?,
        banner: row.try_get("banner")?,
        general_contractor: row.try_get("general_contractor")?,
        scope: row.try_get("brief_scope_of_work")?,
        created_date: row.try_get("created_date")?,
        completion_date: row.try_get("completion_date")?,
        pmo_comments: row.try_get("pmo_comments")?,
        source_updated_at: row.try_get("source_updated_at")?,
        budget: Budget {
            total: row.try_get("budget_total")?,
            open: row.try_get("budget_open")?,
            committed: row.try_get("budget_committed")?,
            actuals: row.try_get("budget_actuals")?,
        },
    })
}

fn purchase_order_from_row(row: &SqliteRow) -> Result<PurchaseOrder, StoreError> {
    let raw_id: String = row.try_get("project_canonical_id")?;
    let raw_source: String = row.try_get("source")?;
    let source = PoSource::parse(&raw_source).ok_or_else(|| StoreError::Decode {
        table: "purchase_orders",
        reason: format!("unknown source {raw_source:?}"),
    })?;
    Ok(PurchaseOrder {
        po_number: row.try_get("po_number")?,
        project_canonical_id: canonical_id("purchase_orders", &raw_id)?,
        vendor: row.try_get("vendor")?,
        ordered_total: row.try_get("ordered_total")?,
        invoiced_total: row.try_get("invoiced_total")?,
        remaining: row.try_get("remaining")?,
        status: row.try_get("po_status")?,
        created_date: row.try_get("created_date")?,
        last_update: row.try_get("last_update")?,
        commitment_lines: count_column(row, "purchase_orders", "commitment_lines")?,
        invoice_lines: count_column(row, "purchase_orders", "invoice_lines")?,
        orphaned: row.try_get::<i64, _>("orphaned")? != 0,
        source,
    })
}

fn wbs_budget_from_row(row: &SqliteRow) -> Result<WbsNodeBudget, StoreError> {
    Ok(WbsNodeBudget {
        node_key: row.try_get("node_key")?,
        approval_year: row.try_get("approval_year")?,
        node_label: row.try_get("node_label")?,
        description: row.try_get("description")?,
        original_budget: row.try_get("original_budget")?,
        supplemental_budget: row.try_get("supplemental_budget")?,
        returned_budget: row.try_get("returned_budget")?,
        current_budget: row.try_get("current_budget")?,
        actuals: row.try_get("actuals")?,
        open_commitments: row.try_get("open_commitments")?,
        budget_available: row.try_get("budget_available")?,
        distributed_budget: row.try_get("distributed_budget")?,
        budget_cf_from_prev: row.try_get("budget_cf_from_prev")?,
        budget_cf_to_next: row.try_get("budget_cf_to_next")?,
        project_count: count_column(row, "wbs_budgets", "project_count")?,
        found: row.try_get::<i64, _>("found")? != 0,
    })
}

fn po_list_row_from_row(row: &SqliteRow) -> Result<PoListRow, StoreError> {
    Ok(PoListRow {
        purchase_order: purchase_order_from_row(row)?,
        project_id: row.try_get("project_id")?,
        store_sequence: row.try_get("store_sequence")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        project_status: row.try_get("project_status")?,
        project_type: row.try_get("project_type")?,
        general_contractor: row.try_get("general_contractor")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    async fn open_store() -> (TempDir, LocalStore) {
        let dir = tempdir().expect("tempdir");
        let store = LocalStore::open(dir.path().join("dashboard.db"))
            .await
            .expect("open store");
        store.migrate().await.expect("migrate");
        (dir, store)
    }

    fn project(dashed: &str, project_type: &str, status: &str, scope: &str) -> Project {
        Project {
            canonical_id: CanonicalProjectId::from_dashed(dashed).unwrap(),
            project_id: format!("LX-{dashed}"),
            sap_project_definition: dashed.to_string(),
            category: project_type.to_string(),
            status: status.to_string(),
            store: Some("5624".into()),
            sequence: Some("1009".into()),
            store_sequence: Some("5624.1009".into()),
            city: Some("Bentonville".into()),
            state: Some("AR".into()),
            store_type: Some("SUP".into()),
            banner: "Walmart".into(),
            general_contractor: Some("Stokes Plumbing".into()),
            scope: scope.to_string(),
            created_date: Some("2025-01-10".into()),
            completion_date: None,
            pmo_comments: None,
            source_updated_at: None,
            budget: Budget {
                total: 50_000.0,
                open: 20_000.0,
                committed: 17_000.0,
                actuals: 30_000.0,
            },
        }
    }

    fn po(
        number: &str,
        dashed: &str,
        ordered: f64,
        invoiced: f64,
        orphaned: bool,
    ) -> PurchaseOrder {
        PurchaseOrder {
            po_number: number.to_string(),
            project_canonical_id: CanonicalProjectId::from_dashed(dashed).unwrap(),
            vendor: Some("APTIM Environmental".into()),
            ordered_total: ordered,
            invoiced_total: invoiced,
            remaining: ordered - invoiced,
            status: Some("Open".into()),
            created_date: Some("2025-02-01".into()),
            last_update: Some("2025-03-01".into()),
            commitment_lines: 1,
            invoice_lines: 1,
            orphaned,
            source: PoSource::Ledger,
        }
    }

    fn snapshot(projects: Vec<Project>, purchase_orders: Vec<PurchaseOrder>) -> Snapshot {
        let orphaned_pos = purchase_orders.iter().filter(|p| p.orphaned).count();
        Snapshot {
            header: SnapshotHeader {
                run_id: Uuid::new_v4(),
                created_at: Utc::now(),
                projects_loaded: projects.len(),
                pos_loaded: purchase_orders.len(),
                orphaned_pos,
            },
            projects,
            purchase_orders,
            wbs_budgets: Vec::new(),
            freshness: vec![SourceFreshness {
                source_key: "po_ledger".into(),
                source_label: "SAP Purchase Orders".into(),
                source_last_updated: "2025-03-01 00:00:00 UTC".into(),
            }],
        }
    }

    #[tokio::test]
    async fn empty_store_has_no_current_snapshot() {
        let (_dir, store) = open_store().await;
        assert!(store.current_snapshot().await.unwrap().is_none());
        let stats = store.summary_stats(None).await.unwrap();
        assert_eq!(stats, SummaryStats::default());
        assert!(store.list_projects(&ProjectFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_snapshot_publishes_and_prunes_previous() {
        let (_dir, store) = open_store().await;
        let first = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", "")],
            vec![po("40000001", "USFC-000001", 100.0, 40.0, false)],
        );
        store.replace_snapshot(&first).await.unwrap();

        let second = snapshot(
            vec![
                project(
                    "USFC-000002",
                    "PLBG WATER INFRASTRUCTURE",
                    "Active",
                    "Replace water heater",
                ),
                project("USFC-000003", "PLBG WATER INFRASTRUCTURE", "Complete", ""),
            ],
            vec![
                po("40000002", "USFC-000002", 17_000.0, 8_500.0, false),
                po("40000009", "USFC-000099", 500.0, 0.0, true),
            ],
        );
        store.replace_snapshot(&second).await.unwrap();

        let current = store.current_snapshot().await.unwrap().unwrap();
        assert_eq!(current, second.header);

        let projects = store.list_projects(&ProjectFilter::default()).await.unwrap();
        assert_eq!(projects.len(), 2);
        assert!(projects.iter().all(|p| p.project.canonical_id.as_str() != "USFC00000100000"));

        let leftover: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(leftover, 2);

        let stats = store.summary_stats(None).await.unwrap();
        assert_eq!(stats.total_projects, 2);
        assert_eq!(stats.active_projects, 1);
        assert_eq!(stats.total_pos, 2);
        assert_eq!(stats.orphaned_pos, 1);
        assert_eq!(stats.remaining_to_invoice, 9_000.0);
    }

    #[tokio::test]
    async fn failed_write_keeps_prior_snapshot() {
        let (_dir, store) = open_store().await;
        let good = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", "")],
            vec![po("40000001", "USFC-000001", 100.0, 0.0, false)],
        );
        store.replace_snapshot(&good).await.unwrap();

        // Same (po_number, project) twice violates the primary key mid-transaction.
        let bad = snapshot(
            vec![project("USFC-000002", "PLBG GAS INFRASTRUCTURE", "Active", "")],
            vec![
                po("40000002", "USFC-000002", 1.0, 0.0, false),
                po("40000002", "USFC-000002", 2.0, 0.0, false),
            ],
        );
        assert!(store.replace_snapshot(&bad).await.is_err());

        assert_eq!(store.current_snapshot().await.unwrap().unwrap(), good.header);
        let detail = store.project_detail("USFC00000100000").await.unwrap().unwrap();
        assert_eq!(detail.purchase_orders.len(), 1);
        assert!(store.project_detail("USFC00000200000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn project_list_uses_po_totals_and_falls_back_to_budget() {
        let (_dir, store) = open_store().await;
        let snap = snapshot(
            vec![
                project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", ""),
                project("USFC-000002", "PLBG WATER INFRASTRUCTURE", "Active", ""),
            ],
            vec![
                po("40000001", "USFC-000001", 17_000.0, 8_500.0, false),
                po("40000002", "USFC-000001", 3_000.0, 0.0, false),
            ],
        );
        store.replace_snapshot(&snap).await.unwrap();

        let rows = store
            .list_projects(&ProjectFilter {
                sort: Some("canonical_id".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows[0].po_count, 2);
        assert_eq!(rows[0].po_ordered, 20_000.0);
        assert_eq!(rows[0].po_invoiced, 8_500.0);
        assert_eq!(rows[0].remaining, 11_500.0);
        assert_eq!(rows[1].po_count, 0);
        assert_eq!(rows[1].po_ordered, 17_000.0);
        assert_eq!(rows[1].remaining, 20_000.0);
    }

    #[tokio::test]
    async fn search_terms_are_anded_and_match_po_vendor() {
        let (_dir, store) = open_store().await;
        let mut water = project(
            "USFC-000002",
            "PLBG WATER INFRASTRUCTURE",
            "Active",
            "Replace water heater",
        );
        water.city = Some("Rogers".into());
        let snap = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", "Gas line"), water],
            vec![po("40000001", "USFC-000001", 100.0, 0.0, false)],
        );
        store.replace_snapshot(&snap).await.unwrap();

        let by_vendor = store
            .list_projects(&ProjectFilter {
                search: Some("aptim".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_vendor.len(), 1);
        assert_eq!(by_vendor[0].project.canonical_id.as_str(), "USFC00000100000");

        let anded = store
            .list_projects(&ProjectFilter {
                search: Some("water; rogers".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(anded.len(), 1);

        let none = store
            .list_projects(&ProjectFilter {
                search: Some("water;bentonville".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());

        let stats = store.summary_stats(Some("gas line")).await.unwrap();
        assert_eq!(stats.total_projects, 1);
        assert_eq!(stats.total_pos, 1);
    }

    #[tokio::test]
    async fn po_list_joins_project_and_flags_orphans() {
        let (_dir, store) = open_store().await;
        let snap = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Complete", "")],
            vec![
                po("40000001", "USFC-000001", 100.0, 40.0, false),
                po("40000009", "USFC-000099", 500.0, 0.0, true),
            ],
        );
        store.replace_snapshot(&snap).await.unwrap();

        let all = store.list_purchase_orders(&PoFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].give_back_amount(), 60.0);
        assert_eq!(all[1].project_id, None);
        assert_eq!(all[1].give_back_amount(), 0.0);

        let orphans = store
            .list_purchase_orders(&PoFilter {
                orphaned: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].purchase_order.orphaned);

        let found = store.purchase_order("40000001").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].project_status.as_deref(), Some("Complete"));
    }

    #[tokio::test]
    async fn aggregates_and_distinct_values() {
        let (_dir, store) = open_store().await;
        let mut other = project("USFC-000002", "PLBG WATER INFRASTRUCTURE", "Active", "");
        other.banner = "Sam's Club".into();
        other.general_contractor = None;
        let snap = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", ""), other],
            vec![po("40000001", "USFC-000001", 100.0, 40.0, false)],
        );
        store.replace_snapshot(&snap).await.unwrap();

        let by_type = store.projects_by_type(None).await.unwrap();
        assert_eq!(by_type.len(), 2);
        assert!(by_type.iter().all(|r| r.count == 1));

        let budget = store.budget_by_type(None).await.unwrap();
        assert_eq!(budget.len(), 2);
        assert_eq!(budget[0].budget_total, 50_000.0);

        let contractors = store.top_contractors(None, 10).await.unwrap();
        assert!(contractors.iter().any(|c| c.contractor == "Unassigned"));

        let statuses = store.po_status_summary(None).await.unwrap();
        assert_eq!(statuses, vec![PoStatusRow { status: "Open".into(), count: 1, total: 100.0 }]);

        let banners = store.distinct_values(DistinctColumn::Banner).await.unwrap();
        assert_eq!(banners, vec!["Sam's Club".to_string(), "Walmart".to_string()]);
        let contractors = store.distinct_values(DistinctColumn::Contractor).await.unwrap();
        assert_eq!(contractors, vec!["Stokes Plumbing".to_string()]);

        let freshness = store.source_freshness().await.unwrap();
        assert_eq!(freshness.len(), 1);
    }

    #[tokio::test]
    async fn wbs_rows_and_po_source_are_stored_per_snapshot() {
        let (_dir, store) = open_store().await;
        let mut umbrella_po = po("41000001", "USFC-000001", 900.0, 0.0, false);
        umbrella_po.source = PoSource::Umbrella;
        let mut snap = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", "")],
            vec![umbrella_po],
        );
        snap.wbs_budgets = vec![
            WbsNodeBudget {
                node_key: "WMUS.SG.FAC.UP.TANK".into(),
                approval_year: "2025".into(),
                node_label: "Tanks".into(),
                description: "Not found in SAP".into(),
                ..Default::default()
            },
            WbsNodeBudget {
                node_key: "WMUS.SG.FAC.UP.PLB".into(),
                approval_year: "2025".into(),
                node_label: "Plumbing".into(),
                description: "FAC UPGRADES PLUMBING".into(),
                current_budget: 1_750.0,
                actuals: 875.0,
                project_count: 2,
                found: true,
                ..Default::default()
            },
        ];
        store.replace_snapshot(&snap).await.unwrap();

        let nodes = store.wbs_budgets().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], snap.wbs_budgets[1]);
        assert!(!nodes[1].found);

        let detail = store.project_detail("USFC00000100000").await.unwrap().unwrap();
        assert_eq!(detail.purchase_orders[0].source, PoSource::Umbrella);

        store
            .replace_snapshot(&snapshot(vec![], vec![]))
            .await
            .unwrap();
        assert!(store.wbs_budgets().await.unwrap().is_empty());
        let leftover: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM wbs_budgets")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn out_of_range_counts_are_decode_errors() {
        let (_dir, store) = open_store().await;
        let snap = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", "")],
            vec![po("40000001", "USFC-000001", 100.0, 0.0, false)],
        );
        store.replace_snapshot(&snap).await.unwrap();

        sqlx::query("UPDATE purchase_orders SET commitment_lines = -1")
            .execute(store.pool())
            .await
            .unwrap();
        match store.project_detail("USFC00000100000").await {
            Err(StoreError::Decode { table, reason }) => {
                assert_eq!(table, "purchase_orders");
                assert!(reason.contains("commitment_lines = -1"));
            }
            other => panic!("expected decode error, got {other:?}"),
        }

        sqlx::query("UPDATE purchase_orders SET invoice_lines = 4294967296")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE purchase_orders SET commitment_lines = 1")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            store.list_purchase_orders(&PoFilter::default()).await,
            Err(StoreError::Decode { .. })
        ));

        sqlx::query("UPDATE snapshots SET pos_loaded = -3")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            store.current_snapshot().await,
            Err(StoreError::Decode { table: "snapshots", .. })
        ));
    }

    #[tokio::test]
    async fn unknown_po_source_is_a_decode_error() {
        let (_dir, store) = open_store().await;
        let snap = snapshot(
            vec![project("USFC-000001", "PLBG GAS INFRASTRUCTURE", "Active", "")],
            vec![po("40000001", "USFC-000001", 100.0, 0.0, false)],
        );
        store.replace_snapshot(&snap).await.unwrap();
        sqlx::query("UPDATE purchase_orders SET source = 'fax'")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            store.purchase_order("40000001").await,
            Err(StoreError::Decode { table: "purchase_orders", .. })
        ));
    }
}
