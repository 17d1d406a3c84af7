//! Warehouse connector contract plus the HTTP and fixture implementations.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plbg_core::{
    CanonicalProjectId, ConnectorError, SchemaError, SourceFreshness, SourceRow, ValidationError,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "plbg-adapters";

/// Freshness value recorded when a source cannot report its last update.
pub const UNKNOWN_FRESHNESS: &str = "Unknown";

pub const PROJECT_COLUMNS: &[&str] = &[
    "project_id",
    "project_type",
    "store",
    "sequence",
    "store_sequence",
    "city",
    "state",
    "project_status",
    "sap_project_definition",
    "brief_scope_of_work",
    "general_contractor",
    "lx_gc_firm",
    "store_type",
    "created_date",
    "construction_complete_date",
    "pmo_sr_pm_comments",
    "lucernex_updated_at",
    "sap_actuals",
    "sap_open_commitments",
    "total_contract_amount",
    "contractor_po_amount",
];

pub const LEDGER_COLUMNS: &[&str] = &[
    "po_number",
    "project_definition",
    "vendor",
    "ordered_amount",
    "invoiced_amount",
    "po_status",
    "document_date",
    "updated_at",
];

pub const SCOPE_COLUMNS: &[&str] = &["sap_project_definition", "brief_scope_of_work"];

pub const UMBRELLA_COLUMNS: &[&str] = &[
    "po_number",
    "store_nbr",
    "item_text",
    "vendor",
    "ordered_amount",
    "invoiced_amount",
    "po_status",
    "document_date",
    "updated_at",
];

pub const WBS_COLUMNS: &[&str] = &[
    "program_position",
    "approval_year",
    "program_position_desc",
    "project_definition",
    "original_budget",
    "supplemental_budget",
    "returned_budget",
    "current_budget",
    "total_actual",
    "total_commitments",
    "current_budget_available",
    "distributed_budget",
    "budget_cf_from_previous_fiscal_year",
    "budget_cf_to_next_fiscal_year",
];

/// Upper bound on result pages followed for one query.
pub const MAX_RESULT_PAGES: usize = 500;

/// Column-named rows as returned by one warehouse query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Map<String, JsonValue>>,
}

impl RowSet {
    pub fn empty(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn retain_rows(mut self, keep: impl Fn(&Map<String, JsonValue>) -> bool) -> Self {
        self.rows.retain(|row| keep(row));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRows<T> {
    pub rows: Vec<T>,
    pub rejected: Vec<ValidationError>,
}

impl<T> Default for DecodedRows<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// Decode a row set into typed rows.
///
/// A missing required column fails the whole set. A row serde cannot decode is reported
/// with its 1-based position and skipped.
pub fn decode_rows<T: SourceRow>(set: &RowSet) -> Result<DecodedRows<T>, SchemaError> {
    for required in T::REQUIRED_COLUMNS {
        if !set.columns.iter().any(|c| c == required) {
            return Err(SchemaError::MissingColumn {
                table: T::TABLE.to_string(),
                column: required.to_string(),
            });
        }
    }

    let mut decoded = DecodedRows {
        rows: Vec::with_capacity(set.rows.len()),
        rejected: Vec::new(),
    };
    for (index, row) in set.rows.iter().enumerate() {
        match serde_json::from_value::<T>(JsonValue::Object(row.clone())) {
            Ok(value) => decoded.rows.push(value),
            Err(err) => decoded
                .rejected
                .push(ValidationError::new(T::TABLE, index + 1, err.to_string())),
        }
    }
    Ok(decoded)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerScope {
    /// Only ledger lines whose project definition is one of these ids.
    Projects(Vec<CanonicalProjectId>),
    /// The whole ledger; lines for unknown projects surface as orphans.
    All,
}

#[async_trait]
pub trait WarehouseSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_projects(&self, program_types: &[String]) -> Result<RowSet, ConnectorError>;

    async fn fetch_po_ledger(&self, scope: &LedgerScope) -> Result<RowSet, ConnectorError>;

    async fn fetch_scope_attributes(
        &self,
        ids: &[CanonicalProjectId],
    ) -> Result<RowSet, ConnectorError>;

    /// Ledger lines booked to `umbrella` by one of `vendors` (substring, case-insensitive),
    /// with the store number and item text needed to re-attribute them.
    async fn fetch_umbrella_po_lines(
        &self,
        umbrella: &CanonicalProjectId,
        vendors: &[String],
    ) -> Result<RowSet, ConnectorError>;

    /// Every ledger line carrying one of `po_numbers`, whatever project it is booked to.
    async fn fetch_po_lines_by_number(
        &self,
        po_numbers: &[String],
    ) -> Result<RowSet, ConnectorError>;

    /// Capital budget report lines for the given WBS program positions.
    async fn fetch_wbs_budgets(&self, node_keys: &[String]) -> Result<RowSet, ConnectorError>;

    async fn source_freshness(&self) -> Result<Vec<SourceFreshness>, ConnectorError>;
}

/// Warehouse table (or view) names; each must expose the column names the raw rows use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseTables {
    pub projects: String,
    pub po_ledger: String,
    pub scope_attributes: String,
    pub wbs_budgets: String,
}

impl Default for WarehouseTables {
    fn default() -> Self {
        Self {
            projects: "plumbing.projects".to_string(),
            po_ledger: "plumbing.po_ledger".to_string(),
            scope_attributes: "plumbing.scope_attributes".to_string(),
            wbs_budgets: "plumbing.wbs_budget_report".to_string(),
        }
    }
}

pub fn projects_query(tables: &WarehouseTables, program_types: &[String]) -> String {
    let mut sql = format!(
        "SELECT {} FROM {}",
        PROJECT_COLUMNS.join(", "),
        quote_table(&tables.projects)
    );
    if !program_types.is_empty() {
        let types = program_types
            .iter()
            .map(|t| sql_literal(&t.trim().to_uppercase()))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" WHERE UPPER(TRIM(project_type)) IN ({types})"));
    }
    sql
}

pub fn ledger_query(tables: &WarehouseTables, scope: &LedgerScope) -> Option<String> {
    let mut sql = format!(
        "SELECT {} FROM {}",
        LEDGER_COLUMNS.join(", "),
        quote_table(&tables.po_ledger)
    );
    match scope {
        LedgerScope::All => {}
        LedgerScope::Projects(ids) if ids.is_empty() => return None,
        LedgerScope::Projects(ids) => {
            let ids = ids
                .iter()
                .map(|id| sql_literal(id.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" WHERE project_definition IN ({ids})"));
        }
    }
    Some(sql)
}

/// Scope rows are keyed by the registry (dashed) form of the id.
pub fn scope_query(tables: &WarehouseTables, ids: &[CanonicalProjectId]) -> Option<String> {
    if ids.is_empty() {
        return None;
    }
    let ids = ids
        .iter()
        .map(|id| sql_literal(&id.dashed()))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!(
        "SELECT {} FROM {} WHERE sap_project_definition IN ({ids})",
        SCOPE_COLUMNS.join(", "),
        quote_table(&tables.scope_attributes)
    ))
}

pub fn umbrella_query(
    tables: &WarehouseTables,
    umbrella: &CanonicalProjectId,
    vendors: &[String],
) -> Option<String> {
    let vendors = vendors
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| {
            let pattern = format!("%{}%", v.to_uppercase());
            format!("UPPER(vendor) LIKE {}", sql_literal(&pattern))
        })
        .collect::<Vec<_>>();
    if vendors.is_empty() {
        return None;
    }
    Some(format!(
        "SELECT {} FROM {} WHERE project_definition = {} AND ({})",
        UMBRELLA_COLUMNS.join(", "),
        quote_table(&tables.po_ledger),
        sql_literal(umbrella.as_str()),
        vendors.join(" OR ")
    ))
}

pub fn po_numbers_query(tables: &WarehouseTables, po_numbers: &[String]) -> Option<String> {
    if po_numbers.is_empty() {
        return None;
    }
    let numbers = po_numbers
        .iter()
        .map(|n| sql_literal(n.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!(
        "SELECT {} FROM {} WHERE po_number IN ({numbers})",
        LEDGER_COLUMNS.join(", "),
        quote_table(&tables.po_ledger)
    ))
}

pub fn wbs_query(tables: &WarehouseTables, node_keys: &[String]) -> Option<String> {
    if node_keys.is_empty() {
        return None;
    }
    let keys = node_keys
        .iter()
        .map(|k| sql_literal(&k.trim().to_uppercase()))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!(
        "SELECT {} FROM {} \
         WHERE UPPER(program_position) IN ({keys}) AND approval_year IS NOT NULL",
        WBS_COLUMNS.join(", "),
        quote_table(&tables.wbs_budgets)
    ))
}

struct FreshnessQuery {
    key: &'static str,
    label: &'static str,
    sql: String,
}

fn freshness_queries(tables: &WarehouseTables) -> Vec<FreshnessQuery> {
    vec![
        FreshnessQuery {
            key: "po_ledger",
            label: "SAP Purchase Orders",
            sql: format!(
                "SELECT CAST(MAX(updated_at) AS STRING) AS last_updated FROM {}",
                quote_table(&tables.po_ledger)
            ),
        },
        FreshnessQuery {
            key: "projects",
            label: "Project Registry",
            sql: format!(
                "SELECT CAST(MAX(lucernex_updated_at) AS STRING) AS last_updated FROM {}",
                quote_table(&tables.projects)
            ),
        },
    ]
}

fn quote_table(name: &str) -> String {
    format!("`{}`", name.replace('`', ""))
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Cell as text; warehouses send ids and numbers as either JSON type.
fn cell_text(row: &Map<String, JsonValue>, column: &str) -> Option<String> {
    match row.get(column)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct HttpWarehouseConfig {
    /// Full URL of the `queries` endpoint.
    pub endpoint: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
    pub tables: WarehouseTables,
    pub user_agent: Option<String>,
}

/// Talks to a BigQuery-REST-shaped `queries` endpoint.
#[derive(Debug, Clone)]
pub struct HttpWarehouseSource {
    client: reqwest::Client,
    config: HttpWarehouseConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default = "default_job_complete")]
    job_complete: bool,
    schema: Option<QuerySchema>,
    #[serde(default)]
    rows: Vec<QueryRow>,
    job_reference: Option<JobReference>,
    page_token: Option<String>,
    /// Sent as a decimal string.
    total_rows: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

/// One decoded page of a query result.
#[derive(Debug)]
struct QueryPage {
    columns: Vec<String>,
    rows: Vec<Map<String, JsonValue>>,
    job_reference: Option<JobReference>,
    page_token: Option<String>,
    total_rows: Option<usize>,
}

fn default_job_complete() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct QuerySchema {
    fields: Vec<QueryField>,
}

#[derive(Debug, Deserialize)]
struct QueryField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    f: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
struct QueryCell {
    #[serde(default)]
    v: JsonValue,
}

impl QueryResponse {
    /// Follow-up pages may omit the schema; `known_columns` carries the first page's.
    fn into_page(self, known_columns: Option<&[String]>) -> Result<QueryPage, ConnectorError> {
        if !self.job_complete {
            return Err(ConnectorError::Protocol(
                "query job did not complete within the requested timeout".to_string(),
            ));
        }
        let columns: Vec<String> = match (self.schema, known_columns) {
            (Some(schema), _) => schema.fields.into_iter().map(|f| f.name).collect(),
            (None, Some(known)) => known.to_vec(),
            (None, None) => {
                return Err(ConnectorError::Protocol("response has no schema".to_string()))
            }
        };
        if let Some(known) = known_columns {
            if known != columns.as_slice() {
                return Err(ConnectorError::Protocol(
                    "result page schema differs from the first page".to_string(),
                ));
            }
        }
        let total_rows = self
            .total_rows
            .as_deref()
            .map(|raw| {
                raw.trim().parse::<usize>().map_err(|_| {
                    ConnectorError::Protocol(format!("totalRows {raw:?} is not a row count"))
                })
            })
            .transpose()?;

        let mut rows = Vec::with_capacity(self.rows.len());
        for (index, row) in self.rows.into_iter().enumerate() {
            if row.f.len() != columns.len() {
                return Err(ConnectorError::Protocol(format!(
                    "row {} has {} cells, schema has {} fields",
                    index + 1,
                    row.f.len(),
                    columns.len()
                )));
            }
            rows.push(
                columns
                    .iter()
                    .cloned()
                    .zip(row.f.into_iter().map(|cell| cell.v))
                    .collect::<Map<_, _>>(),
            );
        }
        Ok(QueryPage {
            columns,
            rows,
            job_reference: self.job_reference,
            page_token: self.page_token.filter(|t| !t.is_empty()),
            total_rows,
        })
    }
}

/// Stitch the first page and any follow-up pages together, refusing a partial result.
async fn collect_pages<F, Fut>(
    first: QueryPage,
    mut next_page: F,
) -> Result<RowSet, ConnectorError>
where
    F: FnMut(JobReference, String, Vec<String>) -> Fut,
    Fut: std::future::Future<Output = Result<QueryPage, ConnectorError>>,
{
    let expected = first.total_rows;
    let job = first.job_reference;
    let mut token = first.page_token;
    let mut set = RowSet {
        columns: first.columns,
        rows: first.rows,
    };
    let mut pages = 1;
    while let Some(page_token) = token.take() {
        let Some(job) = job.clone() else {
            return Err(ConnectorError::Protocol(
                "paged response carries no jobReference to fetch the next page".to_string(),
            ));
        };
        if pages >= MAX_RESULT_PAGES {
            return Err(ConnectorError::Protocol(format!(
                "result exceeds {MAX_RESULT_PAGES} pages"
            )));
        }
        let page = next_page(job, page_token, set.columns.clone()).await?;
        set.rows.extend(page.rows);
        token = page.page_token;
        pages += 1;
    }
    if let Some(expected) = expected {
        if expected != set.rows.len() {
            return Err(ConnectorError::Protocol(format!(
                "warehouse reported {expected} rows but returned {}",
                set.rows.len()
            )));
        }
    }
    Ok(set)
}

impl HttpWarehouseSource {
    pub fn new(config: HttpWarehouseConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.request_timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn tables(&self) -> &WarehouseTables {
        &self.config.tables
    }

    async fn run_query(&self, call: &str, sql: &str) -> Result<RowSet, ConnectorError> {
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: self.timeout_ms(),
        };
        debug!(call, endpoint = %self.config.endpoint, "warehouse query");

        let builder = self.client.post(&self.config.endpoint).json(&request);
        let first = self.send(call, builder).await?.into_page(None)?;
        collect_pages(first, |job, page_token, columns| async move {
            debug!(call, job_id = %job.job_id, "fetching next result page");
            let mut builder = self
                .client
                .get(format!("{}/{}", self.config.endpoint.trim_end_matches('/'), job.job_id))
                .query(&[("pageToken", page_token.as_str())])
                .query(&[("timeoutMs", self.timeout_ms().to_string().as_str())]);
            if let Some(location) = &job.location {
                builder = builder.query(&[("location", location.as_str())]);
            }
            self.send(call, builder).await?.into_page(Some(&columns))
        })
        .await
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.config.request_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    async fn send(
        &self,
        call: &str,
        mut builder: reqwest::RequestBuilder,
    ) -> Result<QueryResponse, ConnectorError> {
        let seconds = self.config.request_timeout.as_secs();
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder
            .send()
            .await
            .map_err(|err| transport_error(call, seconds, err))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ConnectorError::Auth {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ConnectorError::Status {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        resp.json().await.map_err(|err| {
            if err.is_timeout() {
                ConnectorError::Timeout {
                    call: call.to_string(),
                    seconds,
                }
            } else {
                ConnectorError::Protocol(format!("decoding {call} response: {err}"))
            }
        })
    }
}

fn transport_error(call: &str, seconds: u64, err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::Timeout {
            call: call.to_string(),
            seconds,
        }
    } else {
        ConnectorError::Network(err.to_string())
    }
}

#[async_trait]
impl WarehouseSource for HttpWarehouseSource {
    fn source_id(&self) -> &'static str {
        "http"
    }

    async fn fetch_projects(&self, program_types: &[String]) -> Result<RowSet, ConnectorError> {
        let sql = projects_query(&self.config.tables, program_types);
        self.run_query("fetch_projects", &sql).await
    }

    async fn fetch_po_ledger(&self, scope: &LedgerScope) -> Result<RowSet, ConnectorError> {
        match ledger_query(&self.config.tables, scope) {
            Some(sql) => self.run_query("fetch_po_ledger", &sql).await,
            None => Ok(RowSet::empty(LEDGER_COLUMNS)),
        }
    }

    async fn fetch_scope_attributes(
        &self,
        ids: &[CanonicalProjectId],
    ) -> Result<RowSet, ConnectorError> {
        match scope_query(&self.config.tables, ids) {
            Some(sql) => self.run_query("fetch_scope_attributes", &sql).await,
            None => Ok(RowSet::empty(SCOPE_COLUMNS)),
        }
    }

    async fn fetch_umbrella_po_lines(
        &self,
        umbrella: &CanonicalProjectId,
        vendors: &[String],
    ) -> Result<RowSet, ConnectorError> {
        match umbrella_query(&self.config.tables, umbrella, vendors) {
            Some(sql) => self.run_query("fetch_umbrella_po_lines", &sql).await,
            None => Ok(RowSet::empty(UMBRELLA_COLUMNS)),
        }
    }

    async fn fetch_po_lines_by_number(
        &self,
        po_numbers: &[String],
    ) -> Result<RowSet, ConnectorError> {
        match po_numbers_query(&self.config.tables, po_numbers) {
            Some(sql) => self.run_query("fetch_po_lines_by_number", &sql).await,
            None => Ok(RowSet::empty(LEDGER_COLUMNS)),
        }
    }

    async fn fetch_wbs_budgets(&self, node_keys: &[String]) -> Result<RowSet, ConnectorError> {
        match wbs_query(&self.config.tables, node_keys) {
            Some(sql) => self.run_query("fetch_wbs_budgets", &sql).await,
            None => Ok(RowSet::empty(WBS_COLUMNS)),
        }
    }

    /// Freshness is informational; a source that cannot answer is recorded as unknown.
    async fn source_freshness(&self) -> Result<Vec<SourceFreshness>, ConnectorError> {
        let mut out = Vec::new();
        for query in freshness_queries(&self.config.tables) {
            let last_updated = match self.run_query("source_freshness", &query.sql).await {
                Ok(set) => set
                    .rows
                    .first()
                    .and_then(|row| cell_text(row, "last_updated"))
                    .unwrap_or_else(|| UNKNOWN_FRESHNESS.to_string()),
                Err(err) => {
                    warn!(source_key = query.key, error = %err, "freshness query failed");
                    UNKNOWN_FRESHNESS.to_string()
                }
            };
            out.push(SourceFreshness {
                source_key: query.key.to_string(),
                source_label: query.label.to_string(),
                source_last_updated: last_updated,
            });
        }
        Ok(out)
    }
}

/// Captured warehouse contents for offline runs and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseBundle {
    pub fixture_id: String,
    pub captured_at: DateTime<Utc>,
    pub projects: RowSet,
    pub po_ledger: RowSet,
    pub scope_attributes: RowSet,
    #[serde(default)]
    pub umbrella_po_lines: Option<RowSet>,
    #[serde(default)]
    pub wbs_budgets: Option<RowSet>,
    #[serde(default)]
    pub freshness: Vec<SourceFreshness>,
    pub notes: Option<String>,
}

pub fn load_warehouse_bundle(path: impl AsRef<Path>) -> Result<WarehouseBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a [`WarehouseBundle`], applying the same filters the warehouse queries would.
#[derive(Debug, Clone)]
pub struct FixtureWarehouseSource {
    bundle: WarehouseBundle,
}

impl FixtureWarehouseSource {
    pub fn new(bundle: WarehouseBundle) -> Self {
        Self { bundle }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_warehouse_bundle(path)?))
    }

    pub fn bundle(&self) -> &WarehouseBundle {
        &self.bundle
    }
}

#[async_trait]
impl WarehouseSource for FixtureWarehouseSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_projects(&self, program_types: &[String]) -> Result<RowSet, ConnectorError> {
        let wanted: HashSet<String> = program_types
            .iter()
            .map(|t| t.trim().to_uppercase())
            .collect();
        Ok(self.bundle.projects.clone().retain_rows(|row| {
            wanted.is_empty()
                || cell_text(row, "project_type")
                    .is_some_and(|t| wanted.contains(&t.trim().to_uppercase()))
        }))
    }

    async fn fetch_po_ledger(&self, scope: &LedgerScope) -> Result<RowSet, ConnectorError> {
        let ids: HashSet<&str> = match scope {
            LedgerScope::All => return Ok(self.bundle.po_ledger.clone()),
            LedgerScope::Projects(ids) => ids.iter().map(|id| id.as_str()).collect(),
        };
        Ok(self.bundle.po_ledger.clone().retain_rows(|row| {
            cell_text(row, "project_definition")
                .is_some_and(|def| ids.contains(def.trim().to_uppercase().as_str()))
        }))
    }

    async fn fetch_scope_attributes(
        &self,
        ids: &[CanonicalProjectId],
    ) -> Result<RowSet, ConnectorError> {
        let dashed: HashSet<String> = ids.iter().map(|id| id.dashed()).collect();
        Ok(self.bundle.scope_attributes.clone().retain_rows(|row| {
            cell_text(row, "sap_project_definition")
                .is_some_and(|def| dashed.contains(&def.trim().to_uppercase()))
        }))
    }

    async fn fetch_umbrella_po_lines(
        &self,
        _umbrella: &CanonicalProjectId,
        vendors: &[String],
    ) -> Result<RowSet, ConnectorError> {
        let Some(lines) = &self.bundle.umbrella_po_lines else {
            return Ok(RowSet::empty(UMBRELLA_COLUMNS));
        };
        let wanted: Vec<String> = vendors
            .iter()
            .map(|v| v.trim().to_uppercase())
            .filter(|v| !v.is_empty())
            .collect();
        Ok(lines.clone().retain_rows(|row| {
            cell_text(row, "vendor").is_some_and(|vendor| {
                let vendor = vendor.to_uppercase();
                wanted.iter().any(|w| vendor.contains(w.as_str()))
            })
        }))
    }

    async fn fetch_po_lines_by_number(
        &self,
        po_numbers: &[String],
    ) -> Result<RowSet, ConnectorError> {
        let wanted: HashSet<&str> = po_numbers.iter().map(|n| n.trim()).collect();
        Ok(self.bundle.po_ledger.clone().retain_rows(|row| {
            cell_text(row, "po_number").is_some_and(|n| wanted.contains(n.trim()))
        }))
    }

    async fn fetch_wbs_budgets(&self, node_keys: &[String]) -> Result<RowSet, ConnectorError> {
        let Some(report) = &self.bundle.wbs_budgets else {
            return Ok(RowSet::empty(WBS_COLUMNS));
        };
        let wanted: HashSet<String> =
            node_keys.iter().map(|k| k.trim().to_uppercase()).collect();
        Ok(report.clone().retain_rows(|row| {
            cell_text(row, "program_position")
                .is_some_and(|key| wanted.contains(&key.trim().to_uppercase()))
                && row.get("approval_year").is_some_and(|year| !year.is_null())
        }))
    }

    async fn source_freshness(&self) -> Result<Vec<SourceFreshness>, ConnectorError> {
        Ok(self.bundle.freshness.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plbg_core::{RawLedgerRow, RawScopeRow};
    use serde_json::json;

    fn row_set(value: JsonValue) -> RowSet {
        serde_json::from_value(value).unwrap()
    }

    fn id(dashed: &str) -> CanonicalProjectId {
        CanonicalProjectId::from_dashed(dashed).unwrap()
    }

    fn bundle() -> WarehouseBundle {
        serde_json::from_value(json!({
            "fixture_id": "unit",
            "captured_at": "2025-03-01T00:00:00Z",
            "projects": {
                "columns": ["project_id", "project_type", "sap_project_definition"],
                "rows": [
                    {"project_id": "1", "project_type": " plbg gas infrastructure ",
                     "sap_project_definition": "USFC-000001"},
                    {"project_id": "2", "project_type": "ROOF REPLACEMENT",
                     "sap_project_definition": "USFC-000002"}
                ]
            },
            "po_ledger": {
                "columns": ["po_number", "project_definition", "ordered_amount", "invoiced_amount"],
                "rows": [
                    {"po_number": "1", "project_definition": "USFC00000100000",
                     "ordered_amount": 10, "invoiced_amount": 0},
                    {"po_number": "2", "project_definition": "USFC00009900000",
                     "ordered_amount": 5, "invoiced_amount": 0}
                ]
            },
            "scope_attributes": {
                "columns": ["sap_project_definition", "brief_scope_of_work"],
                "rows": [
                    {"sap_project_definition": "USFC-000001", "brief_scope_of_work": "Gas line"},
                    {"sap_project_definition": "USFC-000002", "brief_scope_of_work": "Roof"}
                ]
            },
            "freshness": [],
            "notes": null
        }))
        .unwrap()
    }

    #[test]
    fn missing_required_column_is_a_schema_error() {
        let set = row_set(json!({
            "columns": ["po_number", "project_definition", "ordered_amount"],
            "rows": []
        }));
        let err = decode_rows::<RawLedgerRow>(&set).unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingColumn {
                table: "po_ledger".into(),
                column: "invoiced_amount".into()
            }
        );
    }

    #[test]
    fn undecodable_rows_are_reported_and_skipped() {
        let set = row_set(json!({
            "columns": ["po_number", "project_definition", "ordered_amount", "invoiced_amount"],
            "rows": [
                {"po_number": "1", "project_definition": "USFC00000100000",
                 "ordered_amount": "17000", "invoiced_amount": null},
                {"po_number": "2", "project_definition": "USFC00000100000",
                 "ordered_amount": "n/a", "invoiced_amount": 0}
            ]
        }));
        let decoded = decode_rows::<RawLedgerRow>(&set).unwrap();
        assert_eq!(decoded.rows.len(), 1);
        assert_eq!(decoded.rows[0].ordered_amount, 17000.0);
        assert_eq!(decoded.rejected.len(), 1);
        assert_eq!(decoded.rejected[0].row, 2);
        assert_eq!(decoded.rejected[0].table, "po_ledger");
    }

    #[test]
    fn query_response_maps_schema_fields_onto_cells() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "sap_project_definition", "type": "STRING"},
                {"name": "brief_scope_of_work", "type": "STRING"}
            ]},
            "rows": [{"f": [{"v": "USFC-000001"}, {"v": null}]}]
        }))
        .unwrap();
        let page = response.into_page(None).unwrap();
        assert!(page.page_token.is_none());
        let set = RowSet {
            columns: page.columns,
            rows: page.rows,
        };
        assert_eq!(set.columns, vec!["sap_project_definition", "brief_scope_of_work"]);
        let decoded = decode_rows::<RawScopeRow>(&set).unwrap();
        assert_eq!(decoded.rows[0].sap_project_definition.as_deref(), Some("USFC-000001"));
        assert_eq!(decoded.rows[0].brief_scope_of_work, None);
    }

    #[test]
    fn incomplete_job_and_ragged_rows_are_protocol_errors() {
        let pending: QueryResponse = serde_json::from_value(json!({"jobComplete": false})).unwrap();
        assert!(matches!(pending.into_page(None), Err(ConnectorError::Protocol(_))));

        let ragged: QueryResponse = serde_json::from_value(json!({
            "schema": {"fields": [{"name": "a"}, {"name": "b"}]},
            "rows": [{"f": [{"v": "1"}]}]
        }))
        .unwrap();
        assert!(matches!(ragged.into_page(None), Err(ConnectorError::Protocol(_))));
    }

    #[test]
    fn query_builders_quote_values_and_skip_empty_scopes() {
        let tables = WarehouseTables::default();
        let sql = projects_query(&tables, &["PLBG GAS INFRASTRUCTURE".into(), "O'Brien".into()]);
        assert!(sql.contains("FROM `plumbing.projects`"));
        assert!(sql.contains("IN ('PLBG GAS INFRASTRUCTURE', 'O\\'BRIEN')"));

        let water = LedgerScope::Projects(vec![id("USFC-009320")]);
        let ledger = ledger_query(&tables, &water).unwrap();
        assert!(ledger.ends_with("WHERE project_definition IN ('USFC00932000000')"));
        assert!(ledger_query(&tables, &LedgerScope::Projects(vec![])).is_none());
        assert!(!ledger_query(&tables, &LedgerScope::All).unwrap().contains("WHERE"));

        let scope = scope_query(&tables, &[id("USFC-009320")]).unwrap();
        assert!(scope.contains("IN ('USFC-009320')"));
        assert!(scope_query(&tables, &[]).is_none());
    }

    #[tokio::test]
    async fn fixture_source_applies_filters_locally() {
        let source = FixtureWarehouseSource::new(bundle());

        let projects = source
            .fetch_projects(&["PLBG GAS INFRASTRUCTURE".to_string()])
            .await
            .unwrap();
        assert_eq!(projects.len(), 1);

        let scoped = source
            .fetch_po_ledger(&LedgerScope::Projects(vec![id("USFC-000001")]))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        let all = source.fetch_po_ledger(&LedgerScope::All).await.unwrap();
        assert_eq!(all.len(), 2);

        let scope = source.fetch_scope_attributes(&[id("USFC-000001")]).await.unwrap();
        assert_eq!(scope.len(), 1);
        assert_eq!(scope.columns, vec!["sap_project_definition", "brief_scope_of_work"]);
    }

    #[test]
    fn reconcile_side_queries_quote_values() {
        let tables = WarehouseTables::default();
        let umbrella = umbrella_query(
            &tables,
            &id("USMS-001700"),
            &["APTIM Environmental".into(), " ".into()],
        )
        .unwrap();
        assert!(umbrella.contains("project_definition = 'USMS00170000000'"));
        assert!(umbrella.contains("UPPER(vendor) LIKE '%APTIM ENVIRONMENTAL%'"));
        assert!(!umbrella.contains(" OR "));
        assert!(umbrella_query(&tables, &id("USMS-001700"), &[]).is_none());

        let by_number = po_numbers_query(&tables, &["40900123".into()]).unwrap();
        assert!(by_number.ends_with("WHERE po_number IN ('40900123')"));
        assert!(po_numbers_query(&tables, &[]).is_none());

        let wbs = wbs_query(&tables, &["wmus.sg.fac.up.plb".into()]).unwrap();
        assert!(wbs.contains("FROM `plumbing.wbs_budget_report`"));
        assert!(wbs.contains("IN ('WMUS.SG.FAC.UP.PLB')"));
    }

    fn page(value: JsonValue) -> QueryPage {
        serde_json::from_value::<QueryResponse>(value)
            .unwrap()
            .into_page(None)
            .unwrap()
    }

    #[tokio::test]
    async fn truncated_first_page_without_job_reference_is_refused() {
        let first = page(json!({
            "jobComplete": true,
            "totalRows": "50000",
            "pageToken": "abc",
            "schema": {"fields": [{"name": "po_number"}]},
            "rows": [{"f": [{"v": "40900001"}]}]
        }));
        let result = collect_pages(first, |_, _, _| async {
            Err::<QueryPage, _>(ConnectorError::Protocol("no further pages".into()))
        })
        .await;
        match result {
            Err(ConnectorError::Protocol(message)) => assert!(message.contains("jobReference")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn row_count_short_of_total_rows_is_refused() {
        let first = page(json!({
            "totalRows": "3",
            "schema": {"fields": [{"name": "po_number"}]},
            "rows": [{"f": [{"v": "40900001"}]}]
        }));
        let result = collect_pages(first, |_, _, _| async {
            Err::<QueryPage, _>(ConnectorError::Protocol("unused".into()))
        })
        .await;
        match result {
            Err(ConnectorError::Protocol(message)) => {
                assert!(message.contains("reported 3 rows but returned 1"))
            }
            other => panic!("expected protocol error, got {other:?}"),
        }

        let bad_total: QueryResponse = serde_json::from_value(json!({
            "totalRows": "lots",
            "schema": {"fields": [{"name": "po_number"}]},
            "rows": []
        }))
        .unwrap();
        assert!(matches!(bad_total.into_page(None), Err(ConnectorError::Protocol(_))));
    }

    mod http {
        use super::*;
        use axum::extract::{Path as UrlPath, Query};
        use axum::http::StatusCode as AxumStatus;
        use axum::routing::{get, post};
        use axum::{Json, Router};
        use std::collections::HashMap;
        use std::net::SocketAddr;

        async fn spawn(router: Router) -> SocketAddr {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, router).await.unwrap();
            });
            addr
        }

        fn source(endpoint: String, timeout: Duration) -> HttpWarehouseSource {
            HttpWarehouseSource::new(HttpWarehouseConfig {
                endpoint,
                token: Some("secret".into()),
                request_timeout: timeout,
                tables: WarehouseTables::default(),
                user_agent: None,
            })
            .unwrap()
        }

        #[tokio::test]
        async fn follows_page_tokens_until_exhausted() {
            let router = Router::new()
                .route(
                    "/queries",
                    post(|| async {
                        Json(json!({
                            "jobComplete": true,
                            "jobReference": {"jobId": "job_1", "location": "US"},
                            "totalRows": "3",
                            "pageToken": "p2",
                            "schema": {"fields": [
                                {"name": "sap_project_definition"},
                                {"name": "brief_scope_of_work"}
                            ]},
                            "rows": [{"f": [{"v": "USFC-000001"}, {"v": "Gas line"}]}]
                        }))
                    }),
                )
                .route(
                    "/queries/{job_id}",
                    get(
                        |UrlPath(job_id): UrlPath<String>,
                         Query(params): Query<HashMap<String, String>>| async move {
                            assert_eq!(job_id, "job_1");
                            assert_eq!(params.get("location").map(String::as_str), Some("US"));
                            let body = match params.get("pageToken").map(String::as_str) {
                                Some("p2") => json!({
                                    "jobComplete": true,
                                    "pageToken": "p3",
                                    "rows": [{"f": [{"v": "USFC-000002"}, {"v": null}]}]
                                }),
                                _ => json!({
                                    "jobComplete": true,
                                    "rows": [{"f": [{"v": "USFC-000003"}, {"v": "Tank"}]}]
                                }),
                            };
                            Json(body)
                        },
                    ),
                );
            let addr = spawn(router).await;
            let http = source(format!("http://{addr}/queries"), Duration::from_secs(5));

            let ids = [id("USFC-000001"), id("USFC-000002"), id("USFC-000003")];
            let set = http.fetch_scope_attributes(&ids).await.unwrap();
            assert_eq!(set.len(), 3);
            let decoded = decode_rows::<RawScopeRow>(&set).unwrap();
            assert_eq!(decoded.rows[2].brief_scope_of_work.as_deref(), Some("Tank"));
        }

        #[tokio::test]
        async fn unauthorized_maps_to_auth() {
            let router = Router::new().route(
                "/queries",
                post(|| async { (AxumStatus::UNAUTHORIZED, "bad token") }),
            );
            let addr = spawn(router).await;
            let http = source(format!("http://{addr}/queries"), Duration::from_secs(5));
            let err = http.fetch_projects(&[]).await.unwrap_err();
            assert_eq!(err, ConnectorError::Auth { status: 401 });
        }

        #[tokio::test]
        async fn server_error_maps_to_status_with_body() {
            let router = Router::new().route(
                "/queries",
                post(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "backend exploded") }),
            );
            let addr = spawn(router).await;
            let http = source(format!("http://{addr}/queries"), Duration::from_secs(5));
            match http.fetch_projects(&[]).await {
                Err(ConnectorError::Status { status, message }) => {
                    assert_eq!(status, 500);
                    assert_eq!(message, "backend exploded");
                }
                other => panic!("expected status error, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn stalled_response_maps_to_timeout() {
            let router = Router::new().route(
                "/queries",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Json(json!({"rows": []}))
                }),
            );
            let addr = spawn(router).await;
            let http = source(format!("http://{addr}/queries"), Duration::from_millis(200));
            match http.fetch_projects(&[]).await {
                Err(ConnectorError::Timeout { call, .. }) => assert_eq!(call, "fetch_projects"),
                other => panic!("expected timeout, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn refused_connection_maps_to_network() {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            drop(listener);
            let http = source(format!("http://{addr}/queries"), Duration::from_secs(5));
            assert!(matches!(
                http.fetch_projects(&[]).await,
                Err(ConnectorError::Network(_))
            ));
        }
    }
}
