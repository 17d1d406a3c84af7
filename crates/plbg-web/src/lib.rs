//! Axum + Askama dashboard over the local snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use plbg_core::{CanonicalProjectId, PoSource, WbsNodeBudget};
use plbg_storage::{
    CountRow, DistinctColumn, LocalStore, PoFilter, PoListRow, ProjectFilter, ProjectSummary,
};
use plbg_sync::{LedgerScopeMode, SyncConfig, SyncPipeline};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "plbg-web";

const TOP_CONTRACTORS: i64 = 10;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            workspace_root: workspace_root.into(),
        }
    }

    fn store(&self) -> &LocalStore {
        self.pipeline.store()
    }

    /// Orphans only exist when the whole ledger is pulled.
    fn orphans_tracked(&self) -> bool {
        self.pipeline.ledger_scope() == LedgerScopeMode::All
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    search: Option<String>,
}

impl SearchQuery {
    fn term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone)]
struct KpiView {
    total_projects: String,
    active_projects: String,
    total_budget: String,
    total_actuals: String,
    remaining_to_invoice: String,
    total_pos: String,
    orphaned_pos: String,
    orphans_tracked: bool,
}

#[derive(Debug, Clone)]
struct ContractorView {
    name: String,
    project_count: i64,
    total_budget: String,
}

#[derive(Debug, Clone)]
struct PoStatusView {
    status: String,
    count: i64,
    total: String,
}

#[derive(Debug, Clone)]
struct WbsRowView {
    node_key: String,
    node_label: String,
    approval_year: String,
    description: String,
    project_count: u32,
    current_budget: String,
    actuals: String,
    open_commitments: String,
    budget_available: String,
    found: bool,
}

#[derive(Debug, Clone)]
struct FreshnessView {
    label: String,
    updated: String,
}

#[derive(Debug, Clone)]
struct OptionView {
    value: String,
    selected: bool,
}

#[derive(Debug, Clone)]
struct ProjectRowView {
    canonical_id: String,
    project_id: String,
    sap_project_definition: String,
    category: String,
    status: String,
    store_sequence: String,
    location: String,
    banner: String,
    contractor: String,
    scope: String,
    budget_total: String,
    po_count: i64,
    po_ordered: String,
    po_invoiced: String,
    remaining: String,
}

#[derive(Debug, Clone)]
struct PoRowView {
    po_number: String,
    project_canonical_id: String,
    project_label: String,
    has_project: bool,
    vendor: String,
    location: String,
    ordered: String,
    invoiced: String,
    remaining: String,
    give_back: String,
    status: String,
    created_date: String,
    last_update: String,
    commitment_lines: u32,
    invoice_lines: u32,
    orphaned: bool,
    over_invoiced: bool,
    source: &'static str,
    source_label: Option<&'static str>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    search: String,
    snapshot_label: String,
    freshness: Vec<FreshnessView>,
    kpis: KpiView,
    contractors: Vec<ContractorView>,
    statuses: Vec<PoStatusView>,
    wbs: Vec<WbsRowView>,
}

#[derive(Template)]
#[template(path = "dashboard_content_partial.html")]
struct DashboardContentTemplate {
    search: String,
    kpis: KpiView,
    contractors: Vec<ContractorView>,
    statuses: Vec<PoStatusView>,
}

#[derive(Template)]
#[template(path = "projects.html")]
struct ProjectsPageTemplate {
    search: String,
    sort: String,
    order: String,
    type_options: Vec<OptionView>,
    status_options: Vec<OptionView>,
    contractor_options: Vec<OptionView>,
    banner_options: Vec<OptionView>,
}

#[derive(Template)]
#[template(path = "projects_table_partial.html")]
struct ProjectsTablePartialTemplate {
    projects: Vec<ProjectRowView>,
}

#[derive(Template)]
#[template(path = "project_detail.html")]
struct ProjectDetailTemplate {
    project: ProjectRowView,
    store_type: String,
    created_date: String,
    completion_date: String,
    pmo_comments: String,
    source_updated_at: String,
    budget_open: String,
    budget_committed: String,
    budget_actuals: String,
    purchase_orders: Vec<PoRowView>,
}

#[derive(Template)]
#[template(path = "pos.html")]
struct PosPageTemplate {
    search: String,
    orphaned_filter: String,
    purchase_orders: Vec<PoRowView>,
}

#[derive(Template)]
#[template(path = "po_detail_partial.html")]
struct PoDetailPartialTemplate {
    po_number: String,
    lines: Vec<PoRowView>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/dashboard/content", get(dashboard_content_handler))
        .route("/charts/by-type", get(chart_by_type_handler))
        .route("/charts/by-status", get(chart_by_status_handler))
        .route("/charts/budget-by-type", get(chart_budget_by_type_handler))
        .route("/projects", get(projects_page_handler))
        .route("/projects/table", get(projects_table_handler))
        .route("/projects/{canonical_id}", get(project_detail_handler))
        .route("/pos", get(pos_page_handler))
        .route("/pos/{po_number}", get(po_detail_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port: u16 = std::env::var("PLBG_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8501);
    let pipeline = Arc::new(SyncPipeline::from_config(&config).await?);
    let scheduler = pipeline.maybe_build_scheduler(&config).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(
            cron_1 = %config.sync_cron_1,
            cron_2 = %config.sync_cron_2,
            "sync scheduler started"
        );
    }

    let state = AppState::new(pipeline, ".");
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

struct DashboardBlock {
    kpis: KpiView,
    contractors: Vec<ContractorView>,
    statuses: Vec<PoStatusView>,
}

async fn load_dashboard_block(
    state: &AppState,
    search: Option<&str>,
) -> anyhow::Result<DashboardBlock> {
    let store = state.store();
    let stats = store.summary_stats(search).await?;
    let contractors = store.top_contractors(search, TOP_CONTRACTORS).await?;
    let statuses = store.po_status_summary(search).await?;
    Ok(DashboardBlock {
        kpis: KpiView {
            total_projects: stats.total_projects.to_string(),
            active_projects: stats.active_projects.to_string(),
            total_budget: money(stats.total_budget),
            total_actuals: money(stats.total_actuals),
            remaining_to_invoice: money(stats.remaining_to_invoice),
            total_pos: stats.total_pos.to_string(),
            orphaned_pos: stats.orphaned_pos.to_string(),
            orphans_tracked: state.orphans_tracked(),
        },
        contractors: contractors
            .into_iter()
            .map(|c| ContractorView {
                name: c.contractor,
                project_count: c.project_count,
                total_budget: money(c.total_budget),
            })
            .collect(),
        statuses: statuses
            .into_iter()
            .map(|s| PoStatusView {
                status: s.status,
                count: s.count,
                total: money(s.total),
            })
            .collect(),
    })
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let store = state.store();
    let loaded = async {
        let block = load_dashboard_block(&state, query.term()).await?;
        let snapshot = store.current_snapshot().await?;
        let freshness = store.source_freshness().await?;
        let wbs = store.wbs_budgets().await?;
        anyhow::Ok((block, snapshot, freshness, wbs))
    }
    .await;
    match loaded {
        Ok((block, snapshot, freshness, wbs)) => render_html(IndexTemplate {
            search: query.search.clone().unwrap_or_default(),
            snapshot_label: snapshot
                .map(|s| format!("Last refreshed {}", s.created_at.format("%Y-%m-%d %H:%M UTC")))
                .unwrap_or_else(|| "No data yet. Run a refresh.".to_string()),
            freshness: freshness
                .into_iter()
                .map(|f| FreshnessView {
                    label: f.source_label,
                    updated: f.source_last_updated,
                })
                .collect(),
            kpis: block.kpis,
            contractors: block.contractors,
            statuses: block.statuses,
            wbs: wbs.into_iter().map(wbs_row_view).collect(),
        }),
        Err(err) => server_error(err),
    }
}

async fn dashboard_content_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match load_dashboard_block(&state, query.term()).await {
        Ok(block) => render_html(DashboardContentTemplate {
            search: query.search.clone().unwrap_or_default(),
            kpis: block.kpis,
            contractors: block.contractors,
            statuses: block.statuses,
        }),
        Err(err) => server_error(err),
    }
}

fn count_chart(title: &str, rows: Vec<CountRow>, color: &str) -> serde_json::Value {
    let x = rows.iter().map(|r| r.label.clone()).collect::<Vec<_>>();
    let y = rows.iter().map(|r| r.count).collect::<Vec<_>>();
    serde_json::json!({
        "data": [{
            "type": "bar",
            "x": x,
            "y": y,
            "marker": {"color": color}
        }],
        "layout": {
            "title": title,
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    })
}

async fn chart_by_type_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state.store().projects_by_type(query.term()).await {
        Ok(rows) => Json(count_chart("Projects by Type", rows, "#0071ce")).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn chart_by_status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state.store().projects_by_status(query.term()).await {
        Ok(rows) => Json(count_chart("Projects by Status", rows, "#ffc220")).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn chart_budget_by_type_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    match state.store().budget_by_type(query.term()).await {
        Ok(rows) => {
            let x = rows.iter().map(|r| r.project_type.clone()).collect::<Vec<_>>();
            let series = |name: &str, color: &str, values: Vec<f64>| {
                serde_json::json!({
                    "type": "bar",
                    "name": name,
                    "x": x,
                    "y": values,
                    "marker": {"color": color}
                })
            };
            let actuals = rows.iter().map(|r| r.budget_actuals).collect();
            let open = rows.iter().map(|r| r.budget_open).collect();
            let total = rows.iter().map(|r| r.budget_total).collect();
            Json(serde_json::json!({
                "data": [
                    series("Actuals", "#0071ce", actuals),
                    series("Open commitments", "#ffc220", open),
                    series("Total budget", "#76c043", total),
                ],
                "layout": {
                    "title": "Budget by Program Type",
                    "barmode": "group",
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc"
                }
            }))
            .into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

fn options(values: Vec<String>, selected: Option<&str>) -> Vec<OptionView> {
    values
        .into_iter()
        .map(|value| OptionView {
            selected: selected == Some(value.as_str()),
            value,
        })
        .collect()
}

async fn projects_page_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ProjectFilter>,
) -> Response {
    let store = state.store();
    let loaded = async {
        anyhow::Ok((
            store.distinct_values(DistinctColumn::ProjectType).await?,
            store.distinct_values(DistinctColumn::Status).await?,
            store.distinct_values(DistinctColumn::Contractor).await?,
            store.distinct_values(DistinctColumn::Banner).await?,
        ))
    }
    .await;
    match loaded {
        Ok((types, statuses, contractors, banners)) => render_html(ProjectsPageTemplate {
            search: filter.search.clone().unwrap_or_default(),
            sort: filter.sort.clone().unwrap_or_default(),
            order: filter.order.clone().unwrap_or_default(),
            type_options: options(types, filter.project_type.as_deref()),
            status_options: options(statuses, filter.status.as_deref()),
            contractor_options: options(contractors, filter.contractor.as_deref()),
            banner_options: options(banners, filter.banner.as_deref()),
        }),
        Err(err) => server_error(err),
    }
}

async fn projects_table_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ProjectFilter>,
) -> Response {
    match state.store().list_projects(&filter).await {
        Ok(rows) => {
            let mut resp = render_html(ProjectsTablePartialTemplate {
                projects: rows.into_iter().map(project_row_view).collect(),
            });
            resp.headers_mut().insert(
                header::HeaderName::from_static("hx-trigger"),
                header::HeaderValue::from_static("projectsTableLoaded"),
            );
            resp
        }
        Err(err) => server_error(err.into()),
    }
}

/// Accepts either the ledger form or the registry (dashed) form of the id.
fn parse_project_id(raw: &str) -> Option<CanonicalProjectId> {
    CanonicalProjectId::from_canonical(raw)
        .or_else(|_| CanonicalProjectId::from_dashed(raw))
        .ok()
}

async fn project_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(canonical_id): AxumPath<String>,
) -> Response {
    let Some(id) = parse_project_id(&canonical_id) else {
        return not_found("Project not found");
    };
    match state.store().project_detail(id.as_str()).await {
        Ok(Some(detail)) => {
            let project = &detail.project;
            // Same fallback as the list view: budget figures stand in when no PO matched.
            let summary = if detail.purchase_orders.is_empty() {
                ProjectSummary {
                    project: project.clone(),
                    po_count: 0,
                    po_ordered: project.budget.committed,
                    po_invoiced: project.budget.actuals,
                    remaining: project.budget.open,
                }
            } else {
                let pos = &detail.purchase_orders;
                let po_ordered: f64 = pos.iter().map(|po| po.ordered_total).sum();
                let po_invoiced: f64 = pos.iter().map(|po| po.invoiced_total).sum();
                ProjectSummary {
                    project: project.clone(),
                    po_count: detail.purchase_orders.len() as i64,
                    po_ordered,
                    po_invoiced,
                    remaining: po_ordered - po_invoiced,
                }
            };
            let purchase_orders = detail
                .purchase_orders
                .iter()
                .map(|po| {
                    po_row_view(PoListRow {
                        purchase_order: po.clone(),
                        project_id: Some(project.project_id.clone()),
                        store_sequence: project.store_sequence.clone(),
                        city: project.city.clone(),
                        state: project.state.clone(),
                        project_status: Some(project.status.clone()),
                        project_type: Some(project.category.clone()),
                        general_contractor: project.general_contractor.clone(),
                    })
                })
                .collect();
            render_html(ProjectDetailTemplate {
                store_type: text_or_dash(project.store_type.as_deref()),
                created_date: text_or_dash(project.created_date.as_deref()),
                completion_date: text_or_dash(project.completion_date.as_deref()),
                pmo_comments: text_or_dash(project.pmo_comments.as_deref()),
                source_updated_at: text_or_dash(project.source_updated_at.as_deref()),
                budget_open: money(project.budget.open),
                budget_committed: money(project.budget.committed),
                budget_actuals: money(project.budget.actuals),
                project: project_row_view(summary),
                purchase_orders,
            })
        }
        Ok(None) => not_found("Project not found"),
        Err(err) => server_error(err.into()),
    }
}

async fn pos_page_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<PoFilter>,
) -> Response {
    match state.store().list_purchase_orders(&filter).await {
        Ok(rows) => render_html(PosPageTemplate {
            search: filter.search.clone().unwrap_or_default(),
            orphaned_filter: match filter.orphaned {
                Some(true) => "orphaned".to_string(),
                Some(false) => "matched".to_string(),
                None => "all".to_string(),
            },
            purchase_orders: rows.into_iter().map(po_row_view).collect(),
        }),
        Err(err) => server_error(err.into()),
    }
}

async fn po_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(po_number): AxumPath<String>,
) -> Response {
    match state.store().purchase_order(po_number.trim()).await {
        Ok(rows) if rows.is_empty() => not_found("Purchase order not found"),
        Ok(rows) => render_html(PoDetailPartialTemplate {
            po_number: po_number.trim().to_string(),
            lines: rows.into_iter().map(po_row_view).collect(),
        }),
        Err(err) => server_error(err.into()),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = state.pipeline.run_sync().await;
    if result.was_already_running() {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"status": "busy", "message": "a refresh is already running"})),
        )
            .into_response();
    }
    if result.is_success() {
        let body = serde_json::json!({"status": "ok", "result": result});
        (StatusCode::OK, Json(body)).into_response()
    } else {
        warn!(run_id = %result.run_id, "refresh failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"status": "error", "result": result})),
        )
            .into_response()
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.store();
    let loaded = async {
        anyhow::Ok((store.current_snapshot().await?, store.source_freshness().await?))
    }
    .await;
    match loaded {
        Ok((snapshot, freshness)) => {
            Json(serde_json::json!({"snapshot": snapshot, "freshness": freshness})).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.workspace_root.join("assets/static/app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => {
            (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response()
        }
    }
}

fn project_row_view(row: ProjectSummary) -> ProjectRowView {
    let p = row.project;
    let location = match (p.city.as_deref(), p.state.as_deref()) {
        (Some(city), Some(state)) => format!("{city}, {state}"),
        (Some(city), None) => city.to_string(),
        (None, Some(state)) => state.to_string(),
        (None, None) => "-".to_string(),
    };
    ProjectRowView {
        canonical_id: p.canonical_id.to_string(),
        project_id: p.project_id,
        sap_project_definition: p.sap_project_definition,
        category: p.category,
        status: p.status,
        store_sequence: text_or_dash(p.store_sequence.as_deref().or(p.store.as_deref())),
        location,
        banner: p.banner,
        contractor: p.general_contractor.unwrap_or_else(|| "Unassigned".to_string()),
        scope: p.scope,
        budget_total: money(p.budget.total),
        po_count: row.po_count,
        po_ordered: money(row.po_ordered),
        po_invoiced: money(row.po_invoiced),
        remaining: money(row.remaining),
    }
}

fn po_row_view(row: PoListRow) -> PoRowView {
    let give_back = row.give_back_amount();
    let location = match (row.city.as_deref(), row.state.as_deref()) {
        (Some(city), Some(state)) => format!("{city}, {state}"),
        _ => "-".to_string(),
    };
    let po = row.purchase_order;
    PoRowView {
        project_label: row
            .project_id
            .clone()
            .unwrap_or_else(|| po.project_canonical_id.dashed()),
        has_project: !po.orphaned,
        over_invoiced: po.is_over_invoiced(),
        po_number: po.po_number,
        project_canonical_id: po.project_canonical_id.to_string(),
        vendor: po.vendor.unwrap_or_else(|| "-".to_string()),
        location,
        ordered: money(po.ordered_total),
        invoiced: money(po.invoiced_total),
        remaining: money(po.remaining),
        give_back: money(give_back),
        status: po.status.unwrap_or_else(|| "Unknown".to_string()),
        created_date: po.created_date.unwrap_or_else(|| "-".to_string()),
        last_update: po.last_update.unwrap_or_else(|| "-".to_string()),
        commitment_lines: po.commitment_lines,
        invoice_lines: po.invoice_lines,
        orphaned: po.orphaned,
        source: match po.source {
            PoSource::Ledger => "Ledger project definition",
            PoSource::Umbrella => "Umbrella line, matched by store",
            PoSource::Comment => "Cited in PMO comments",
        },
        source_label: match po.source {
            PoSource::Ledger => None,
            PoSource::Umbrella => Some("Umbrella"),
            PoSource::Comment => Some("From comments"),
        },
    }
}

fn wbs_row_view(row: WbsNodeBudget) -> WbsRowView {
    WbsRowView {
        node_key: row.node_key,
        node_label: row.node_label,
        approval_year: row.approval_year,
        description: row.description,
        project_count: row.project_count,
        current_budget: money(row.current_budget),
        actuals: money(row.actuals),
        open_commitments: money(row.open_commitments),
        budget_available: money(row.budget_available),
        found: row.found,
    }
}

fn text_or_dash(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("-")
        .to_string()
}

/// Whole dollars with thousands separators, e.g. `-$1,250`.
fn money(value: f64) -> String {
    let rounded = value.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded < 0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(message.to_string())).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use plbg_adapters::FixtureWarehouseSource;
    use plbg_sync::ReconcileConfig;
    use std::path::Path;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    async fn test_app(sync_first: bool) -> (TempDir, Router) {
        test_app_with_scope(sync_first, LedgerScopeMode::All).await
    }

    async fn test_app_with_scope(sync_first: bool, scope: LedgerScopeMode) -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("dashboard.db")).await.unwrap();
        store.migrate().await.unwrap();
        let bundle = workspace_root().join("fixtures/sample/bundle.json");
        let source = FixtureWarehouseSource::load(bundle).unwrap();
        let pipeline = Arc::new(
            SyncPipeline::new(Arc::new(source), store, ReconcileConfig::default())
                .with_ledger_scope(scope),
        );
        if sync_first {
            assert!(pipeline.run_sync().await.is_success());
        }
        (dir, app(AppState::new(pipeline, workspace_root())))
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn money_groups_thousands_and_keeps_sign() {
        assert_eq!(money(0.0), "$0");
        assert_eq!(money(8500.4), "$8,500");
        assert_eq!(money(1_234_567.0), "$1,234,567");
        assert_eq!(money(-700.0), "-$700");
    }

    #[tokio::test]
    async fn index_renders_kpis() {
        let (_dir, app) = test_app(true).await;
        let (status, _, text) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Plumbing Projects Dashboard"));
        assert!(text.contains("SAP Purchase Orders"));
        assert!(text.contains("Stokes Plumbing") || text.contains("STOKES PLUMBING LLC"));
    }

    #[tokio::test]
    async fn index_lists_wbs_nodes_including_missing_ones() {
        let (_dir, app) = test_app(true).await;
        let (status, _, text) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("WBS fund budgets"));
        assert!(text.contains("Plumbing upgrades"));
        assert!(text.contains("$37,000"));
        assert!(text.contains("Lift Stations"));
        assert!(text.contains("Not found in SAP"));
    }

    #[tokio::test]
    async fn orphan_kpi_is_marked_untracked_when_only_program_ledger_is_pulled() {
        let (_dir, app) = test_app_with_scope(true, LedgerScopeMode::Projects).await;
        let (status, _, text) = get(&app, "/dashboard/content").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Tracked on full-ledger syncs only"));

        let (_dir, app) = test_app(true).await;
        let (_, _, text) = get(&app, "/dashboard/content").await;
        assert!(!text.contains("Tracked on full-ledger syncs only"));
        assert!(text.contains("Orphaned POs"));
    }

    #[tokio::test]
    async fn index_renders_before_first_sync() {
        let (_dir, app) = test_app(false).await;
        let (status, _, text) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("No data yet"));
    }

    #[tokio::test]
    async fn projects_table_partial_sets_htmx_trigger() {
        let (_dir, app) = test_app(true).await;
        let uri = "/projects/table?search=water%20main&sort=remaining&order=desc";
        let (status, headers, text) = get(&app, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["hx-trigger"], "projectsTableLoaded");
        assert!(text.contains("USFC-009320"));
        assert!(!text.contains("USMS-001700"));

        let (status, _, page) = get(&app, "/projects?banner=DC").await;
        assert_eq!(status, StatusCode::OK);
        assert!(page.contains("PLBG EQUIPMENT REPLACEMENT"));
    }

    #[tokio::test]
    async fn project_detail_accepts_both_id_forms_and_404s_unknown() {
        let (_dir, app) = test_app(true).await;
        let (status, _, text) = get(&app, "/projects/USFC00932000000").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("40836460"));
        assert!(text.contains("$8,500"));

        let (status, _, _) = get(&app, "/projects/USFC-009320").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = get(&app, "/projects/USFC00000000000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = get(&app, "/projects/not-an-id").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn po_pages_flag_orphans_and_404_unknown() {
        let (_dir, app) = test_app(true).await;
        let (status, _, text) = get(&app, "/pos?orphaned=true").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("40999017"));
        assert!(!text.contains("40836460"));

        let (status, _, text) = get(&app, "/pos/40900902").await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("Over-invoiced"));

        let (status, _, _) = get(&app, "/pos/00000000").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn charts_return_plotly_json() {
        let (_dir, app) = test_app(true).await;
        for uri in ["/charts/by-type", "/charts/by-status", "/charts/budget-by-type"] {
            let (status, headers, text) = get(&app, uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(headers[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert!(value["data"].is_array());
        }
    }

    #[tokio::test]
    async fn refresh_runs_sync_and_status_reports_snapshot() {
        let (_dir, app) = test_app(false).await;
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
        assert_eq!(value["result"]["projects_loaded"], 4);
        assert_eq!(value["result"]["orphaned_pos"], 1);

        let (status, _, text) = get(&app, "/api/sync/status").await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["snapshot"]["pos_loaded"], 5);
        assert_eq!(value["freshness"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stylesheet_is_served() {
        let (_dir, app) = test_app(false).await;
        let (status, headers, _) = get(&app, "/assets/static/app.css").await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/css"));
    }
}
