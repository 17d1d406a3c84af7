//! Parquet export of the current snapshot.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use plbg_core::{Project, PurchaseOrder, WbsNodeBudget};
use plbg_storage::{LocalStore, PoFilter, ProjectFilter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub snapshot_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Write one parquet file per snapshot table plus `manifest.json` into `dir`.
pub async fn export_snapshot_parquet(store: &LocalStore, dir: &Path) -> Result<PathBuf> {
    let Some(header) = store.current_snapshot().await? else {
        bail!("no snapshot has been published yet");
    };
    let projects: Vec<Project> = store
        .list_projects(&ProjectFilter {
            sort: Some("canonical_id".to_string()),
            ..Default::default()
        })
        .await?
        .into_iter()
        .map(|row| row.project)
        .collect();
    let purchase_orders: Vec<PurchaseOrder> = store
        .list_purchase_orders(&PoFilter::default())
        .await?
        .into_iter()
        .map(|row| row.purchase_order)
        .collect();
    let wbs_budgets = store.wbs_budgets().await?;
    let after = store.current_snapshot().await?;
    if after.as_ref().map(|h| h.run_id) != Some(header.run_id) {
        bail!("snapshot {} was replaced during export; run the export again", header.run_id);
    }

    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let projects_path = dir.join("projects.parquet");
    let pos_path = dir.join("purchase_orders.parquet");
    write_projects_parquet(&projects_path, &projects)?;
    write_purchase_orders_parquet(&pos_path, &purchase_orders)?;
    let wbs_path = dir.join("wbs_budgets.parquet");
    write_wbs_parquet(&wbs_path, &wbs_budgets)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        snapshot_id: header.run_id,
        files: vec![
            manifest_entry("projects", dir, &projects_path, projects.len())?,
            manifest_entry("purchase_orders", dir, &pos_path, purchase_orders.len())?,
            manifest_entry("wbs_budgets", dir, &wbs_path, wbs_budgets.len())?,
        ],
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        snapshot_id = %header.run_id,
        projects = projects.len(),
        purchase_orders = purchase_orders.len(),
        "parquet export written"
    );
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn utf8<'a>(values: impl Iterator<Item = Option<&'a str>>) -> StringArray {
    StringArray::from(values.collect::<Vec<_>>())
}

fn f64s(values: impl Iterator<Item = f64>) -> Float64Array {
    Float64Array::from(values.collect::<Vec<_>>())
}

fn u32s(values: impl Iterator<Item = u32>) -> UInt32Array {
    UInt32Array::from(values.collect::<Vec<_>>())
}

fn write_projects_parquet(path: &Path, projects: &[Project]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("canonical_id", DataType::Utf8, false),
        ArrowField::new("project_id", DataType::Utf8, false),
        ArrowField::new("sap_project_definition", DataType::Utf8, false),
        ArrowField::new("project_type", DataType::Utf8, false),
        ArrowField::new("project_status", DataType::Utf8, false),
        ArrowField::new("store", DataType::Utf8, true),
        ArrowField::new("city", DataType::Utf8, true),
        ArrowField::new("state", DataType::Utf8, true),
        ArrowField::new("banner", DataType::Utf8, false),
        ArrowField::new("general_contractor", DataType::Utf8, true),
        ArrowField::new("brief_scope_of_work", DataType::Utf8, false),
        ArrowField::new("budget_total", DataType::Float64, false),
        ArrowField::new("budget_open", DataType::Float64, false),
        ArrowField::new("budget_committed", DataType::Float64, false),
        ArrowField::new("budget_actuals", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8(projects.iter().map(|p| Some(p.canonical_id.as_str())))),
            Arc::new(utf8(projects.iter().map(|p| Some(p.project_id.as_str())))),
            Arc::new(utf8(projects.iter().map(|p| Some(p.sap_project_definition.as_str())))),
            Arc::new(utf8(projects.iter().map(|p| Some(p.category.as_str())))),
            Arc::new(utf8(projects.iter().map(|p| Some(p.status.as_str())))),
            Arc::new(utf8(projects.iter().map(|p| p.store.as_deref()))),
            Arc::new(utf8(projects.iter().map(|p| p.city.as_deref()))),
            Arc::new(utf8(projects.iter().map(|p| p.state.as_deref()))),
            Arc::new(utf8(projects.iter().map(|p| Some(p.banner.as_str())))),
            Arc::new(utf8(projects.iter().map(|p| p.general_contractor.as_deref()))),
            Arc::new(utf8(projects.iter().map(|p| Some(p.scope.as_str())))),
            Arc::new(f64s(projects.iter().map(|p| p.budget.total))),
            Arc::new(f64s(projects.iter().map(|p| p.budget.open))),
            Arc::new(f64s(projects.iter().map(|p| p.budget.committed))),
            Arc::new(f64s(projects.iter().map(|p| p.budget.actuals))),
        ],
    )
    .context("building projects record batch")?;
    write_parquet(path, batch)
}

fn write_purchase_orders_parquet(path: &Path, pos: &[PurchaseOrder]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("po_number", DataType::Utf8, false),
        ArrowField::new("project_canonical_id", DataType::Utf8, false),
        ArrowField::new("vendor", DataType::Utf8, true),
        ArrowField::new("ordered_total", DataType::Float64, false),
        ArrowField::new("invoiced_total", DataType::Float64, false),
        ArrowField::new("remaining", DataType::Float64, false),
        ArrowField::new("po_status", DataType::Utf8, true),
        ArrowField::new("created_date", DataType::Utf8, true),
        ArrowField::new("last_update", DataType::Utf8, true),
        ArrowField::new("commitment_lines", DataType::UInt32, false),
        ArrowField::new("invoice_lines", DataType::UInt32, false),
        ArrowField::new("orphaned", DataType::Boolean, false),
        ArrowField::new("source", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8(pos.iter().map(|p| Some(p.po_number.as_str())))),
            Arc::new(utf8(pos.iter().map(|p| Some(p.project_canonical_id.as_str())))),
            Arc::new(utf8(pos.iter().map(|p| p.vendor.as_deref()))),
            Arc::new(f64s(pos.iter().map(|p| p.ordered_total))),
            Arc::new(f64s(pos.iter().map(|p| p.invoiced_total))),
            Arc::new(f64s(pos.iter().map(|p| p.remaining))),
            Arc::new(utf8(pos.iter().map(|p| p.status.as_deref()))),
            Arc::new(utf8(pos.iter().map(|p| p.created_date.as_deref()))),
            Arc::new(utf8(pos.iter().map(|p| p.last_update.as_deref()))),
            Arc::new(u32s(pos.iter().map(|p| p.commitment_lines))),
            Arc::new(u32s(pos.iter().map(|p| p.invoice_lines))),
            Arc::new(BooleanArray::from(pos.iter().map(|p| p.orphaned).collect::<Vec<_>>())),
            Arc::new(utf8(pos.iter().map(|p| Some(p.source.as_str())))),
        ],
    )
    .context("building purchase_orders record batch")?;
    write_parquet(path, batch)
}

fn write_wbs_parquet(path: &Path, nodes: &[WbsNodeBudget]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("node_key", DataType::Utf8, false),
        ArrowField::new("approval_year", DataType::Utf8, false),
        ArrowField::new("node_label", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, false),
        ArrowField::new("original_budget", DataType::Float64, false),
        ArrowField::new("current_budget", DataType::Float64, false),
        ArrowField::new("actuals", DataType::Float64, false),
        ArrowField::new("open_commitments", DataType::Float64, false),
        ArrowField::new("budget_available", DataType::Float64, false),
        ArrowField::new("project_count", DataType::UInt32, false),
        ArrowField::new("found", DataType::Boolean, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8(nodes.iter().map(|n| Some(n.node_key.as_str())))),
            Arc::new(utf8(nodes.iter().map(|n| Some(n.approval_year.as_str())))),
            Arc::new(utf8(nodes.iter().map(|n| Some(n.node_label.as_str())))),
            Arc::new(utf8(nodes.iter().map(|n| Some(n.description.as_str())))),
            Arc::new(f64s(nodes.iter().map(|n| n.original_budget))),
            Arc::new(f64s(nodes.iter().map(|n| n.current_budget))),
            Arc::new(f64s(nodes.iter().map(|n| n.actuals))),
            Arc::new(f64s(nodes.iter().map(|n| n.open_commitments))),
            Arc::new(f64s(nodes.iter().map(|n| n.budget_available))),
            Arc::new(u32s(nodes.iter().map(|n| n.project_count))),
            Arc::new(BooleanArray::from(nodes.iter().map(|n| n.found).collect::<Vec<_>>())),
        ],
    )
    .context("building wbs_budgets record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
