//! Pure transform from raw warehouse rows to the normalized project and PO tables.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use plbg_core::{
    Budget, CanonicalProjectId, LineKind, PoSource, Project, PurchaseOrder, RawLedgerRow,
    RawProjectRow, RawScopeRow, RawUmbrellaRow, RawWbsRow, ValidationError, WbsNodeBudget,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const DEFAULT_PROGRAM_TYPES: [&str; 4] = [
    "PLBG EQUIPMENT REPLACEMENT",
    "PLBG SANITARY/GREASE INFRASTRUCTURE",
    "PLBG GAS INFRASTRUCTURE",
    "PLBG WATER INFRASTRUCTURE",
];

/// Sam's Club umbrella definition that vendors book store work to.
pub const DEFAULT_UMBRELLA_DEFINITION: &str = "USMS-001700";

pub const DEFAULT_UMBRELLA_VENDORS: [&str; 5] = [
    "APTIM Environmental",
    "United Installers",
    "Reynalds Brothers",
    "Kleenco Maintenance",
    "Stokes Plumbing",
];

pub const DEFAULT_WBS_NODES: [(&str, &str); 3] = [
    ("WMUS.SG.FAC.UP.PLB", "Plumbing"),
    ("WMUS.SG.FAC.UP.TANK", "Tanks"),
    ("WMUS.SG.FAC.UP.LIFT", "Lift Stations"),
];

/// Description given to placeholder rows of WBS nodes the report did not return.
pub const WBS_NOT_FOUND: &str = "Not found in SAP";

/// "APTIM PO# 40836460", "installer po 40836461".
static COMMENT_PO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:APTIM|INSTALLER)\s+PO#?\s*(\d{8})").expect("comment PO pattern is valid")
});

/// Hub-store bookings carry the real store in front of the item text, as in "4724UCOTanks".
static ITEM_TEXT_STORE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+)UCOTank").expect("item text store pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UmbrellaConfig {
    /// Dashed definition, e.g. `USMS-001700`.
    pub project_definition: String,
    /// Vendor name fragments, matched case-insensitively.
    pub vendors: Vec<String>,
}

impl Default for UmbrellaConfig {
    fn default() -> Self {
        Self {
            project_definition: DEFAULT_UMBRELLA_DEFINITION.to_string(),
            vendors: DEFAULT_UMBRELLA_VENDORS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl UmbrellaConfig {
    /// None when the umbrella pass is switched off (no vendors or no definition).
    pub fn definition(&self) -> Option<CanonicalProjectId> {
        if self.vendors.iter().all(|v| v.trim().is_empty()) {
            return None;
        }
        let definition = self.project_definition.trim();
        if definition.is_empty() {
            return None;
        }
        match CanonicalProjectId::from_dashed(definition) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(definition, error = %err, "umbrella definition is malformed; pass disabled");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbsNode {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub program_types: Vec<String>,
    pub umbrella: UmbrellaConfig,
    pub wbs_nodes: Vec<WbsNode>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            program_types: DEFAULT_PROGRAM_TYPES.iter().map(|t| t.to_string()).collect(),
            umbrella: UmbrellaConfig::default(),
            wbs_nodes: default_wbs_nodes(),
        }
    }
}

pub fn default_wbs_nodes() -> Vec<WbsNode> {
    DEFAULT_WBS_NODES
        .iter()
        .map(|(key, label)| WbsNode {
            key: key.to_string(),
            label: label.to_string(),
        })
        .collect()
}

impl ReconcileConfig {
    pub fn allows(&self, program_type: &str) -> bool {
        let wanted = program_type.trim();
        self.program_types
            .iter()
            .any(|t| t.trim().eq_ignore_ascii_case(wanted))
    }

    pub fn wbs_node_keys(&self) -> Vec<String> {
        self.wbs_nodes
            .iter()
            .map(|node| node.key.trim().to_uppercase())
            .collect()
    }
}

/// Decoded rows handed to [`reconcile_sources`]. Unused passes take empty slices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceRows<'a> {
    pub projects: &'a [RawProjectRow],
    pub ledger: &'a [RawLedgerRow],
    pub scope: &'a [RawScopeRow],
    pub umbrella: &'a [RawUmbrellaRow],
    /// Ledger lines fetched by PO number for comment-cited POs.
    pub comment_lines: &'a [RawLedgerRow],
    pub wbs: &'a [RawWbsRow],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledSnapshot {
    pub projects: Vec<Project>,
    pub purchase_orders: Vec<PurchaseOrder>,
    pub wbs_budgets: Vec<WbsNodeBudget>,
    pub issues: Vec<ValidationError>,
}

impl ReconciledSnapshot {
    pub fn orphaned_pos(&self) -> usize {
        self.purchase_orders.iter().filter(|po| po.orphaned).count()
    }
}

pub fn banner_for_store_type(store_type: Option<&str>) -> &'static str {
    let Some(store_type) = store_type.map(str::trim).filter(|s| !s.is_empty()) else {
        return "Unknown";
    };
    match store_type.to_ascii_uppercase().as_str() {
        "SAM" => "Sam's Club",
        "FC" | "GROCERY DC" | "GDC" => "DC",
        _ => "Walmart",
    }
}

pub fn budget_from_row(row: &RawProjectRow) -> Budget {
    let spent_and_open = row.sap_actuals + row.sap_open_commitments;
    Budget {
        total: if spent_and_open > 0.0 {
            spent_and_open
        } else {
            row.total_contract_amount
        },
        open: row.sap_open_commitments,
        committed: row.contractor_po_amount,
        actuals: row.sap_actuals,
    }
}

/// Store numbers compare without leading zeros ("0100" and "100" are one store).
fn store_key(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let key = trimmed.trim_start_matches('0');
    Some(if key.is_empty() { "0" } else { key }.to_string())
}

/// Store a hub-booked umbrella line really belongs to: item text first, then `store_nbr`.
pub fn umbrella_line_store(row: &RawUmbrellaRow) -> Option<String> {
    row.item_text
        .as_deref()
        .and_then(|text| ITEM_TEXT_STORE_RE.captures(text.trim()))
        .and_then(|caps| caps.get(1))
        .and_then(|m| store_key(m.as_str()))
        .or_else(|| row.store_nbr.as_deref().and_then(store_key))
}

/// PO numbers cited in each project's PMO comments. A number cited by several projects goes
/// to the last one in row order.
pub fn comment_po_references(
    config: &ReconcileConfig,
    projects: &[RawProjectRow],
) -> BTreeMap<String, CanonicalProjectId> {
    let mut references = BTreeMap::new();
    for row in projects {
        if !config.allows(row.project_type.as_deref().unwrap_or_default()) {
            continue;
        }
        let Some(comments) = non_empty(row.pmo_sr_pm_comments.as_ref()) else {
            continue;
        };
        let Some(id) = row
            .sap_project_definition
            .as_deref()
            .and_then(|def| CanonicalProjectId::from_dashed(def.trim()).ok())
        else {
            continue;
        };
        for caps in COMMENT_PO_RE.captures_iter(&comments) {
            if let Some(po) = caps.get(1) {
                references.insert(po.as_str().to_string(), id.clone());
            }
        }
    }
    references
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn max_text(current: &mut Option<String>, candidate: Option<String>) {
    if let Some(candidate) = candidate {
        if current.as_ref().map_or(true, |c| candidate > *c) {
            *current = Some(candidate);
        }
    }
}

fn min_text(current: &mut Option<String>, candidate: Option<String>) {
    if let Some(candidate) = candidate {
        if current.as_ref().map_or(true, |c| candidate < *c) {
            *current = Some(candidate);
        }
    }
}

struct ProjectDraft {
    project: Project,
    registry_contractor: Option<String>,
    gc_firm: Option<String>,
    /// Flagged duplicate or cancelled in the scope text.
    superseded: bool,
}

#[derive(Default)]
struct PoAccumulator {
    vendor: Option<String>,
    ordered: f64,
    invoiced: f64,
    status: Option<String>,
    created_date: Option<String>,
    last_update: Option<String>,
    commitment_lines: u32,
    invoice_lines: u32,
}

impl PoAccumulator {
    fn push(&mut self, row: &RawLedgerRow) {
        self.ordered += row.ordered_amount;
        self.invoiced += row.invoiced_amount;
        match LineKind::classify(row.ordered_amount, row.invoiced_amount) {
            LineKind::Commitment => self.commitment_lines += 1,
            LineKind::Invoice => self.invoice_lines += 1,
            LineKind::Mixed => {
                self.commitment_lines += 1;
                self.invoice_lines += 1;
            }
            LineKind::Empty => {}
        }
        max_text(&mut self.vendor, non_empty(row.vendor.as_ref()));
        max_text(&mut self.status, non_empty(row.po_status.as_ref()));
        max_text(&mut self.last_update, non_empty(row.updated_at.as_ref()));
        min_text(&mut self.created_date, non_empty(row.document_date.as_ref()));
    }
}

impl PoAccumulator {
    fn into_purchase_order(
        self,
        po_number: String,
        project_canonical_id: CanonicalProjectId,
        source: PoSource,
        orphaned: bool,
    ) -> PurchaseOrder {
        PurchaseOrder {
            po_number,
            project_canonical_id,
            vendor: self.vendor,
            ordered_total: self.ordered,
            invoiced_total: self.invoiced,
            remaining: self.ordered - self.invoiced,
            status: self.status,
            created_date: self.created_date,
            last_update: self.last_update,
            commitment_lines: self.commitment_lines,
            invoice_lines: self.invoice_lines,
            orphaned,
            source,
        }
    }

    fn is_empty(&self) -> bool {
        self.ordered == 0.0 && self.invoiced == 0.0
    }
}

/// Build the normalized snapshot from the three core tables only.
pub fn reconcile(
    config: &ReconcileConfig,
    projects: &[RawProjectRow],
    ledger: &[RawLedgerRow],
    scope: &[RawScopeRow],
) -> ReconciledSnapshot {
    reconcile_sources(
        config,
        &SourceRows {
            projects,
            ledger,
            scope,
            ..Default::default()
        },
    )
}

/// Build the normalized snapshot contents.
///
/// Purchase orders are attached in three passes. Ledger lines carrying a project
/// definition come first; umbrella lines matched by store number and comment-cited POs only
/// add PO numbers the earlier passes did not produce.
///
/// Output order depends only on the data: projects by canonical id, purchase orders by
/// (po number, canonical id), WBS rows by (node, approval year).
pub fn reconcile_sources(config: &ReconcileConfig, rows: &SourceRows<'_>) -> ReconciledSnapshot {
    let SourceRows {
        projects,
        ledger,
        scope,
        umbrella,
        comment_lines,
        wbs,
    } = *rows;
    let mut issues = Vec::new();

    let mut scope_by_id: BTreeMap<CanonicalProjectId, String> = BTreeMap::new();
    for (index, row) in scope.iter().enumerate() {
        let Some(raw_id) = non_empty(row.sap_project_definition.as_ref()) else {
            issues.push(ValidationError::new(
                "scope_attributes",
                index + 1,
                "missing sap_project_definition",
            ));
            continue;
        };
        let id = match CanonicalProjectId::from_dashed(&raw_id) {
            Ok(id) => id,
            Err(err) => {
                issues.push(ValidationError::new("scope_attributes", index + 1, err.to_string()));
                continue;
            }
        };
        if let Some(text) = non_empty(row.brief_scope_of_work.as_ref()) {
            scope_by_id.entry(id).or_insert(text);
        }
    }

    let mut drafts: BTreeMap<CanonicalProjectId, ProjectDraft> = BTreeMap::new();
    for (index, row) in projects.iter().enumerate() {
        let program_type = row.project_type.as_deref().unwrap_or_default().trim();
        if !config.allows(program_type) {
            debug!(row = index + 1, program_type, "project outside program allow-list");
            continue;
        }
        let Some(raw_id) = non_empty(row.sap_project_definition.as_ref()) else {
            issues.push(ValidationError::new(
                "projects",
                index + 1,
                "missing sap_project_definition",
            ));
            continue;
        };
        let canonical_id = match CanonicalProjectId::from_dashed(&raw_id) {
            Ok(id) => id,
            Err(err) => {
                issues.push(ValidationError::new("projects", index + 1, err.to_string()));
                continue;
            }
        };

        let entry = match drafts.entry(canonical_id.clone()) {
            Entry::Occupied(_) => {
                warn!(row = index + 1, %canonical_id, "duplicate project id; keeping first row");
                continue;
            }
            Entry::Vacant(entry) => entry,
        };

        let scope_text = scope_by_id
            .get(&canonical_id)
            .cloned()
            .or_else(|| non_empty(row.brief_scope_of_work.as_ref()))
            .unwrap_or_default();
        let registry_contractor = non_empty(row.general_contractor.as_ref());
        let gc_firm = non_empty(row.lx_gc_firm.as_ref()).filter(|firm| firm != "!Unknown");
        let lowered_scope = scope_text.to_lowercase();
        let superseded = lowered_scope.contains("duplicate") || lowered_scope.contains("cancelled");
        let project_id =
            non_empty(row.project_id.as_ref()).unwrap_or_else(|| canonical_id.dashed());
        let status =
            non_empty(row.project_status.as_ref()).unwrap_or_else(|| "Unknown".to_string());

        entry.insert(ProjectDraft {
            project: Project {
                project_id,
                sap_project_definition: canonical_id.dashed(),
                canonical_id,
                category: program_type.to_string(),
                status,
                store: non_empty(row.store.as_ref()),
                sequence: non_empty(row.sequence.as_ref()),
                store_sequence: non_empty(row.store_sequence.as_ref()),
                city: non_empty(row.city.as_ref()),
                state: non_empty(row.state.as_ref()),
                store_type: non_empty(row.store_type.as_ref()),
                banner: banner_for_store_type(row.store_type.as_deref()).to_string(),
                general_contractor: None,
                scope: scope_text,
                created_date: non_empty(row.created_date.as_ref()),
                completion_date: non_empty(row.construction_complete_date.as_ref()),
                pmo_comments: non_empty(row.pmo_sr_pm_comments.as_ref()),
                source_updated_at: non_empty(row.lucernex_updated_at.as_ref()),
                budget: budget_from_row(row),
            },
            registry_contractor,
            gc_firm,
            superseded,
        });
    }

    let mut groups: BTreeMap<(String, CanonicalProjectId), PoAccumulator> = BTreeMap::new();
    for (index, row) in ledger.iter().enumerate() {
        let Some(po_number) = non_empty(row.po_number.as_ref()) else {
            issues.push(ValidationError::new("po_ledger", index + 1, "missing po_number"));
            continue;
        };
        let Some(raw_id) = non_empty(row.project_definition.as_ref()) else {
            issues.push(ValidationError::new(
                "po_ledger",
                index + 1,
                "missing project_definition",
            ));
            continue;
        };
        let canonical_id = match CanonicalProjectId::from_canonical(&raw_id) {
            Ok(id) => id,
            Err(err) => {
                issues.push(ValidationError::new("po_ledger", index + 1, err.to_string()));
                continue;
            }
        };
        groups.entry((po_number, canonical_id)).or_default().push(row);
    }

    let mut purchase_orders = Vec::with_capacity(groups.len());
    for ((po_number, canonical_id), acc) in groups {
        if acc.is_empty() {
            debug!(%po_number, %canonical_id, "dropping purchase order with no amounts");
            continue;
        }
        let orphaned = !drafts.contains_key(&canonical_id);
        purchase_orders.push(acc.into_purchase_order(
            po_number,
            canonical_id,
            PoSource::Ledger,
            orphaned,
        ));
    }
    let mut known_numbers: BTreeSet<String> =
        purchase_orders.iter().map(|po| po.po_number.clone()).collect();

    if !umbrella.is_empty() {
        let store_projects = store_project_map(&drafts);
        let mut umbrella_groups: BTreeMap<(String, CanonicalProjectId), PoAccumulator> =
            BTreeMap::new();
        let mut unmatched = 0usize;
        for (index, row) in umbrella.iter().enumerate() {
            let Some(po_number) = non_empty(row.po_number.as_ref()) else {
                issues.push(ValidationError::new(
                    "umbrella_po_lines",
                    index + 1,
                    "missing po_number",
                ));
                continue;
            };
            let target = umbrella_line_store(row).and_then(|store| store_projects.get(&store));
            let Some(target) = target else {
                unmatched += 1;
                continue;
            };
            umbrella_groups
                .entry((po_number, (*target).clone()))
                .or_default()
                .push(&row.ledger_line());
        }
        let before = purchase_orders.len();
        for ((po_number, canonical_id), acc) in umbrella_groups {
            if acc.is_empty() || known_numbers.contains(&po_number) {
                continue;
            }
            purchase_orders.push(acc.into_purchase_order(
                po_number,
                canonical_id,
                PoSource::Umbrella,
                false,
            ));
        }
        known_numbers.extend(purchase_orders[before..].iter().map(|po| po.po_number.clone()));
        info!(
            lines = umbrella.len(),
            added = purchase_orders.len() - before,
            unmatched,
            "umbrella purchase orders attributed by store"
        );
    }

    if !comment_lines.is_empty() {
        let references = comment_po_references(config, projects);
        let mut comment_groups: BTreeMap<String, PoAccumulator> = BTreeMap::new();
        for row in comment_lines {
            let Some(po_number) = non_empty(row.po_number.as_ref()) else {
                continue;
            };
            if references.contains_key(&po_number) && !known_numbers.contains(&po_number) {
                comment_groups.entry(po_number).or_default().push(row);
            }
        }
        let before = purchase_orders.len();
        for (po_number, acc) in comment_groups {
            let Some(canonical_id) = references.get(&po_number) else {
                continue;
            };
            if acc.is_empty() || !drafts.contains_key(canonical_id) {
                continue;
            }
            let canonical_id = canonical_id.clone();
            purchase_orders.push(acc.into_purchase_order(
                po_number,
                canonical_id,
                PoSource::Comment,
                false,
            ));
        }
        info!(
            referenced = references.len(),
            recovered = purchase_orders.len() - before,
            "comment-cited purchase orders recovered"
        );
    }
    purchase_orders.sort_by(|a, b| {
        (&a.po_number, &a.project_canonical_id).cmp(&(&b.po_number, &b.project_canonical_id))
    });

    let mut vendor_totals: BTreeMap<&CanonicalProjectId, BTreeMap<&str, f64>> = BTreeMap::new();
    for po in purchase_orders.iter().filter(|po| !po.orphaned) {
        if let Some(vendor) = po.vendor.as_deref() {
            *vendor_totals
                .entry(&po.project_canonical_id)
                .or_default()
                .entry(vendor)
                .or_default() += po.ordered_total;
        }
    }

    let projects = drafts
        .into_values()
        .map(|draft| {
            let mut project = draft.project;
            let top_vendor = vendor_totals.get(&project.canonical_id).and_then(|totals| {
                // Ascending name order plus a strict comparison keeps the first name on ties.
                let mut best: Option<(&str, f64)> = None;
                for (vendor, total) in totals {
                    if best.map_or(true, |(_, best_total)| *total > best_total) {
                        best = Some((vendor, *total));
                    }
                }
                best.map(|(vendor, _)| vendor.to_string())
            });
            project.general_contractor = top_vendor
                .or(draft.registry_contractor)
                .or(draft.gc_firm);
            project
        })
        .collect();

    let wbs_budgets = aggregate_wbs(config, wbs, &mut issues);

    ReconciledSnapshot {
        projects,
        purchase_orders,
        wbs_budgets,
        issues,
    }
}

/// Store number to in-program project. A later project for the same store only replaces
/// the entry when it is active and not flagged superseded.
fn store_project_map(
    drafts: &BTreeMap<CanonicalProjectId, ProjectDraft>,
) -> BTreeMap<String, &CanonicalProjectId> {
    let mut by_store: BTreeMap<String, &CanonicalProjectId> = BTreeMap::new();
    for (id, draft) in drafts {
        let Some(store) = draft.project.store.as_deref().and_then(store_key) else {
            continue;
        };
        let preferred =
            !draft.superseded && draft.project.status.trim().eq_ignore_ascii_case("active");
        match by_store.entry(store) {
            Entry::Vacant(entry) => {
                entry.insert(id);
            }
            Entry::Occupied(mut entry) if preferred => {
                entry.insert(id);
            }
            Entry::Occupied(_) => {}
        }
    }
    by_store
}

#[derive(Default)]
struct WbsAccumulator {
    description: Option<String>,
    projects: BTreeSet<String>,
    budget: WbsNodeBudget,
}

/// Sum report lines per (node, approval year), then add a placeholder row for every
/// configured node the report did not return, once per year seen (year "0" when none).
fn aggregate_wbs(
    config: &ReconcileConfig,
    rows: &[RawWbsRow],
    issues: &mut Vec<ValidationError>,
) -> Vec<WbsNodeBudget> {
    let labels: BTreeMap<String, &str> = config
        .wbs_nodes
        .iter()
        .map(|node| (node.key.trim().to_uppercase(), node.label.as_str()))
        .collect();
    if labels.is_empty() {
        return Vec::new();
    }

    let mut groups: BTreeMap<(String, String), WbsAccumulator> = BTreeMap::new();
    for (index, row) in rows.iter().enumerate() {
        let Some(key) = non_empty(row.program_position.as_ref()).map(|k| k.to_uppercase()) else {
            issues.push(ValidationError::new("wbs_budgets", index + 1, "missing program_position"));
            continue;
        };
        if !labels.contains_key(&key) {
            continue;
        }
        let Some(year) = non_empty(row.approval_year.as_ref()) else {
            issues.push(ValidationError::new("wbs_budgets", index + 1, "missing approval_year"));
            continue;
        };
        let acc = groups.entry((key, year)).or_default();
        max_text(&mut acc.description, non_empty(row.program_position_desc.as_ref()));
        if let Some(definition) = non_empty(row.project_definition.as_ref()) {
            acc.projects.insert(definition);
        }
        let b = &mut acc.budget;
        b.original_budget += row.original_budget;
        b.supplemental_budget += row.supplemental_budget;
        b.returned_budget += row.returned_budget;
        b.current_budget += row.current_budget;
        b.actuals += row.total_actual;
        b.open_commitments += row.total_commitments;
        b.budget_available += row.current_budget_available;
        b.distributed_budget += row.distributed_budget;
        b.budget_cf_from_prev += row.budget_cf_from_previous_fiscal_year;
        b.budget_cf_to_next += row.budget_cf_to_next_fiscal_year;
    }

    let years: BTreeSet<String> = groups.keys().map(|(_, year)| year.clone()).collect();
    let found: BTreeSet<String> = groups.keys().map(|(key, _)| key.clone()).collect();

    let mut budgets: BTreeMap<(String, String), WbsNodeBudget> = groups
        .into_iter()
        .map(|((key, year), acc)| {
            let budget = WbsNodeBudget {
                node_label: labels.get(&key).map_or_else(|| key.clone(), |l| l.to_string()),
                node_key: key.clone(),
                approval_year: year.clone(),
                description: acc.description.unwrap_or_default(),
                project_count: u32::try_from(acc.projects.len()).unwrap_or(u32::MAX),
                found: true,
                ..acc.budget
            };
            ((key, year), budget)
        })
        .collect();

    let placeholder_years: Vec<String> = if years.is_empty() {
        vec!["0".to_string()]
    } else {
        years.into_iter().collect()
    };
    for (key, label) in &labels {
        if found.contains(key) {
            continue;
        }
        for year in &placeholder_years {
            budgets.insert(
                (key.clone(), year.clone()),
                WbsNodeBudget {
                    node_key: key.clone(),
                    approval_year: year.clone(),
                    node_label: label.to_string(),
                    description: WBS_NOT_FOUND.to_string(),
                    ..Default::default()
                },
            );
        }
    }
    budgets.into_values().collect()
}
