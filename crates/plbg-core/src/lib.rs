//! Core domain model for the plumbing projects dashboard.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "plbg-core";

/// Letters in the project-definition prefix (`USFC`).
pub const PREFIX_LEN: usize = 4;
/// Digits in the project-definition sequence (`009320`).
pub const SEQUENCE_LEN: usize = 6;
/// Fixed padding the ledger system appends to every project definition.
pub const LEDGER_SUFFIX: &str = "00000";
pub const CANONICAL_LEN: usize = PREFIX_LEN + SEQUENCE_LEN + LEDGER_SUFFIX.len();

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("empty project identifier")]
    Empty,
    #[error("`{0}` must have exactly one `-` between prefix and sequence")]
    SegmentCount(String),
    #[error("`{0}` prefix must be 4 ASCII letters")]
    Prefix(String),
    #[error("`{0}` sequence must be 6 digits")]
    Sequence(String),
    #[error("`{0}` is not a 15-character ledger identifier ending in 00000")]
    Canonical(String),
}

/// Project identifier in the fixed-width form the purchase-order ledger uses.
///
/// The registry writes `USFC-009320`; the ledger writes `USFC00932000000`. The only way
/// to build one is through validated parsing of either surface form, so a malformed id
/// can never become a join key that silently matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalProjectId(String);

impl CanonicalProjectId {
    pub fn from_dashed(input: &str) -> Result<Self, IdentifierError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }
        let mut parts = trimmed.split('-');
        let (Some(prefix), Some(sequence), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(IdentifierError::SegmentCount(trimmed.to_string()));
        };
        if prefix.len() != PREFIX_LEN || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(IdentifierError::Prefix(trimmed.to_string()));
        }
        if sequence.len() != SEQUENCE_LEN || !sequence.chars().all(|c| c.is_ascii_digit()) {
            return Err(IdentifierError::Sequence(trimmed.to_string()));
        }
        Ok(Self(format!(
            "{}{}{}",
            prefix.to_ascii_uppercase(),
            sequence,
            LEDGER_SUFFIX
        )))
    }

    pub fn from_canonical(input: &str) -> Result<Self, IdentifierError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }
        let well_formed = trimmed.len() == CANONICAL_LEN
            && trimmed.is_ascii()
            && trimmed[..PREFIX_LEN].chars().all(|c| c.is_ascii_alphabetic())
            && trimmed[PREFIX_LEN..PREFIX_LEN + SEQUENCE_LEN]
                .chars()
                .all(|c| c.is_ascii_digit())
            && trimmed.ends_with(LEDGER_SUFFIX);
        if !well_formed {
            return Err(IdentifierError::Canonical(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Registry surface form, e.g. `USFC-009320`.
    pub fn dashed(&self) -> String {
        format!(
            "{}-{}",
            &self.0[..PREFIX_LEN],
            &self.0[PREFIX_LEN..PREFIX_LEN + SEQUENCE_LEN]
        )
    }
}

impl fmt::Display for CanonicalProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CanonicalProjectId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_canonical(&value)
    }
}

impl From<CanonicalProjectId> for String {
    fn from(value: CanonicalProjectId) -> Self {
        value.0
    }
}

/// Derived classification of a single ledger row. Never read from the source data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineKind {
    Commitment,
    Invoice,
    Mixed,
    Empty,
}

impl LineKind {
    pub fn classify(ordered_amount: f64, invoiced_amount: f64) -> Self {
        match (ordered_amount != 0.0, invoiced_amount != 0.0) {
            (true, false) => Self::Commitment,
            (false, true) => Self::Invoice,
            (true, true) => Self::Mixed,
            (false, false) => Self::Empty,
        }
    }
}

/// Raw row contract between a warehouse connector and the reconciliation transform.
pub trait SourceRow: DeserializeOwned {
    const TABLE: &'static str;
    const REQUIRED_COLUMNS: &'static [&'static str];
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct RawProjectRow {
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub store: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub sequence: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub store_sequence: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub state: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub sap_project_definition: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub brief_scope_of_work: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub general_contractor: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub lx_gc_firm: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub store_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub created_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub construction_complete_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub pmo_sr_pm_comments: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub lucernex_updated_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub sap_actuals: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub sap_open_commitments: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_contract_amount: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub contractor_po_amount: f64,
}

impl SourceRow for RawProjectRow {
    const TABLE: &'static str = "projects";
    const REQUIRED_COLUMNS: &'static [&'static str] = &[
        "project_id",
        "project_type",
        "project_status",
        "sap_project_definition",
        "sap_actuals",
        "sap_open_commitments",
        "total_contract_amount",
    ];
}

/// One purchase-order ledger line. Ordered and invoiced amounts normally live on
/// different lines of the same PO.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct RawLedgerRow {
    #[serde(default, deserialize_with = "lenient_text")]
    pub po_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_definition: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub vendor: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub ordered_amount: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub invoiced_amount: f64,
    #[serde(default, deserialize_with = "lenient_text")]
    pub po_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub document_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub updated_at: Option<String>,
}

impl SourceRow for RawLedgerRow {
    const TABLE: &'static str = "po_ledger";
    const REQUIRED_COLUMNS: &'static [&'static str] = &[
        "po_number",
        "project_definition",
        "ordered_amount",
        "invoiced_amount",
    ];
}

/// Ledger line booked against an umbrella project definition. The project it really
/// belongs to is recovered from the store number, or from `item_text` when a vendor books
/// every line to a hub store.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct RawUmbrellaRow {
    #[serde(default, deserialize_with = "lenient_text")]
    pub po_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub store_nbr: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub item_text: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub vendor: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub ordered_amount: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub invoiced_amount: f64,
    #[serde(default, deserialize_with = "lenient_text")]
    pub po_status: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub document_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub updated_at: Option<String>,
}

impl RawUmbrellaRow {
    pub fn ledger_line(&self) -> RawLedgerRow {
        RawLedgerRow {
            po_number: self.po_number.clone(),
            project_definition: None,
            vendor: self.vendor.clone(),
            ordered_amount: self.ordered_amount,
            invoiced_amount: self.invoiced_amount,
            po_status: self.po_status.clone(),
            document_date: self.document_date.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

impl SourceRow for RawUmbrellaRow {
    const TABLE: &'static str = "umbrella_po_lines";
    const REQUIRED_COLUMNS: &'static [&'static str] = &[
        "po_number",
        "store_nbr",
        "item_text",
        "vendor",
        "ordered_amount",
        "invoiced_amount",
    ];
}

/// One project line of the capital budget report, tagged with its WBS program position.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct RawWbsRow {
    #[serde(default, deserialize_with = "lenient_text")]
    pub program_position: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub approval_year: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub program_position_desc: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub project_definition: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub original_budget: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub supplemental_budget: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub returned_budget: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub current_budget: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_actual: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_commitments: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub current_budget_available: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub distributed_budget: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub budget_cf_from_previous_fiscal_year: f64,
    #[serde(default, deserialize_with = "lenient_amount")]
    pub budget_cf_to_next_fiscal_year: f64,
}

impl SourceRow for RawWbsRow {
    const TABLE: &'static str = "wbs_budgets";
    const REQUIRED_COLUMNS: &'static [&'static str] = &[
        "program_position",
        "approval_year",
        "project_definition",
        "original_budget",
        "current_budget",
        "total_actual",
        "total_commitments",
    ];
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct RawScopeRow {
    #[serde(default, deserialize_with = "lenient_text")]
    pub sap_project_definition: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub brief_scope_of_work: Option<String>,
}

impl SourceRow for RawScopeRow {
    const TABLE: &'static str = "scope_attributes";
    const REQUIRED_COLUMNS: &'static [&'static str] =
        &["sap_project_definition", "brief_scope_of_work"];
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientScalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Warehouses hand back numbers as strings and ids as numbers; accept both.
fn lenient_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<LenientScalar>::deserialize(deserializer)? {
        None => None,
        Some(LenientScalar::Text(s)) => Some(s),
        Some(LenientScalar::Int(v)) => Some(v.to_string()),
        Some(LenientScalar::Float(v)) => Some(v.to_string()),
        Some(LenientScalar::Bool(v)) => Some(v.to_string()),
    })
}

/// Null and blank amounts count as zero. NaN and infinities are rejected.
fn lenient_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = match Option::<LenientScalar>::deserialize(deserializer)? {
        None => return Ok(0.0),
        Some(LenientScalar::Int(v)) => v as f64,
        Some(LenientScalar::Float(v)) => v,
        Some(LenientScalar::Text(s)) if s.trim().is_empty() => return Ok(0.0),
        Some(LenientScalar::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| D::Error::custom(format!("invalid amount {s:?}")))?,
        Some(LenientScalar::Bool(_)) => return Err(D::Error::custom("boolean is not an amount")),
    };
    if !value.is_finite() {
        return Err(D::Error::custom(format!("non-finite amount {value}")));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Budget {
    pub total: f64,
    pub open: f64,
    pub committed: f64,
    pub actuals: f64,
}

/// Normalized project as mirrored into the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub canonical_id: CanonicalProjectId,
    pub project_id: String,
    pub sap_project_definition: String,
    pub category: String,
    pub status: String,
    pub store: Option<String>,
    pub sequence: Option<String>,
    pub store_sequence: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub store_type: Option<String>,
    pub banner: String,
    pub general_contractor: Option<String>,
    pub scope: String,
    pub created_date: Option<String>,
    pub completion_date: Option<String>,
    pub pmo_comments: Option<String>,
    pub source_updated_at: Option<String>,
    pub budget: Budget,
}

/// Aggregate of every ledger line sharing a PO number and project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub po_number: String,
    pub project_canonical_id: CanonicalProjectId,
    pub vendor: Option<String>,
    pub ordered_total: f64,
    pub invoiced_total: f64,
    pub remaining: f64,
    pub status: Option<String>,
    pub created_date: Option<String>,
    pub last_update: Option<String>,
    pub commitment_lines: u32,
    pub invoice_lines: u32,
    pub orphaned: bool,
    pub source: PoSource,
}

/// How a purchase order was attached to its project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoSource {
    /// The ledger line carried the project definition.
    #[default]
    Ledger,
    /// Booked to the umbrella definition, matched back by store number.
    Umbrella,
    /// Cited by PO number in the project's PMO comments.
    Comment,
}

impl PoSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ledger => "ledger",
            Self::Umbrella => "umbrella",
            Self::Comment => "comment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ledger" => Some(Self::Ledger),
            "umbrella" => Some(Self::Umbrella),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }
}

impl PurchaseOrder {
    pub fn is_over_invoiced(&self) -> bool {
        self.invoiced_total > self.ordered_total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFreshness {
    pub source_key: String,
    pub source_label: String,
    pub source_last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub projects_loaded: usize,
    pub pos_loaded: usize,
    pub orphaned_pos: usize,
}

/// Budget position of one tracked WBS node for one approval year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WbsNodeBudget {
    pub node_key: String,
    pub approval_year: String,
    pub node_label: String,
    pub description: String,
    pub original_budget: f64,
    pub supplemental_budget: f64,
    pub returned_budget: f64,
    pub current_budget: f64,
    pub actuals: f64,
    pub open_commitments: f64,
    pub budget_available: f64,
    pub distributed_budget: f64,
    pub budget_cf_from_prev: f64,
    pub budget_cf_to_next: f64,
    pub project_count: u32,
    /// False for placeholder rows of nodes the report did not return.
    pub found: bool,
}

/// Complete replacement dataset produced by one sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub projects: Vec<Project>,
    pub purchase_orders: Vec<PurchaseOrder>,
    pub wbs_budgets: Vec<WbsNodeBudget>,
    pub freshness: Vec<SourceFreshness>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("{call} timed out after {seconds}s")]
    Timeout { call: String, seconds: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("warehouse rejected credentials (http {status})")]
    Auth { status: u16 },
    #[error("warehouse returned http {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected warehouse response: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{table}: expected column `{column}` is missing")]
    MissingColumn { table: String, column: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{table} row {row}: {reason}")]
pub struct ValidationError {
    pub table: String,
    pub row: usize,
    pub reason: String,
}

impl ValidationError {
    pub fn new(table: &str, row: usize, reason: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            row,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("local store write failed: {0}")]
    Write(String),
    #[error("a sync run is already in progress")]
    AlreadyRunning,
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Validation(_))
    }

    pub fn kind(&self) -> IssueKind {
        match self {
            Self::Connector(_) => IssueKind::Connector,
            Self::Validation(_) => IssueKind::Validation,
            Self::Schema(_) => IssueKind::Schema,
            Self::Write(_) => IssueKind::Write,
            Self::AlreadyRunning => IssueKind::AlreadyRunning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Connector,
    Validation,
    Schema,
    Write,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub kind: IssueKind,
    pub message: String,
    pub fatal: bool,
}

impl From<&SyncError> for SyncIssue {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub projects_loaded: usize,
    pub pos_loaded: usize,
    pub orphaned_pos: usize,
    pub errors: Vec<SyncIssue>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Completed
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| e.fatal)
    }

    /// The run was refused because another run held the guard.
    pub fn was_already_running(&self) -> bool {
        self.errors.iter().any(|e| e.kind == IssueKind::AlreadyRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashed_identifier_normalizes_to_ledger_form() {
        let id = CanonicalProjectId::from_dashed("USFC-009320").unwrap();
        assert_eq!(id.as_str(), "USFC00932000000");
        assert_eq!(id.as_str().len(), CANONICAL_LEN);
        assert_eq!(id.dashed(), "USFC-009320");
    }

    #[test]
    fn normalization_is_deterministic_and_fixed_width() {
        for raw in ["USFC-009320", " usms-001700 ", "ABCD-000000", "WXYZ-999999"] {
            let a = CanonicalProjectId::from_dashed(raw).unwrap();
            let b = CanonicalProjectId::from_dashed(raw).unwrap();
            assert_eq!(a, b);
            assert_eq!(a.as_str().len(), CANONICAL_LEN);
            assert_eq!(CanonicalProjectId::from_canonical(a.as_str()).unwrap(), a);
        }
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        assert_eq!(CanonicalProjectId::from_dashed("  "), Err(IdentifierError::Empty));
        assert!(matches!(
            CanonicalProjectId::from_dashed("USFC009320"),
            Err(IdentifierError::SegmentCount(_))
        ));
        assert!(matches!(
            CanonicalProjectId::from_dashed("USFC-0093-20"),
            Err(IdentifierError::SegmentCount(_))
        ));
        assert!(matches!(
            CanonicalProjectId::from_dashed("US1C-009320"),
            Err(IdentifierError::Prefix(_))
        ));
        assert!(matches!(
            CanonicalProjectId::from_dashed("USFC-00932A"),
            Err(IdentifierError::Sequence(_))
        ));
        assert!(matches!(
            CanonicalProjectId::from_dashed("USFC-93200"),
            Err(IdentifierError::Sequence(_))
        ));
        assert!(matches!(
            CanonicalProjectId::from_canonical("USFC00932000001"),
            Err(IdentifierError::Canonical(_))
        ));
        assert!(matches!(
            CanonicalProjectId::from_canonical("USFC-009320"),
            Err(IdentifierError::Canonical(_))
        ));
    }

    #[test]
    fn canonical_id_deserialization_validates() {
        let ok: CanonicalProjectId = serde_json::from_str("\"USFC00932000000\"").unwrap();
        assert_eq!(ok.dashed(), "USFC-009320");
        assert!(serde_json::from_str::<CanonicalProjectId>("\"USFC-009320\"").is_err());
    }

    #[test]
    fn line_kind_is_derived_from_amount_columns() {
        assert_eq!(LineKind::classify(17000.0, 0.0), LineKind::Commitment);
        assert_eq!(LineKind::classify(0.0, 8500.0), LineKind::Invoice);
        assert_eq!(LineKind::classify(10.0, 5.0), LineKind::Mixed);
        assert_eq!(LineKind::classify(0.0, 0.0), LineKind::Empty);
    }

    #[test]
    fn raw_rows_accept_string_and_null_amounts() {
        let row: RawLedgerRow = serde_json::from_value(serde_json::json!({
            "po_number": 40836460,
            "project_definition": "USFC00932000000",
            "ordered_amount": "17000.50",
            "invoiced_amount": null
        }))
        .unwrap();
        assert_eq!(row.po_number.as_deref(), Some("40836460"));
        assert_eq!(row.ordered_amount, 17000.5);
        assert_eq!(row.invoiced_amount, 0.0);
        assert!(row.vendor.is_none());

        let bad = serde_json::from_value::<RawLedgerRow>(serde_json::json!({
            "po_number": "1",
            "ordered_amount": "twelve"
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn non_finite_amounts_are_rejected() {
        for raw in ["NaN", "inf", "-inf", "infinity"] {
            let row = serde_json::from_value::<RawLedgerRow>(serde_json::json!({
                "po_number": "1",
                "project_definition": "USFC00932000000",
                "ordered_amount": raw
            }));
            assert!(row.is_err(), "{raw} should not decode");
        }
    }

    #[test]
    fn only_validation_errors_are_non_fatal() {
        let validation = SyncError::from(ValidationError::new("projects", 3, "bad id"));
        assert!(!validation.is_fatal());
        let issue = SyncIssue::from(&validation);
        assert_eq!(issue.kind, IssueKind::Validation);
        assert_eq!(issue.message, "projects row 3: bad id");

        let schema = SyncError::from(SchemaError::MissingColumn {
            table: "po_ledger".into(),
            column: "ordered_amount".into(),
        });
        assert!(schema.is_fatal());
        assert!(SyncError::AlreadyRunning.is_fatal());
        assert!(SyncError::Connector(ConnectorError::Network("reset".into())).is_fatal());
    }
}
