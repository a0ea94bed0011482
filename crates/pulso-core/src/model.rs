//! Relational domain model: tenants, connections, source tracking, the raw
//! commerce and legislative verticals, and the derived entities computed
//! from them.
//!
//! Upserts everywhere key on `(tenant_id, external_id)` — the sole
//! idempotency key. Every raw entity back-references the `SourceRef` that
//! produced its latest version, and each `SourceRef` back-references its
//! `IngestionRun`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenant seeded by the initial migration that owns all public-sector
/// (legislative) rows. Civic ingestion runs under this scope.
pub const PUBLIC_TENANT_ID: Uuid = Uuid::from_u128(0x0000_0000_0000_4000_8000_0000_0000_c1b1);

// ---------------------------------------------------------------------------
// Tenancy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(PlanTier::Free),
            "pro" => Some(PlanTier::Pro),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub plan: PlanTier,
    pub solve_count: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }

    /// Connection state machine: `pending → syncing → synced → {syncing,
    /// error}`; `error → syncing` is always allowed.
    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing)
                | (Syncing, Synced)
                | (Syncing, Error)
                | (Synced, Syncing)
                | (Synced, Error)
                | (Error, Syncing)
        )
    }
}

/// Binding of a tenant to one external source. The access token is a
/// secret: it is read by workers and never serialized into API responses
/// or logs (note the absent `Serialize` derive).
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub shop_domain: String,
    pub access_token: String,
    pub scopes: Vec<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub products_count: i32,
    pub orders_count: i32,
    pub signature_failures: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Source tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Products,
    Orders,
    Inventory,
    Legislators,
    Bills,
    Votes,
    Attendance,
    Sessions,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Products => "products",
            DataType::Orders => "orders",
            DataType::Inventory => "inventory",
            DataType::Legislators => "legislators",
            DataType::Bills => "bills",
            DataType::Votes => "votes",
            DataType::Attendance => "attendance",
            DataType::Sessions => "sessions",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "products" => Some(DataType::Products),
            "orders" => Some(DataType::Orders),
            "inventory" => Some(DataType::Inventory),
            "legislators" => Some(DataType::Legislators),
            "bills" => Some(DataType::Bills),
            "votes" => Some(DataType::Votes),
            "attendance" => Some(DataType::Attendance),
            "sessions" => Some(DataType::Sessions),
            _ => None,
        }
    }

    pub fn commerce_types() -> [DataType; 3] {
        [DataType::Products, DataType::Orders, DataType::Inventory]
    }

    pub fn civic_types() -> [DataType; 5] {
        [
            DataType::Legislators,
            DataType::Bills,
            DataType::Votes,
            DataType::Attendance,
            DataType::Sessions,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRefStatus {
    Ok,
    Error,
}

impl SourceRefStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceRefStatus::Ok => "ok",
            SourceRefStatus::Error => "error",
        }
    }
}

/// Append-only audit record of one raw fetch.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRef {
    pub id: Uuid,
    pub ingestion_run_id: Uuid,
    pub source_key: String,
    pub data_type: DataType,
    pub checksum: String,
    pub blob_location: String,
    pub fetched_at: DateTime<Utc>,
    pub status: SourceRefStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// One invocation of one adapter, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub source_name: String,
    pub data_type: DataType,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_processed: i32,
    pub records_skipped: i32,
    pub records_errored: i32,
    pub error_detail: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Commerce vertical
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub external_id: String,
    pub title: Option<String>,
    pub sku: Option<String>,
    pub price: Option<f64>,
    pub unit_cost: Option<f64>,
    pub inventory_quantity: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub vendor: Option<String>,
    pub variants: Vec<ProductVariant>,
    pub unit_cost: Option<f64>,
    pub price: Option<f64>,
    /// Sum of the variants' quantities at upsert time.
    pub inventory_quantity: i64,
    pub tags: Vec<String>,
    pub source_ref_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub product_external_id: Option<String>,
    pub variant_external_id: Option<String>,
    pub title: String,
    pub quantity: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub ordinal: i64,
    pub total: f64,
    pub currency: Option<String>,
    pub status: String,
    pub line_items: Vec<OrderLineItem>,
    pub customer_email: Option<String>,
    pub order_date: DateTime<Utc>,
    pub source_ref_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryLevel {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub variant_external_id: String,
    pub location_external_id: String,
    pub quantity: i64,
    pub source_ref_id: Uuid,
}

// ---------------------------------------------------------------------------
// Legislative vertical
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chamber {
    Deputies,
    Senate,
}

impl Chamber {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chamber::Deputies => "deputies",
            Chamber::Senate => "senate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deputies" => Some(Chamber::Deputies),
            "senate" => Some(Chamber::Senate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Legislator {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub first_name: String,
    pub last_name: String,
    pub block: Option<String>,
    pub province: Option<String>,
    pub active: bool,
    pub chamber: Chamber,
    pub term_start: Option<NaiveDate>,
    pub term_end: Option<NaiveDate>,
    pub source_ref_id: Uuid,
}

/// Bill progression. `rank` orders the linear path; the normaliser only
/// ever advances a bill's current status along it. The four parallel
/// terminal states sit outside the linear path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Presented,
    InCommittee,
    WithOpinion,
    ApprovedCommittee,
    FloorVote,
    ApprovedChamber,
    SentToOtherChamber,
    Approved,
    Rejected,
    Withdrawn,
    Expired,
    Archived,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Presented => "PRESENTED",
            BillStatus::InCommittee => "IN_COMMITTEE",
            BillStatus::WithOpinion => "WITH_OPINION",
            BillStatus::ApprovedCommittee => "APPROVED_COMMITTEE",
            BillStatus::FloorVote => "FLOOR_VOTE",
            BillStatus::ApprovedChamber => "APPROVED_CHAMBER",
            BillStatus::SentToOtherChamber => "SENT_TO_OTHER_CHAMBER",
            BillStatus::Approved => "APPROVED",
            BillStatus::Rejected => "REJECTED",
            BillStatus::Withdrawn => "WITHDRAWN",
            BillStatus::Expired => "EXPIRED",
            BillStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PRESENTED" => Some(BillStatus::Presented),
            "IN_COMMITTEE" => Some(BillStatus::InCommittee),
            "WITH_OPINION" => Some(BillStatus::WithOpinion),
            "APPROVED_COMMITTEE" => Some(BillStatus::ApprovedCommittee),
            "FLOOR_VOTE" => Some(BillStatus::FloorVote),
            "APPROVED_CHAMBER" => Some(BillStatus::ApprovedChamber),
            "SENT_TO_OTHER_CHAMBER" => Some(BillStatus::SentToOtherChamber),
            "APPROVED" => Some(BillStatus::Approved),
            "REJECTED" => Some(BillStatus::Rejected),
            "WITHDRAWN" => Some(BillStatus::Withdrawn),
            "EXPIRED" => Some(BillStatus::Expired),
            "ARCHIVED" => Some(BillStatus::Archived),
            _ => None,
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            BillStatus::Presented => Some(0),
            BillStatus::InCommittee => Some(1),
            BillStatus::WithOpinion => Some(2),
            BillStatus::ApprovedCommittee => Some(3),
            BillStatus::FloorVote => Some(4),
            BillStatus::ApprovedChamber => Some(5),
            BillStatus::SentToOtherChamber => Some(6),
            BillStatus::Approved => Some(7),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BillStatus::Approved
                | BillStatus::Rejected
                | BillStatus::Withdrawn
                | BillStatus::Expired
                | BillStatus::Archived
        )
    }

    /// Whether a movement to `next` should update a bill currently at
    /// `self`. A `to_status` earlier than the current status is recorded in
    /// history but does not move the bill. Terminal states always land.
    pub fn advances_to(&self, next: BillStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(cur), Some(nxt)) => nxt > cur,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Bill {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub title: String,
    pub status: BillStatus,
    pub bill_type: Option<String>,
    pub presented_date: Option<NaiveDate>,
    pub period: i32,
    pub source_ref_id: Uuid,
}

/// Ordered history entry. `order_index` is contiguous from 0 per bill and
/// dense in insertion order; it is the only total order exposed.
#[derive(Debug, Clone, Serialize)]
pub struct BillMovement {
    pub id: Uuid,
    pub bill_id: Uuid,
    pub order_index: i32,
    pub description: String,
    pub from_status: Option<BillStatus>,
    pub to_status: Option<BillStatus>,
    pub movement_date: NaiveDate,
    pub source_ref_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthorRole {
    Author,
    Coauthor,
}

impl AuthorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorRole::Author => "AUTHOR",
            AuthorRole::Coauthor => "COAUTHOR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AUTHOR" => Some(AuthorRole::Author),
            "COAUTHOR" => Some(AuthorRole::Coauthor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BillAuthor {
    pub bill_id: Uuid,
    pub legislator_id: Uuid,
    pub role: AuthorRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoteChoice {
    Affirm,
    Neg,
    Abst,
    Absent,
}

impl VoteChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteChoice::Affirm => "AFFIRM",
            VoteChoice::Neg => "NEG",
            VoteChoice::Abst => "ABST",
            VoteChoice::Absent => "ABSENT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "AFFIRM" => Some(VoteChoice::Affirm),
            "NEG" => Some(VoteChoice::Neg),
            "ABST" => Some(VoteChoice::Abst),
            "ABSENT" => Some(VoteChoice::Absent),
            _ => None,
        }
    }
}

/// Tallies are overwritten from the payload, not recomputed locally; the
/// feed is the authoritative source.
#[derive(Debug, Clone, Serialize)]
pub struct VoteEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub session_external_id: Option<String>,
    pub title: String,
    pub affirmative: i32,
    pub negative: i32,
    pub abstentions: i32,
    pub absent: i32,
    pub result: Option<String>,
    pub vote_date: Option<NaiveDate>,
    pub source_ref_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteResult {
    pub vote_event_id: Uuid,
    pub legislator_id: Uuid,
    pub vote: VoteChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Justified,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "PRESENT",
            AttendanceStatus::Absent => "ABSENT",
            AttendanceStatus::Justified => "JUSTIFIED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PRESENT" => Some(AttendanceStatus::Present),
            "ABSENT" => Some(AttendanceStatus::Absent),
            "JUSTIFIED" => Some(AttendanceStatus::Justified),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub session_date: NaiveDate,
    pub chamber: Chamber,
    pub source_ref_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attendance {
    pub session_id: Uuid,
    pub legislator_id: Uuid,
    pub status: AttendanceStatus,
}

/// Commission memberships are partially seeded; no live source is wired.
/// The schema is kept so `commissions_count` reads whatever exists.
#[derive(Debug, Clone, Serialize)]
pub struct Commission {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Derived entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalysisModule {
    Margin,
    Stock,
    Forecast,
    Cashflow,
}

impl AnalysisModule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisModule::Margin => "MARGIN",
            AnalysisModule::Stock => "STOCK",
            AnalysisModule::Forecast => "FORECAST",
            AnalysisModule::Cashflow => "CASHFLOW",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "MARGIN" => Some(AnalysisModule::Margin),
            "STOCK" => Some(AnalysisModule::Stock),
            "FORECAST" => Some(AnalysisModule::Forecast),
            "CASHFLOW" => Some(AnalysisModule::Cashflow),
            _ => None,
        }
    }

    pub fn all() -> [AnalysisModule; 4] {
        [
            AnalysisModule::Margin,
            AnalysisModule::Stock,
            AnalysisModule::Forecast,
            AnalysisModule::Cashflow,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    Manual,
    ShopifyAuto,
    ManualWithSource,
}

impl AnalysisSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSource::Manual => "manual",
            AnalysisSource::ShopifyAuto => "shopify_auto",
            AnalysisSource::ManualWithSource => "manual_with_source",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub module: AnalysisModule,
    pub input_snapshot: serde_json::Value,
    pub output_snapshot: serde_json::Value,
    pub insight: Option<String>,
    pub source: AnalysisSource,
    pub created_at: DateTime<Utc>,
}

/// One row per `(legislator, period)`; scalar columns are last-writer-wins
/// so concurrent recomputations converge.
#[derive(Debug, Clone, Serialize)]
pub struct LegislatorMetric {
    pub legislator_id: Uuid,
    pub period: i32,
    pub bills_authored: i32,
    pub bills_cosigned: i32,
    pub bills_with_advancement: i32,
    pub advancement_rate: f64,
    pub attendance_rate: f64,
    pub vote_participation_rate: f64,
    pub commissions_count: i32,
    pub months_in_office: i32,
    pub normalised_productivity: f64,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_machine() {
        use SyncStatus::*;
        assert!(Pending.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Syncing.can_transition_to(Error));
        assert!(Synced.can_transition_to(Syncing));
        assert!(Error.can_transition_to(Syncing));
        assert!(!Pending.can_transition_to(Synced));
        assert!(!Error.can_transition_to(Synced));
    }

    #[test]
    fn bill_status_only_advances() {
        assert!(BillStatus::Presented.advances_to(BillStatus::InCommittee));
        assert!(BillStatus::InCommittee.advances_to(BillStatus::FloorVote));
        assert!(!BillStatus::FloorVote.advances_to(BillStatus::InCommittee));
        assert!(!BillStatus::Presented.advances_to(BillStatus::Presented));
    }

    #[test]
    fn terminal_bill_states_always_land_and_stick() {
        assert!(BillStatus::Presented.advances_to(BillStatus::Withdrawn));
        assert!(BillStatus::SentToOtherChamber.advances_to(BillStatus::Rejected));
        assert!(!BillStatus::Approved.advances_to(BillStatus::FloorVote));
        assert!(!BillStatus::Rejected.advances_to(BillStatus::Approved));
    }

    #[test]
    fn enum_string_round_trips() {
        for status in [
            BillStatus::Presented,
            BillStatus::ApprovedCommittee,
            BillStatus::SentToOtherChamber,
            BillStatus::Archived,
        ] {
            assert_eq!(BillStatus::parse(status.as_str()), Some(status));
        }
        for choice in [
            VoteChoice::Affirm,
            VoteChoice::Neg,
            VoteChoice::Abst,
            VoteChoice::Absent,
        ] {
            assert_eq!(VoteChoice::parse(choice.as_str()), Some(choice));
        }
        assert_eq!(DataType::parse("products"), Some(DataType::Products));
        assert_eq!(DataType::parse("nope"), None);
    }

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
