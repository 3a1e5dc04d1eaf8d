//! Core types and data structures for the voucher lifecycle engine

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque per-record version stamp.
///
/// Every successful write mints a strictly larger token; a write carrying any
/// other token than the stored one is rejected as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConcurrencyToken(u64);

impl ConcurrencyToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Row (and derived header) progress through the document lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RowStatus {
    /// Draft; the only status in which Edit and Delete are allowed
    Free = 0,
    /// Signed off by a confirmer
    Confirmed = 1,
    /// A downstream document (or a started training) is acting on the row
    Executing = 2,
    /// The downstream work has been confirmed
    Completed = 3,
}

impl RowStatus {
    /// Stable numeric code used by storage backends
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RowStatus::Free),
            1 => Some(RowStatus::Confirmed),
            2 => Some(RowStatus::Executing),
            3 => Some(RowStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RowStatus::Free => "Free",
            RowStatus::Confirmed => "Confirmed",
            RowStatus::Executing => "Executing",
            RowStatus::Completed => "Completed",
        };
        f.write_str(name)
    }
}

/// Which statuses a voucher type actually uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    /// Free and Confirmed only
    TwoStage,
    /// Free, Confirmed, Executing and Completed
    FourStage,
}

impl Lifecycle {
    pub fn permits(self, status: RowStatus) -> bool {
        match self {
            Lifecycle::TwoStage => status <= RowStatus::Confirmed,
            Lifecycle::FourStage => true,
        }
    }
}

/// Document types handled by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoucherKind {
    /// Safety work order raised against a site
    WorkOrder,
    /// Execution order spawned from work order lines
    ExecutionOrder,
    /// Issue resolution form spawned from execution order lines
    IssueResolution,
    /// Training record, single tier
    Training,
}

impl VoucherKind {
    /// Prefix used when minting bill numbers
    pub const fn type_code(self) -> &'static str {
        match self {
            VoucherKind::WorkOrder => "WO",
            VoucherKind::ExecutionOrder => "EO",
            VoucherKind::IssueResolution => "IR",
            VoucherKind::Training => "TR",
        }
    }

    /// The document type whose rows this type's rows may be generated from
    pub const fn upstream(self) -> Option<VoucherKind> {
        match self {
            VoucherKind::ExecutionOrder => Some(VoucherKind::WorkOrder),
            VoucherKind::IssueResolution => Some(VoucherKind::ExecutionOrder),
            VoucherKind::WorkOrder | VoucherKind::Training => None,
        }
    }

    pub const fn lifecycle(self) -> Lifecycle {
        match self {
            VoucherKind::IssueResolution => Lifecycle::TwoStage,
            _ => Lifecycle::FourStage,
        }
    }
}

impl fmt::Display for VoucherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VoucherKind::WorkOrder => "work order",
            VoucherKind::ExecutionOrder => "execution order",
            VoucherKind::IssueResolution => "issue resolution form",
            VoucherKind::Training => "training record",
        };
        f.write_str(name)
    }
}

/// Who did something, and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStamp {
    pub by: Uuid,
    pub at: NaiveDateTime,
}

impl AuditStamp {
    pub fn now(by: Uuid) -> Self {
        Self {
            by,
            at: chrono::Utc::now().naive_utc(),
        }
    }
}

/// Reference from a downstream row to the upstream row that generated it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLink {
    pub source_kind: VoucherKind,
    pub source_header_id: Uuid,
    pub source_row_id: Uuid,
    /// Upstream row token as last observed by this link
    pub source_row_token: ConcurrencyToken,
}

impl SourceLink {
    /// Build a link from a fetched upstream row
    pub fn to_row(source_kind: VoucherKind, row: &VoucherRow) -> Self {
        Self {
            source_kind,
            source_header_id: row.header_id,
            source_row_id: row.id,
            source_row_token: row.token,
        }
    }
}

/// Work order line: one hazard found on site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrderLine {
    pub hazard: String,
    pub rectification: String,
    pub responsible_person_id: Uuid,
    pub risk_level_id: Uuid,
    pub deadline: NaiveDate,
}

/// Execution order line: the measure taken against a work order line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLine {
    pub measure: String,
    pub executor_id: Uuid,
    pub planned_finish: NaiveDate,
}

/// Issue resolution line: verification of an executed measure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLine {
    pub note: String,
    pub verifier_id: Uuid,
    pub cost: BigDecimal,
}

/// Training line: one trainee in a training session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLine {
    pub trainee_id: Uuid,
    pub topic: String,
    pub hours: BigDecimal,
    pub passed: bool,
}

/// Voucher-type specific row payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowPayload {
    WorkOrder(WorkOrderLine),
    ExecutionOrder(ExecutionLine),
    IssueResolution(ResolutionLine),
    Training(TrainingLine),
}

impl RowPayload {
    pub fn kind(&self) -> VoucherKind {
        match self {
            RowPayload::WorkOrder(_) => VoucherKind::WorkOrder,
            RowPayload::ExecutionOrder(_) => VoucherKind::ExecutionOrder,
            RowPayload::IssueResolution(_) => VoucherKind::IssueResolution,
            RowPayload::Training(_) => VoucherKind::Training,
        }
    }

    /// The person this line is assigned to
    pub fn person_id(&self) -> Uuid {
        match self {
            RowPayload::WorkOrder(line) => line.responsible_person_id,
            RowPayload::ExecutionOrder(line) => line.executor_id,
            RowPayload::IssueResolution(line) => line.verifier_id,
            RowPayload::Training(line) => line.trainee_id,
        }
    }

    pub fn risk_level_id(&self) -> Option<Uuid> {
        match self {
            RowPayload::WorkOrder(line) => Some(line.risk_level_id),
            _ => None,
        }
    }
}

/// Document-level record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherHeader {
    pub id: Uuid,
    pub kind: VoucherKind,
    /// Human-readable serial, e.g. `WO202403150007`
    pub bill_number: String,
    pub business_date: NaiveDate,
    pub description: String,
    pub department_id: Uuid,
    /// Derived from the live rows
    pub status: RowStatus,
    pub token: ConcurrencyToken,
    pub created: AuditStamp,
    pub confirmed: Option<AuditStamp>,
    pub modified: Option<AuditStamp>,
    pub deleted: Option<AuditStamp>,
    pub soft_deleted: bool,
}

/// Line item of a voucher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherRow {
    pub id: Uuid,
    pub header_id: Uuid,
    /// Stable ordering key, unique within the header and never reused
    pub row_no: u32,
    pub payload: RowPayload,
    pub status: RowStatus,
    pub token: ConcurrencyToken,
    pub confirmed: Option<AuditStamp>,
    pub modified: Option<AuditStamp>,
    pub deleted: Option<AuditStamp>,
    pub soft_deleted: bool,
    pub source: Option<SourceLink>,
}

/// File linked to a voucher row, versioned independently of the row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub parent_row_id: Uuid,
    pub parent_header_id: Uuid,
    pub file_id: Uuid,
    pub token: ConcurrencyToken,
    pub created: AuditStamp,
    pub deleted: Option<AuditStamp>,
    pub soft_deleted: bool,
}

/// A header with all of its rows and attachments (deleted ones included)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub header: VoucherHeader,
    pub rows: Vec<VoucherRow>,
    pub attachments: Vec<Attachment>,
}

impl Voucher {
    pub fn live_rows(&self) -> impl Iterator<Item = &VoucherRow> {
        self.rows.iter().filter(|row| !row.soft_deleted)
    }

    pub fn row(&self, row_id: Uuid) -> Option<&VoucherRow> {
        self.rows.iter().find(|row| row.id == row_id)
    }

    /// Row by its row number
    pub fn row_no(&self, row_no: u32) -> Option<&VoucherRow> {
        self.rows.iter().find(|row| row.row_no == row_no)
    }

    pub fn live_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| !a.soft_deleted)
    }

    /// Snapshot of the tokens a client would hold after fetching this voucher
    pub fn tokens(&self) -> TokenSet {
        TokenSet::from(self)
    }
}

/// Client-held tokens for a header and its live rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub header: ConcurrencyToken,
    pub rows: BTreeMap<Uuid, ConcurrencyToken>,
}

impl From<&Voucher> for TokenSet {
    fn from(voucher: &Voucher) -> Self {
        Self {
            header: voucher.header.token,
            rows: voucher
                .live_rows()
                .map(|row| (row.id, row.token))
                .collect(),
        }
    }
}

/// Shared master data referenced by vouchers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MasterKind {
    Department,
    Person,
    File,
    RiskLevel,
}

/// Minimal master data record; full CRUD lives outside the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: Uuid,
    pub kind: MasterKind,
    pub name: String,
    pub token: ConcurrencyToken,
    pub created: AuditStamp,
    pub deleted: Option<AuditStamp>,
    pub soft_deleted: bool,
}

/// Per (type, date) sequence state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialCounter {
    pub voucher_type_code: String,
    pub date_key: String,
    pub next_sequence: u64,
}

/// Entities a usage guard can protect from deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardedEntity {
    Department,
    Person,
    File,
    RiskLevel,
    WorkOrder,
    ExecutionOrder,
}

impl GuardedEntity {
    /// Guard to run before deleting a voucher of the given kind, if any
    pub const fn for_voucher(kind: VoucherKind) -> Option<Self> {
        match kind {
            VoucherKind::WorkOrder => Some(GuardedEntity::WorkOrder),
            VoucherKind::ExecutionOrder => Some(GuardedEntity::ExecutionOrder),
            VoucherKind::IssueResolution | VoucherKind::Training => None,
        }
    }
}

impl From<MasterKind> for GuardedEntity {
    fn from(kind: MasterKind) -> Self {
        match kind {
            MasterKind::Department => GuardedEntity::Department,
            MasterKind::Person => GuardedEntity::Person,
            MasterKind::File => GuardedEntity::File,
            MasterKind::RiskLevel => GuardedEntity::RiskLevel,
        }
    }
}

impl fmt::Display for GuardedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardedEntity::Department => "department",
            GuardedEntity::Person => "person",
            GuardedEntity::File => "file",
            GuardedEntity::RiskLevel => "risk level",
            GuardedEntity::WorkOrder => "work order",
            GuardedEntity::ExecutionOrder => "execution order",
        };
        f.write_str(name)
    }
}

/// A foreign-key probe evaluated against live records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceProbe {
    /// Live headers of the kind whose department matches
    HeaderDepartment(VoucherKind),
    /// Live rows of the kind whose assigned person matches
    RowPerson(VoucherKind),
    /// Live rows of the kind whose risk level matches
    RowRiskLevel(VoucherKind),
    /// Live rows of the kind whose source link points at the header
    RowSourceHeader(VoucherKind),
    /// Live attachments pointing at the file
    AttachmentFile,
}

/// Record class named in conflict and editability errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Header,
    Row,
    Attachment,
    Master,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Header => "header",
            EntityKind::Row => "row",
            EntityKind::Attachment => "attachment",
            EntityKind::Master => "master record",
        };
        f.write_str(name)
    }
}

/// Fieldless error classification handed to transports and message catalogs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Conflict,
    NotEditable,
    GuardViolation,
    InUse,
    EmptyBody,
    Validation,
    NotFound,
    Internal,
}

/// Errors that can occur in the voucher engine
#[derive(Debug, thiserror::Error)]
pub enum VoucherError {
    #[error("Concurrency conflict on {entity} {id}")]
    Conflict { entity: EntityKind, id: Uuid },
    #[error("{entity} {id} is not editable in status {status}")]
    NotEditable {
        entity: EntityKind,
        id: Uuid,
        status: RowStatus,
    },
    #[error("Guard violation on {id}: {reason}")]
    GuardViolation { id: Uuid, reason: String },
    #[error("{entity} {id} is still referenced by {referenced_by}")]
    InUse {
        entity: GuardedEntity,
        id: Uuid,
        referenced_by: &'static str,
    },
    #[error("A {kind} must contain at least one live row")]
    EmptyBody { kind: VoucherKind },
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Voucher not found: {0}")]
    NotFound(Uuid),
    #[error("Storage error: {0}")]
    Internal(String),
}

impl VoucherError {
    pub fn conflict(entity: EntityKind, id: Uuid) -> Self {
        VoucherError::Conflict { entity, id }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VoucherError::Conflict { .. } => ErrorKind::Conflict,
            VoucherError::NotEditable { .. } => ErrorKind::NotEditable,
            VoucherError::GuardViolation { .. } => ErrorKind::GuardViolation,
            VoucherError::InUse { .. } => ErrorKind::InUse,
            VoucherError::EmptyBody { .. } => ErrorKind::EmptyBody,
            VoucherError::Validation(_) => ErrorKind::Validation,
            VoucherError::NotFound(_) => ErrorKind::NotFound,
            VoucherError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for voucher operations
pub type VoucherResult<T> = Result<T, VoucherError>;
