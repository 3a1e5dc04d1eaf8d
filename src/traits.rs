//! Traits for storage abstraction and the engine's external collaborators

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::*;

/// Precondition attached to every conditional write.
///
/// A backend must apply the write only when the record exists, is not soft
/// deleted, carries `expected_token` and, if given, `expected_status`. The
/// comparison has to happen atomically inside the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCondition {
    pub id: Uuid,
    pub expected_token: ConcurrencyToken,
    pub expected_status: Option<RowStatus>,
}

impl WriteCondition {
    pub fn new(id: Uuid, expected_token: ConcurrencyToken) -> Self {
        Self {
            id,
            expected_token,
            expected_status: None,
        }
    }

    pub fn in_status(mut self, status: RowStatus) -> Self {
        self.expected_status = Some(status);
        self
    }
}

/// What to do with the confirmer stamp on a status write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmStamp {
    Keep,
    Set(AuditStamp),
    Clear,
}

/// Mutations allowed on a header
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderChange {
    Fields {
        business_date: NaiveDate,
        description: String,
        department_id: Uuid,
        modified: AuditStamp,
    },
    Status {
        status: RowStatus,
        confirmed: ConfirmStamp,
    },
    SoftDelete(AuditStamp),
}

/// Mutations allowed on a row
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Payload {
        payload: RowPayload,
        modified: AuditStamp,
    },
    Status {
        status: RowStatus,
        confirmed: ConfirmStamp,
        /// Fresh upstream token to cache in the row's source link
        link_token: Option<ConcurrencyToken>,
    },
    SoftDelete(AuditStamp),
}

/// Storage abstraction for the voucher engine
///
/// All mutations go through a [`StorageTransaction`]; the reads here see
/// committed state only.
#[async_trait]
pub trait VoucherStorage: Send + Sync {
    /// Open a transaction. Dropping it without commit discards its writes.
    async fn begin(&self) -> VoucherResult<Box<dyn StorageTransaction>>;

    /// Get a voucher with all rows and attachments, soft-deleted ones included
    async fn get_voucher(&self, header_id: Uuid) -> VoucherResult<Option<Voucher>>;

    /// Get a master record by ID
    async fn get_master(&self, id: Uuid) -> VoucherResult<Option<MasterRecord>>;
}

/// One open unit of work against the store.
///
/// Conditional writes return the freshly minted token, or `None` when the
/// precondition matched zero records. Callers treat `None` as a conflict.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn load_header(&mut self, id: Uuid) -> VoucherResult<Option<VoucherHeader>>;

    /// All rows of a header ordered by row number, soft-deleted ones included
    async fn load_rows(&mut self, header_id: Uuid) -> VoucherResult<Vec<VoucherRow>>;

    async fn load_row(&mut self, id: Uuid) -> VoucherResult<Option<VoucherRow>>;

    /// Live attachments of a row
    async fn load_attachments(&mut self, row_id: Uuid) -> VoucherResult<Vec<Attachment>>;

    async fn load_attachment(&mut self, id: Uuid) -> VoucherResult<Option<Attachment>>;

    async fn load_master(&mut self, id: Uuid) -> VoucherResult<Option<MasterRecord>>;

    /// Insert a header; the stored token is minted by the backend and returned
    async fn insert_header(&mut self, header: VoucherHeader) -> VoucherResult<ConcurrencyToken>;

    async fn insert_row(&mut self, row: VoucherRow) -> VoucherResult<ConcurrencyToken>;

    async fn insert_attachment(&mut self, attachment: Attachment)
        -> VoucherResult<ConcurrencyToken>;

    async fn insert_master(&mut self, record: MasterRecord) -> VoucherResult<ConcurrencyToken>;

    async fn update_header(
        &mut self,
        condition: &WriteCondition,
        change: HeaderChange,
    ) -> VoucherResult<Option<ConcurrencyToken>>;

    async fn update_row(
        &mut self,
        condition: &WriteCondition,
        change: RowChange,
    ) -> VoucherResult<Option<ConcurrencyToken>>;

    async fn delete_attachment(
        &mut self,
        condition: &WriteCondition,
        stamp: AuditStamp,
    ) -> VoucherResult<Option<ConcurrencyToken>>;

    async fn delete_master(
        &mut self,
        condition: &WriteCondition,
        stamp: AuditStamp,
    ) -> VoucherResult<Option<ConcurrencyToken>>;

    /// Atomically read-increment-return the next sequence for (type, date).
    ///
    /// Must hold a lock on the counter until the transaction ends so that no
    /// two committing transactions observe the same value.
    async fn next_serial(&mut self, type_code: &str, date_key: &str) -> VoucherResult<u64>;

    /// Count live records matching a reference probe
    async fn count_references(&mut self, probe: ReferenceProbe, id: Uuid) -> VoucherResult<u64>;

    async fn commit(self: Box<Self>) -> VoucherResult<()>;

    async fn rollback(self: Box<Self>) -> VoucherResult<()>;
}

/// Descriptive attributes of a master record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub kind: MasterKind,
    pub display_name: String,
}

/// Backing store for identity lookups
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn fetch_identity(&self, id: Uuid) -> VoucherResult<Option<Identity>>;
}

/// Cached-or-fetched identity lookup. Never mutates voucher state.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn lookup(&self, id: Uuid) -> VoucherResult<Option<Identity>>;

    /// Drop any cached entry; called on the entity's own write path
    fn invalidate(&self, id: Uuid);
}

/// Resolves a file reference to a retrievable URL, for display only
pub trait AttachmentLocator: Send + Sync {
    fn locate(&self, file_id: Uuid) -> Option<String>;
}

/// Maps an error kind to a user-facing string
pub trait MessageCatalog: Send + Sync {
    fn message(&self, kind: ErrorKind, locale: &str) -> Option<String>;
}

/// Trait for implementing custom voucher validation rules
pub trait VoucherValidator: Send + Sync {
    /// Validate header-level fields before they are written
    fn validate_header(&self, kind: VoucherKind, description: &str) -> VoucherResult<()>;

    /// Validate a row payload before it is written
    fn validate_payload(&self, kind: VoucherKind, payload: &RowPayload) -> VoucherResult<()>;
}

/// Default validator: payload type must match the voucher type
pub struct DefaultVoucherValidator;

impl VoucherValidator for DefaultVoucherValidator {
    fn validate_header(&self, _kind: VoucherKind, description: &str) -> VoucherResult<()> {
        if description.trim().is_empty() {
            return Err(VoucherError::Validation(
                "Voucher description cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_payload(&self, kind: VoucherKind, payload: &RowPayload) -> VoucherResult<()> {
        if payload.kind() != kind {
            return Err(VoucherError::Validation(format!(
                "A {} line cannot be stored in a {}",
                payload.kind(),
                kind
            )));
        }
        Ok(())
    }
}
