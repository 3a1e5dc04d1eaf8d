//! In-memory storage implementation for testing and development

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::traits::*;
use crate::types::*;

#[derive(Debug, Clone, Default)]
struct Tables {
    headers: HashMap<Uuid, VoucherHeader>,
    rows: HashMap<Uuid, VoucherRow>,
    attachments: HashMap<Uuid, Attachment>,
    masters: HashMap<Uuid, MasterRecord>,
    serials: HashMap<(String, String), SerialCounter>,
}

impl Tables {
    fn voucher(&self, header_id: Uuid) -> Option<Voucher> {
        let header = self.headers.get(&header_id)?.clone();
        let mut rows: Vec<VoucherRow> = self
            .rows
            .values()
            .filter(|row| row.header_id == header_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.row_no);
        let mut attachments: Vec<Attachment> = self
            .attachments
            .values()
            .filter(|a| a.parent_header_id == header_id)
            .cloned()
            .collect();
        attachments.sort_by_key(|a| (a.created.at, a.id));
        Some(Voucher {
            header,
            rows,
            attachments,
        })
    }

    fn header_kind(&self, header_id: Uuid) -> Option<VoucherKind> {
        self.headers.get(&header_id).map(|h| h.kind)
    }

    fn count_references(&self, probe: ReferenceProbe, id: Uuid) -> u64 {
        let live_rows_of = |kind: VoucherKind| {
            self.rows
                .values()
                .filter(move |row| !row.soft_deleted && row.payload.kind() == kind)
        };
        let count = match probe {
            ReferenceProbe::HeaderDepartment(kind) => self
                .headers
                .values()
                .filter(|h| !h.soft_deleted && h.kind == kind && h.department_id == id)
                .count(),
            ReferenceProbe::RowPerson(kind) => live_rows_of(kind)
                .filter(|row| row.payload.person_id() == id)
                .count(),
            ReferenceProbe::RowRiskLevel(kind) => live_rows_of(kind)
                .filter(|row| row.payload.risk_level_id() == Some(id))
                .count(),
            ReferenceProbe::RowSourceHeader(kind) => live_rows_of(kind)
                .filter(|row| {
                    row.source
                        .as_ref()
                        .is_some_and(|link| link.source_header_id == id)
                })
                .count(),
            ReferenceProbe::AttachmentFile => self
                .attachments
                .values()
                .filter(|a| !a.soft_deleted && a.file_id == id)
                .count(),
        };
        count as u64
    }
}

/// Checks a stored record against a write condition
fn satisfies(
    condition: &WriteCondition,
    token: ConcurrencyToken,
    soft_deleted: bool,
    status: Option<RowStatus>,
) -> bool {
    !soft_deleted
        && token == condition.expected_token
        && condition
            .expected_status
            .is_none_or(|expected| status == Some(expected))
}

/// In-memory storage with serializable transactions.
///
/// A transaction holds the store lock from `begin` until commit or drop and
/// works on a private copy of the tables, so uncommitted writes are never
/// visible and a rollback simply discards the copy.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
    clock: Arc<AtomicU64>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Clear all data (useful for testing)
    pub async fn clear(&self) {
        *self.tables.lock().await = Tables::default();
    }

    /// Current counter state for a (type, date) pair
    pub async fn serial_counter(&self, type_code: &str, date_key: &str) -> Option<SerialCounter> {
        self.tables
            .lock()
            .await
            .serials
            .get(&(type_code.to_string(), date_key.to_string()))
            .cloned()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VoucherStorage for MemoryStorage {
    async fn begin(&self) -> VoucherResult<Box<dyn StorageTransaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            work,
            clock: self.clock.clone(),
        }))
    }

    async fn get_voucher(&self, header_id: Uuid) -> VoucherResult<Option<Voucher>> {
        Ok(self.tables.lock().await.voucher(header_id))
    }

    async fn get_master(&self, id: Uuid) -> VoucherResult<Option<MasterRecord>> {
        Ok(self.tables.lock().await.masters.get(&id).cloned())
    }
}

#[async_trait]
impl IdentitySource for MemoryStorage {
    async fn fetch_identity(&self, id: Uuid) -> VoucherResult<Option<Identity>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .masters
            .get(&id)
            .filter(|record| !record.soft_deleted)
            .map(|record| Identity {
                id: record.id,
                kind: record.kind,
                display_name: record.name.clone(),
            }))
    }
}

/// Open transaction on a [`MemoryStorage`]
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
    clock: Arc<AtomicU64>,
}

impl MemoryTransaction {
    /// Tokens come from a store-wide clock so they are never reissued, even
    /// after a rollback.
    fn mint(&self) -> ConcurrencyToken {
        ConcurrencyToken::new(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn load_header(&mut self, id: Uuid) -> VoucherResult<Option<VoucherHeader>> {
        Ok(self.work.headers.get(&id).cloned())
    }

    async fn load_rows(&mut self, header_id: Uuid) -> VoucherResult<Vec<VoucherRow>> {
        let mut rows: Vec<VoucherRow> = self
            .work
            .rows
            .values()
            .filter(|row| row.header_id == header_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.row_no);
        Ok(rows)
    }

    async fn load_row(&mut self, id: Uuid) -> VoucherResult<Option<VoucherRow>> {
        Ok(self.work.rows.get(&id).cloned())
    }

    async fn load_attachments(&mut self, row_id: Uuid) -> VoucherResult<Vec<Attachment>> {
        let mut attachments: Vec<Attachment> = self
            .work
            .attachments
            .values()
            .filter(|a| a.parent_row_id == row_id && !a.soft_deleted)
            .cloned()
            .collect();
        attachments.sort_by_key(|a| (a.created.at, a.id));
        Ok(attachments)
    }

    async fn load_attachment(&mut self, id: Uuid) -> VoucherResult<Option<Attachment>> {
        Ok(self.work.attachments.get(&id).cloned())
    }

    async fn load_master(&mut self, id: Uuid) -> VoucherResult<Option<MasterRecord>> {
        Ok(self.work.masters.get(&id).cloned())
    }

    async fn insert_header(&mut self, mut header: VoucherHeader) -> VoucherResult<ConcurrencyToken> {
        if self.work.headers.contains_key(&header.id) {
            return Err(VoucherError::Internal(format!(
                "duplicate header id {}",
                header.id
            )));
        }
        header.token = self.mint();
        let token = header.token;
        self.work.headers.insert(header.id, header);
        Ok(token)
    }

    async fn insert_row(&mut self, mut row: VoucherRow) -> VoucherResult<ConcurrencyToken> {
        if self.work.rows.contains_key(&row.id) {
            return Err(VoucherError::Internal(format!("duplicate row id {}", row.id)));
        }
        if self.work.header_kind(row.header_id).is_none() {
            return Err(VoucherError::Internal(format!(
                "row {} references missing header {}",
                row.id, row.header_id
            )));
        }
        row.token = self.mint();
        let token = row.token;
        self.work.rows.insert(row.id, row);
        Ok(token)
    }

    async fn insert_attachment(
        &mut self,
        mut attachment: Attachment,
    ) -> VoucherResult<ConcurrencyToken> {
        if self.work.attachments.contains_key(&attachment.id) {
            return Err(VoucherError::Internal(format!(
                "duplicate attachment id {}",
                attachment.id
            )));
        }
        attachment.token = self.mint();
        let token = attachment.token;
        self.work.attachments.insert(attachment.id, attachment);
        Ok(token)
    }

    async fn insert_master(&mut self, mut record: MasterRecord) -> VoucherResult<ConcurrencyToken> {
        if self.work.masters.contains_key(&record.id) {
            return Err(VoucherError::Internal(format!(
                "duplicate master id {}",
                record.id
            )));
        }
        record.token = self.mint();
        let token = record.token;
        self.work.masters.insert(record.id, record);
        Ok(token)
    }

    async fn update_header(
        &mut self,
        condition: &WriteCondition,
        change: HeaderChange,
    ) -> VoucherResult<Option<ConcurrencyToken>> {
        let token = self.mint();
        let Some(header) = self.work.headers.get_mut(&condition.id) else {
            return Ok(None);
        };
        if !satisfies(condition, header.token, header.soft_deleted, Some(header.status)) {
            return Ok(None);
        }
        match change {
            HeaderChange::Fields {
                business_date,
                description,
                department_id,
                modified,
            } => {
                header.business_date = business_date;
                header.description = description;
                header.department_id = department_id;
                header.modified = Some(modified);
            }
            HeaderChange::Status { status, confirmed } => {
                header.status = status;
                match confirmed {
                    ConfirmStamp::Keep => {}
                    ConfirmStamp::Set(stamp) => header.confirmed = Some(stamp),
                    ConfirmStamp::Clear => header.confirmed = None,
                }
            }
            HeaderChange::SoftDelete(stamp) => {
                header.soft_deleted = true;
                header.deleted = Some(stamp);
            }
        }
        header.token = token;
        Ok(Some(token))
    }

    async fn update_row(
        &mut self,
        condition: &WriteCondition,
        change: RowChange,
    ) -> VoucherResult<Option<ConcurrencyToken>> {
        let token = self.mint();
        let Some(row) = self.work.rows.get_mut(&condition.id) else {
            return Ok(None);
        };
        if !satisfies(condition, row.token, row.soft_deleted, Some(row.status)) {
            return Ok(None);
        }
        match change {
            RowChange::Payload { payload, modified } => {
                row.payload = payload;
                row.modified = Some(modified);
            }
            RowChange::Status {
                status,
                confirmed,
                link_token,
            } => {
                row.status = status;
                match confirmed {
                    ConfirmStamp::Keep => {}
                    ConfirmStamp::Set(stamp) => row.confirmed = Some(stamp),
                    ConfirmStamp::Clear => row.confirmed = None,
                }
                if let (Some(link), Some(fresh)) = (row.source.as_mut(), link_token) {
                    link.source_row_token = fresh;
                }
            }
            RowChange::SoftDelete(stamp) => {
                row.soft_deleted = true;
                row.deleted = Some(stamp);
            }
        }
        row.token = token;
        Ok(Some(token))
    }

    async fn delete_attachment(
        &mut self,
        condition: &WriteCondition,
        stamp: AuditStamp,
    ) -> VoucherResult<Option<ConcurrencyToken>> {
        let token = self.mint();
        let Some(attachment) = self.work.attachments.get_mut(&condition.id) else {
            return Ok(None);
        };
        if !satisfies(condition, attachment.token, attachment.soft_deleted, None) {
            return Ok(None);
        }
        attachment.soft_deleted = true;
        attachment.deleted = Some(stamp);
        attachment.token = token;
        Ok(Some(token))
    }

    async fn delete_master(
        &mut self,
        condition: &WriteCondition,
        stamp: AuditStamp,
    ) -> VoucherResult<Option<ConcurrencyToken>> {
        let token = self.mint();
        let Some(record) = self.work.masters.get_mut(&condition.id) else {
            return Ok(None);
        };
        if !satisfies(condition, record.token, record.soft_deleted, None) {
            return Ok(None);
        }
        record.soft_deleted = true;
        record.deleted = Some(stamp);
        record.token = token;
        Ok(Some(token))
    }

    async fn next_serial(&mut self, type_code: &str, date_key: &str) -> VoucherResult<u64> {
        // The whole store is locked for the life of the transaction.
        let counter = self
            .work
            .serials
            .entry((type_code.to_string(), date_key.to_string()))
            .or_insert_with(|| SerialCounter {
                voucher_type_code: type_code.to_string(),
                date_key: date_key.to_string(),
                next_sequence: 1,
            });
        let sequence = counter.next_sequence;
        counter.next_sequence += 1;
        Ok(sequence)
    }

    async fn count_references(&mut self, probe: ReferenceProbe, id: Uuid) -> VoucherResult<u64> {
        Ok(self.work.count_references(probe, id))
    }

    async fn commit(self: Box<Self>) -> VoucherResult<()> {
        let MemoryTransaction {
            mut guard, work, ..
        } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> VoucherResult<()> {
        Ok(())
    }
}
