//! Voucher engine: the transactional envelope around every lifecycle operation
//!
//! Each public operation opens one storage transaction, runs every header,
//! row, attachment and upstream write inside it, and commits only if all of
//! them succeed. The first error rolls the whole unit back.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::traits::*;
use crate::types::*;
use crate::utils::cache::IdentityCache;
use crate::voucher::chain::{ChainEvent, ChainPropagator, DownstreamEvent};
use crate::voucher::guard::UsageGuard;
use crate::voucher::request::{EditVoucher, NewRow, NewVoucher, RowEdit};
use crate::voucher::serial::SerialNumberAllocator;
use crate::voucher::state::{settle_header, transition_row, RowEvent};

/// Display projection of a voucher with resolved names and file URLs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoucherView {
    pub voucher: Voucher,
    pub department: Option<String>,
    pub rows: Vec<RowView>,
}

/// Display projection of one live row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowView {
    pub row_id: Uuid,
    pub row_no: u32,
    pub status: RowStatus,
    pub person: Option<String>,
    pub attachment_urls: Vec<String>,
}

/// Main engine that orchestrates all voucher lifecycle operations
pub struct VoucherEngine<S: VoucherStorage> {
    storage: S,
    config: EngineConfig,
    validator: Box<dyn VoucherValidator>,
    identities: Arc<dyn IdentityDirectory>,
    locator: Option<Box<dyn AttachmentLocator>>,
}

impl<S> VoucherEngine<S>
where
    S: VoucherStorage + IdentitySource + Clone + 'static,
{
    /// Create a new engine with the default configuration
    pub fn new(storage: S) -> Self {
        let config = EngineConfig::default();
        let identities = Arc::new(IdentityCache::new(
            storage.clone(),
            config.identity_cache_capacity,
        ));
        Self {
            storage,
            config,
            validator: Box::new(DefaultVoucherValidator),
            identities,
            locator: None,
        }
    }

    /// Create a new engine with a custom configuration
    pub fn with_config(storage: S, config: EngineConfig) -> VoucherResult<Self> {
        config.validate()?;
        let identities = Arc::new(IdentityCache::new(
            storage.clone(),
            config.identity_cache_capacity,
        ));
        Ok(Self {
            storage,
            config,
            validator: Box::new(DefaultVoucherValidator),
            identities,
            locator: None,
        })
    }
}

impl<S: VoucherStorage> VoucherEngine<S> {
    pub fn with_validator(mut self, validator: Box<dyn VoucherValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_identity_directory(mut self, identities: Arc<dyn IdentityDirectory>) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_attachment_locator(mut self, locator: Box<dyn AttachmentLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Get the committed state of a voucher, soft-deleted records included
    pub async fn get_voucher(&self, header_id: Uuid) -> VoucherResult<Voucher> {
        self.storage
            .get_voucher(header_id)
            .await?
            .ok_or(VoucherError::NotFound(header_id))
    }

    /// Add a voucher: allocate its bill number, insert header and rows, and
    /// execute the upstream row of every linked row
    #[instrument(skip(self, request), fields(kind = %request.kind))]
    pub async fn add(&self, request: NewVoucher, actor: Uuid) -> VoucherResult<Voucher> {
        self.validate_new(&request)?;

        let mut tx = self.storage.begin().await?;
        let result = self.add_in(tx.as_mut(), &request, actor).await;
        let header_id = finish(tx, result, "add").await?;

        let voucher = self.get_voucher(header_id).await?;
        info!(
            header_id = %header_id,
            bill_number = %voucher.header.bill_number,
            rows = voucher.rows.len(),
            "Voucher added"
        );
        Ok(voucher)
    }

    /// Edit header fields and add, update or remove rows of a Free voucher
    #[instrument(skip(self, request), fields(header_id = %request.header_id))]
    pub async fn edit(&self, request: EditVoucher, actor: Uuid) -> VoucherResult<Voucher> {
        let mut tx = self.storage.begin().await?;
        let result = self.edit_in(tx.as_mut(), &request, actor).await;
        finish(tx, result, "edit").await?;

        info!(edits = request.rows.len(), "Voucher edited");
        self.get_voucher(request.header_id).await
    }

    /// Soft-delete a Free voucher with all rows and attachments
    #[instrument(skip(self, tokens))]
    pub async fn delete(&self, header_id: Uuid, tokens: &TokenSet, actor: Uuid) -> VoucherResult<()> {
        let mut tx = self.storage.begin().await?;
        let result = self.delete_in(tx.as_mut(), header_id, tokens, actor).await;
        finish(tx, result, "delete").await?;

        info!("Voucher deleted");
        Ok(())
    }

    /// Confirm the header and every live row; all or nothing
    #[instrument(skip(self, tokens))]
    pub async fn confirm(
        &self,
        header_id: Uuid,
        tokens: &TokenSet,
        actor: Uuid,
    ) -> VoucherResult<Voucher> {
        let mut tx = self.storage.begin().await?;
        let result = self.confirm_in(tx.as_mut(), header_id, tokens, actor).await;
        finish(tx, result, "confirm").await?;

        info!("Voucher confirmed");
        self.get_voucher(header_id).await
    }

    /// Reverse a Confirm; only the original confirmer may do this
    #[instrument(skip(self, tokens))]
    pub async fn unconfirm(
        &self,
        header_id: Uuid,
        tokens: &TokenSet,
        actor: Uuid,
    ) -> VoucherResult<Voucher> {
        let mut tx = self.storage.begin().await?;
        let result = self.unconfirm_in(tx.as_mut(), header_id, tokens, actor).await;
        finish(tx, result, "unconfirm").await?;

        info!("Voucher unconfirmed");
        self.get_voucher(header_id).await
    }

    /// Drive a training row through Execute/Complete and their reversals.
    ///
    /// Training records have no downstream document, so the client moves
    /// their rows directly.
    #[instrument(skip(self, token))]
    pub async fn apply_training_event(
        &self,
        header_id: Uuid,
        row_id: Uuid,
        token: ConcurrencyToken,
        event: RowEvent,
        actor: Uuid,
    ) -> VoucherResult<Voucher> {
        if matches!(event, RowEvent::Confirm | RowEvent::UnConfirm) {
            return Err(VoucherError::Validation(
                "Confirm and UnConfirm apply to the whole training record".to_string(),
            ));
        }

        let mut tx = self.storage.begin().await?;
        let result = self
            .training_event_in(tx.as_mut(), header_id, row_id, token, event, actor)
            .await;
        let status = finish(tx, result, "training_event").await?;

        info!(header_status = %status, "Training row moved");
        self.get_voucher(header_id).await
    }

    /// Attach a file to a live row without touching row or header tokens
    #[instrument(skip(self))]
    pub async fn attach(
        &self,
        header_id: Uuid,
        row_id: Uuid,
        file_id: Uuid,
        actor: Uuid,
    ) -> VoucherResult<Attachment> {
        let mut tx = self.storage.begin().await?;
        let result = self
            .attach_in(tx.as_mut(), header_id, row_id, file_id, actor)
            .await;
        let attachment = finish(tx, result, "attach").await?;

        info!(attachment_id = %attachment.id, "File attached");
        Ok(attachment)
    }

    /// Soft-delete an attachment
    #[instrument(skip(self, token))]
    pub async fn detach(
        &self,
        attachment_id: Uuid,
        token: ConcurrencyToken,
        actor: Uuid,
    ) -> VoucherResult<()> {
        let mut tx = self.storage.begin().await?;
        let result = tx
            .delete_attachment(
                &WriteCondition::new(attachment_id, token),
                AuditStamp::now(actor),
            )
            .await
            .and_then(|deleted| {
                deleted.ok_or(VoucherError::conflict(EntityKind::Attachment, attachment_id))
            });
        finish(tx, result, "detach").await?;

        info!("File detached");
        Ok(())
    }

    /// Register a master data record so vouchers can reference it
    #[instrument(skip(self, name))]
    pub async fn register_master(
        &self,
        kind: MasterKind,
        name: &str,
        actor: Uuid,
    ) -> VoucherResult<MasterRecord> {
        if name.trim().is_empty() {
            return Err(VoucherError::Validation(
                "Master record name cannot be empty".to_string(),
            ));
        }

        let mut record = MasterRecord {
            id: Uuid::new_v4(),
            kind,
            name: name.trim().to_string(),
            token: ConcurrencyToken::new(0),
            created: AuditStamp::now(actor),
            deleted: None,
            soft_deleted: false,
        };
        let mut tx = self.storage.begin().await?;
        let result = tx.insert_master(record.clone()).await;
        record.token = finish(tx, result, "register_master").await?;

        info!(id = %record.id, "Master record registered");
        Ok(record)
    }

    /// Soft-delete a master record after the usage checks pass.
    ///
    /// The identity cache entry is dropped before the transaction and again
    /// after the commit. A lookup that read the record before the commit and
    /// inserts it after the second invalidation still leaves a stale entry
    /// until the next invalidation or capacity reset; the directory does not
    /// coordinate with the store lock.
    #[instrument(skip(self, token))]
    pub async fn delete_master(
        &self,
        id: Uuid,
        token: ConcurrencyToken,
        actor: Uuid,
    ) -> VoucherResult<()> {
        self.identities.invalidate(id);
        let mut tx = self.storage.begin().await?;
        let result = self.delete_master_in(tx.as_mut(), id, token, actor).await;
        finish(tx, result, "delete_master").await?;

        self.identities.invalidate(id);
        info!("Master record deleted");
        Ok(())
    }

    /// Resolve display names and file URLs for a voucher.
    ///
    /// Collaborator failures degrade to missing values; they never fail the call.
    pub async fn describe_voucher(&self, header_id: Uuid) -> VoucherResult<VoucherView> {
        let voucher = self.get_voucher(header_id).await?;
        let department = self.display_name(voucher.header.department_id).await;

        let mut rows = Vec::new();
        for row in voucher.live_rows() {
            let attachment_urls = voucher
                .live_attachments()
                .filter(|a| a.parent_row_id == row.id)
                .filter_map(|a| self.locator.as_ref().and_then(|l| l.locate(a.file_id)))
                .collect();
            rows.push(RowView {
                row_id: row.id,
                row_no: row.row_no,
                status: row.status,
                person: self.display_name(row.payload.person_id()).await,
                attachment_urls,
            });
        }

        Ok(VoucherView {
            voucher,
            department,
            rows,
        })
    }

    async fn display_name(&self, id: Uuid) -> Option<String> {
        match self.identities.lookup(id).await {
            Ok(identity) => identity.map(|i| i.display_name),
            Err(err) => {
                warn!(id = %id, error = %err, "Identity lookup failed");
                None
            }
        }
    }

    fn validate_new(&self, request: &NewVoucher) -> VoucherResult<()> {
        self.validator
            .validate_header(request.kind, &request.description)?;
        if request.rows.is_empty() {
            return Err(VoucherError::EmptyBody { kind: request.kind });
        }
        self.check_row_limit(request.rows.len())?;
        for row in &request.rows {
            self.validate_new_row(request.kind, row)?;
        }
        Ok(())
    }

    fn validate_new_row(&self, kind: VoucherKind, row: &NewRow) -> VoucherResult<()> {
        self.validator.validate_payload(kind, &row.payload)?;
        if let Some(link) = &row.source {
            if kind.upstream() != Some(link.source_kind) {
                return Err(VoucherError::Validation(format!(
                    "A {} line cannot be generated from a {}",
                    kind, link.source_kind
                )));
            }
        }
        Ok(())
    }

    fn check_row_limit(&self, live_rows: usize) -> VoucherResult<()> {
        if live_rows > self.config.max_rows_per_voucher {
            return Err(VoucherError::Validation(format!(
                "A voucher cannot hold more than {} rows",
                self.config.max_rows_per_voucher
            )));
        }
        Ok(())
    }

    async fn add_in(
        &self,
        tx: &mut dyn StorageTransaction,
        request: &NewVoucher,
        actor: Uuid,
    ) -> VoucherResult<Uuid> {
        let bill_number = SerialNumberAllocator::new(&self.config)
            .allocate(tx, request.kind, request.business_date)
            .await?;

        let header_id = Uuid::new_v4();
        tx.insert_header(VoucherHeader {
            id: header_id,
            kind: request.kind,
            bill_number,
            business_date: request.business_date,
            description: request.description.clone(),
            department_id: request.department_id,
            status: RowStatus::Free,
            token: ConcurrencyToken::new(0),
            created: AuditStamp::now(actor),
            confirmed: None,
            modified: None,
            deleted: None,
            soft_deleted: false,
        })
        .await?;

        for (row_no, row) in (1u32..).zip(&request.rows) {
            insert_row(tx, request.kind, header_id, row_no, row, actor).await?;
        }
        Ok(header_id)
    }

    async fn edit_in(
        &self,
        tx: &mut dyn StorageTransaction,
        request: &EditVoucher,
        actor: Uuid,
    ) -> VoucherResult<()> {
        let header = load_live_header(tx, request.header_id, request.token).await?;
        if header.status != RowStatus::Free {
            return Err(VoucherError::NotEditable {
                entity: EntityKind::Header,
                id: header.id,
                status: header.status,
            });
        }

        let description = request
            .description
            .clone()
            .unwrap_or_else(|| header.description.clone());
        self.validator.validate_header(header.kind, &description)?;
        for edit in &request.rows {
            match edit {
                RowEdit::Add(row) => self.validate_new_row(header.kind, row)?,
                RowEdit::Update { payload, .. } => {
                    self.validator.validate_payload(header.kind, payload)?
                }
                RowEdit::Remove { .. } => {}
            }
        }

        let condition = WriteCondition::new(header.id, request.token).in_status(RowStatus::Free);
        tx.update_header(
            &condition,
            HeaderChange::Fields {
                business_date: request.business_date.unwrap_or(header.business_date),
                description,
                department_id: request.department_id.unwrap_or(header.department_id),
                modified: AuditStamp::now(actor),
            },
        )
        .await?
        .ok_or(VoucherError::conflict(EntityKind::Header, header.id))?;

        let mut last_row_no = tx
            .load_rows(header.id)
            .await?
            .iter()
            .map(|row| row.row_no)
            .max()
            .unwrap_or(0);

        for edit in &request.rows {
            match edit {
                RowEdit::Add(row) => {
                    last_row_no += 1;
                    insert_row(tx, header.kind, header.id, last_row_no, row, actor).await?;
                }
                RowEdit::Update {
                    row_id,
                    token,
                    payload,
                } => {
                    let row = load_live_row(tx, header.id, *row_id, *token).await?;
                    ensure_free(&row)?;
                    let condition =
                        WriteCondition::new(row.id, *token).in_status(RowStatus::Free);
                    tx.update_row(
                        &condition,
                        RowChange::Payload {
                            payload: payload.clone(),
                            modified: AuditStamp::now(actor),
                        },
                    )
                    .await?
                    .ok_or(VoucherError::conflict(EntityKind::Row, row.id))?;
                }
                RowEdit::Remove { row_id, token } => {
                    remove_row(tx, header.id, *row_id, *token, actor).await?;
                }
            }
        }

        let live = tx
            .load_rows(header.id)
            .await?
            .iter()
            .filter(|row| !row.soft_deleted)
            .count();
        if live == 0 {
            return Err(VoucherError::EmptyBody { kind: header.kind });
        }
        self.check_row_limit(live)
    }

    async fn delete_in(
        &self,
        tx: &mut dyn StorageTransaction,
        header_id: Uuid,
        tokens: &TokenSet,
        actor: Uuid,
    ) -> VoucherResult<()> {
        let header = load_live_header(tx, header_id, tokens.header).await?;
        if header.status != RowStatus::Free {
            return Err(VoucherError::NotEditable {
                entity: EntityKind::Header,
                id: header_id,
                status: header.status,
            });
        }
        if let Some(entity) = GuardedEntity::for_voucher(header.kind) {
            UsageGuard::ensure_unused(tx, entity, header_id).await?;
        }

        let rows = live_rows(tx, header_id).await?;
        check_token_set(&rows, tokens)?;
        for row in &rows {
            ensure_free(row)?;
        }

        let condition = WriteCondition::new(header_id, tokens.header).in_status(RowStatus::Free);
        tx.update_header(&condition, HeaderChange::SoftDelete(AuditStamp::now(actor)))
            .await?
            .ok_or(VoucherError::conflict(EntityKind::Header, header_id))?;

        for row in &rows {
            remove_row(tx, header_id, row.id, row.token, actor).await?;
        }
        Ok(())
    }

    async fn confirm_in(
        &self,
        tx: &mut dyn StorageTransaction,
        header_id: Uuid,
        tokens: &TokenSet,
        actor: Uuid,
    ) -> VoucherResult<()> {
        let header = load_live_header(tx, header_id, tokens.header).await?;
        if header.status != RowStatus::Free {
            return Err(VoucherError::NotEditable {
                entity: EntityKind::Header,
                id: header_id,
                status: header.status,
            });
        }

        let rows = live_rows(tx, header_id).await?;
        if rows.is_empty() {
            return Err(VoucherError::EmptyBody { kind: header.kind });
        }
        check_token_set(&rows, tokens)?;
        for row in &rows {
            ensure_free(row)?;
        }

        let condition = WriteCondition::new(header_id, tokens.header).in_status(RowStatus::Free);
        tx.update_header(
            &condition,
            HeaderChange::Status {
                status: RowStatus::Confirmed,
                confirmed: ConfirmStamp::Set(AuditStamp::now(actor)),
            },
        )
        .await?
        .ok_or(VoucherError::conflict(EntityKind::Header, header_id))?;

        for row in &rows {
            let link_token = propagate(tx, row, DownstreamEvent::Confirmed, actor).await?;
            transition_row(tx, row.id, row.token, RowEvent::Confirm, actor, link_token).await?;
        }
        settle_header(tx, header_id, RowEvent::Confirm).await?;
        Ok(())
    }

    async fn unconfirm_in(
        &self,
        tx: &mut dyn StorageTransaction,
        header_id: Uuid,
        tokens: &TokenSet,
        actor: Uuid,
    ) -> VoucherResult<()> {
        let header = load_live_header(tx, header_id, tokens.header).await?;
        if header.status == RowStatus::Free {
            return Err(VoucherError::NotEditable {
                entity: EntityKind::Header,
                id: header_id,
                status: header.status,
            });
        }
        if header.confirmed.as_ref().map(|stamp| stamp.by) != Some(actor) {
            return Err(VoucherError::GuardViolation {
                id: header_id,
                reason: "only the original confirmer may unconfirm".to_string(),
            });
        }

        let rows = live_rows(tx, header_id).await?;
        if let Some(row) = rows.iter().find(|row| row.status > RowStatus::Confirmed) {
            return Err(VoucherError::GuardViolation {
                id: header_id,
                reason: format!("row {} is already {}", row.row_no, row.status),
            });
        }
        if header.status != RowStatus::Confirmed {
            return Err(VoucherError::NotEditable {
                entity: EntityKind::Header,
                id: header_id,
                status: header.status,
            });
        }
        check_token_set(&rows, tokens)?;

        let condition =
            WriteCondition::new(header_id, tokens.header).in_status(RowStatus::Confirmed);
        tx.update_header(
            &condition,
            HeaderChange::Status {
                status: RowStatus::Free,
                confirmed: ConfirmStamp::Clear,
            },
        )
        .await?
        .ok_or(VoucherError::conflict(EntityKind::Header, header_id))?;

        for row in &rows {
            let link_token = propagate(tx, row, DownstreamEvent::UnConfirmed, actor).await?;
            transition_row(tx, row.id, row.token, RowEvent::UnConfirm, actor, link_token).await?;
        }
        settle_header(tx, header_id, RowEvent::UnConfirm).await?;
        Ok(())
    }

    async fn training_event_in(
        &self,
        tx: &mut dyn StorageTransaction,
        header_id: Uuid,
        row_id: Uuid,
        token: ConcurrencyToken,
        event: RowEvent,
        actor: Uuid,
    ) -> VoucherResult<RowStatus> {
        let header = match tx.load_header(header_id).await? {
            Some(header) if !header.soft_deleted => header,
            _ => return Err(VoucherError::conflict(EntityKind::Header, header_id)),
        };
        if header.kind != VoucherKind::Training {
            return Err(VoucherError::Validation(format!(
                "Rows of a {} are moved by their downstream documents",
                header.kind
            )));
        }

        let transition = transition_row(tx, row_id, token, event, actor, None).await?;
        if transition.header_id != header_id {
            return Err(VoucherError::conflict(EntityKind::Row, row_id));
        }
        settle_header(tx, header_id, event).await
    }

    async fn attach_in(
        &self,
        tx: &mut dyn StorageTransaction,
        header_id: Uuid,
        row_id: Uuid,
        file_id: Uuid,
        actor: Uuid,
    ) -> VoucherResult<Attachment> {
        match tx.load_header(header_id).await? {
            Some(header) if !header.soft_deleted => {}
            _ => return Err(VoucherError::conflict(EntityKind::Header, header_id)),
        }
        match tx.load_row(row_id).await? {
            Some(row) if !row.soft_deleted && row.header_id == header_id => {}
            _ => return Err(VoucherError::conflict(EntityKind::Row, row_id)),
        }

        let mut attachment = new_attachment(header_id, row_id, file_id, actor);
        attachment.token = tx.insert_attachment(attachment.clone()).await?;
        Ok(attachment)
    }

    async fn delete_master_in(
        &self,
        tx: &mut dyn StorageTransaction,
        id: Uuid,
        token: ConcurrencyToken,
        actor: Uuid,
    ) -> VoucherResult<()> {
        let record = match tx.load_master(id).await? {
            Some(record) if !record.soft_deleted && record.token == token => record,
            _ => return Err(VoucherError::conflict(EntityKind::Master, id)),
        };

        UsageGuard::ensure_unused(tx, record.kind.into(), id).await?;

        tx.delete_master(&WriteCondition::new(id, token), AuditStamp::now(actor))
            .await?
            .ok_or(VoucherError::conflict(EntityKind::Master, id))?;
        Ok(())
    }
}

/// Commit on success, roll back on failure
async fn finish<T>(
    tx: Box<dyn StorageTransaction>,
    result: VoucherResult<T>,
    operation: &'static str,
) -> VoucherResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            warn!(operation, kind = ?err.kind(), error = %err, "Operation aborted, rolling back");
            if let Err(rollback_err) = tx.rollback().await {
                warn!(operation, error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

async fn load_live_header(
    tx: &mut dyn StorageTransaction,
    header_id: Uuid,
    expected: ConcurrencyToken,
) -> VoucherResult<VoucherHeader> {
    match tx.load_header(header_id).await? {
        Some(header) if !header.soft_deleted && header.token == expected => Ok(header),
        _ => Err(VoucherError::conflict(EntityKind::Header, header_id)),
    }
}

async fn load_live_row(
    tx: &mut dyn StorageTransaction,
    header_id: Uuid,
    row_id: Uuid,
    expected: ConcurrencyToken,
) -> VoucherResult<VoucherRow> {
    match tx.load_row(row_id).await? {
        Some(row) if !row.soft_deleted && row.header_id == header_id && row.token == expected => {
            Ok(row)
        }
        _ => Err(VoucherError::conflict(EntityKind::Row, row_id)),
    }
}

async fn live_rows(
    tx: &mut dyn StorageTransaction,
    header_id: Uuid,
) -> VoucherResult<Vec<VoucherRow>> {
    Ok(tx
        .load_rows(header_id)
        .await?
        .into_iter()
        .filter(|row| !row.soft_deleted)
        .collect())
}

/// The client's token set must name exactly the live rows, each with its
/// current token.
///
/// The conditional writes that follow re-check every token atomically.
fn check_token_set(rows: &[VoucherRow], tokens: &TokenSet) -> VoucherResult<()> {
    for row in rows {
        if tokens.rows.get(&row.id) != Some(&row.token) {
            return Err(VoucherError::conflict(EntityKind::Row, row.id));
        }
    }
    if let Some(stale) = tokens
        .rows
        .keys()
        .find(|id| !rows.iter().any(|row| row.id == **id))
    {
        return Err(VoucherError::conflict(EntityKind::Row, *stale));
    }
    Ok(())
}

fn ensure_free(row: &VoucherRow) -> VoucherResult<()> {
    if row.status != RowStatus::Free {
        return Err(VoucherError::NotEditable {
            entity: EntityKind::Row,
            id: row.id,
            status: row.status,
        });
    }
    Ok(())
}

/// Apply the upstream half of a downstream event, if the row is linked
async fn propagate(
    tx: &mut dyn StorageTransaction,
    row: &VoucherRow,
    downstream: DownstreamEvent,
    actor: Uuid,
) -> VoucherResult<Option<ConcurrencyToken>> {
    match &row.source {
        Some(link) => {
            let chain = ChainEvent::from_link(link, downstream);
            ChainPropagator::apply(tx, &chain, actor).await.map(Some)
        }
        None => Ok(None),
    }
}

fn new_attachment(header_id: Uuid, row_id: Uuid, file_id: Uuid, actor: Uuid) -> Attachment {
    Attachment {
        id: Uuid::new_v4(),
        parent_row_id: row_id,
        parent_header_id: header_id,
        file_id,
        token: ConcurrencyToken::new(0),
        created: AuditStamp::now(actor),
        deleted: None,
        soft_deleted: false,
    }
}

async fn insert_row(
    tx: &mut dyn StorageTransaction,
    kind: VoucherKind,
    header_id: Uuid,
    row_no: u32,
    row: &NewRow,
    actor: Uuid,
) -> VoucherResult<()> {
    let source = match &row.source {
        Some(link) => {
            let chain = ChainEvent::from_link(link, DownstreamEvent::Created);
            let fresh = ChainPropagator::apply(tx, &chain, actor).await?;
            Some(SourceLink {
                source_row_token: fresh,
                ..link.clone()
            })
        }
        None => None,
    };

    let row_id = Uuid::new_v4();
    tx.insert_row(VoucherRow {
        id: row_id,
        header_id,
        row_no,
        payload: row.payload.clone(),
        status: RowStatus::Free,
        token: ConcurrencyToken::new(0),
        confirmed: None,
        modified: None,
        deleted: None,
        soft_deleted: false,
        source,
    })
    .await?;

    for file_id in &row.files {
        tx.insert_attachment(new_attachment(header_id, row_id, *file_id, actor))
            .await?;
    }
    debug!(%header_id, %row_id, row_no, %kind, "Row inserted");
    Ok(())
}

/// Soft-delete a Free row with its attachments and cancel the upstream
/// execution it caused
async fn remove_row(
    tx: &mut dyn StorageTransaction,
    header_id: Uuid,
    row_id: Uuid,
    expected: ConcurrencyToken,
    actor: Uuid,
) -> VoucherResult<()> {
    let row = load_live_row(tx, header_id, row_id, expected).await?;
    ensure_free(&row)?;

    let stamp = AuditStamp::now(actor);
    for attachment in tx.load_attachments(row_id).await? {
        tx.delete_attachment(
            &WriteCondition::new(attachment.id, attachment.token),
            stamp.clone(),
        )
        .await?
        .ok_or(VoucherError::conflict(EntityKind::Attachment, attachment.id))?;
    }

    let condition = WriteCondition::new(row_id, expected).in_status(RowStatus::Free);
    tx.update_row(&condition, RowChange::SoftDelete(stamp))
        .await?
        .ok_or(VoucherError::conflict(EntityKind::Row, row_id))?;

    propagate(tx, &row, DownstreamEvent::Deleted, actor).await?;
    Ok(())
}
