//! Row state machine and header status aggregation
//!
//! One transition table serves every voucher type; a type's [`Lifecycle`]
//! decides which targets are reachable for it. Header status is never written
//! free-form: it is re-derived from the live rows after each row transition.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::traits::*;
use crate::types::*;

/// Row-level lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowEvent {
    Confirm,
    UnConfirm,
    Execute,
    CancelExecute,
    Complete,
    CancelComplete,
}

/// `(event, required status, resulting status)`
pub const TRANSITIONS: [(RowEvent, RowStatus, RowStatus); 6] = [
    (RowEvent::Confirm, RowStatus::Free, RowStatus::Confirmed),
    (RowEvent::UnConfirm, RowStatus::Confirmed, RowStatus::Free),
    (RowEvent::Execute, RowStatus::Confirmed, RowStatus::Executing),
    (RowEvent::CancelExecute, RowStatus::Executing, RowStatus::Confirmed),
    (RowEvent::Complete, RowStatus::Executing, RowStatus::Completed),
    (RowEvent::CancelComplete, RowStatus::Completed, RowStatus::Executing),
];

impl RowEvent {
    pub fn required_status(self) -> RowStatus {
        match self {
            RowEvent::Confirm => RowStatus::Free,
            RowEvent::UnConfirm | RowEvent::Execute => RowStatus::Confirmed,
            RowEvent::CancelExecute | RowEvent::Complete => RowStatus::Executing,
            RowEvent::CancelComplete => RowStatus::Completed,
        }
    }

    pub fn target_status(self) -> RowStatus {
        match self {
            RowEvent::UnConfirm => RowStatus::Free,
            RowEvent::Confirm | RowEvent::CancelExecute => RowStatus::Confirmed,
            RowEvent::Execute | RowEvent::CancelComplete => RowStatus::Executing,
            RowEvent::Complete => RowStatus::Completed,
        }
    }

    /// Reversals are the only events allowed to move a header backwards
    pub fn is_reversal(self) -> bool {
        matches!(
            self,
            RowEvent::UnConfirm | RowEvent::CancelExecute | RowEvent::CancelComplete
        )
    }
}

/// Status after applying `event` to a row in `current`, or `None` when the
/// event is not valid from `current` under `lifecycle`.
pub fn next_status(lifecycle: Lifecycle, current: RowStatus, event: RowEvent) -> Option<RowStatus> {
    TRANSITIONS
        .iter()
        .find(|(e, from, _)| *e == event && *from == current)
        .map(|(_, _, to)| *to)
        .filter(|to| lifecycle.permits(*to))
}

/// Status implied by a set of live row statuses.
///
/// All Completed wins, then any row at Executing or beyond, then all rows at
/// least Confirmed; anything else is Free. `None` for an empty set.
pub fn derive_header_status<I>(rows: I) -> Option<RowStatus>
where
    I: IntoIterator<Item = RowStatus>,
{
    let mut count = 0usize;
    let mut all_completed = true;
    let mut any_executing = false;
    let mut all_confirmed = true;

    for status in rows {
        count += 1;
        all_completed &= status == RowStatus::Completed;
        any_executing |= status >= RowStatus::Executing;
        all_confirmed &= status >= RowStatus::Confirmed;
    }

    if count == 0 {
        return None;
    }
    let derived = if all_completed {
        RowStatus::Completed
    } else if any_executing {
        RowStatus::Executing
    } else if all_confirmed {
        RowStatus::Confirmed
    } else {
        RowStatus::Free
    };
    Some(derived)
}

/// Apply the derived status to the current header status.
///
/// Forward moves are always taken; backward moves only when `allow_regress`
/// is set by a reversal event. Running it twice yields the same status.
pub fn aggregate(current: RowStatus, rows: &[RowStatus], allow_regress: bool) -> RowStatus {
    match derive_header_status(rows.iter().copied()) {
        Some(derived) if derived > current || (allow_regress && derived < current) => derived,
        _ => current,
    }
}

/// Result of a guarded row transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowTransition {
    pub header_id: Uuid,
    pub row_id: Uuid,
    pub status: RowStatus,
    pub token: ConcurrencyToken,
}

/// Apply `event` to one row using a token-guarded conditional write.
///
/// `link_token`, when given, is cached into the row's source link in the same
/// write.
pub async fn transition_row(
    tx: &mut dyn StorageTransaction,
    row_id: Uuid,
    expected: ConcurrencyToken,
    event: RowEvent,
    actor: Uuid,
    link_token: Option<ConcurrencyToken>,
) -> VoucherResult<RowTransition> {
    let row = match tx.load_row(row_id).await? {
        Some(row) if !row.soft_deleted && row.token == expected => row,
        _ => return Err(VoucherError::conflict(EntityKind::Row, row_id)),
    };

    let lifecycle = row.payload.kind().lifecycle();
    let target = next_status(lifecycle, row.status, event).ok_or(VoucherError::NotEditable {
        entity: EntityKind::Row,
        id: row_id,
        status: row.status,
    })?;

    let confirmed = match event {
        RowEvent::Confirm => ConfirmStamp::Set(AuditStamp::now(actor)),
        RowEvent::UnConfirm => {
            let confirmer = row.confirmed.as_ref().map(|stamp| stamp.by);
            if confirmer != Some(actor) {
                return Err(VoucherError::GuardViolation {
                    id: row_id,
                    reason: "only the original confirmer may unconfirm".to_string(),
                });
            }
            ConfirmStamp::Clear
        }
        _ => ConfirmStamp::Keep,
    };

    let condition = WriteCondition::new(row_id, expected).in_status(row.status);
    let token = tx
        .update_row(
            &condition,
            RowChange::Status {
                status: target,
                confirmed,
                link_token,
            },
        )
        .await?
        .ok_or(VoucherError::conflict(EntityKind::Row, row_id))?;

    debug!(
        row_id = %row_id,
        header_id = %row.header_id,
        from = %row.status,
        to = %target,
        ?event,
        "Row transition applied"
    );

    Ok(RowTransition {
        header_id: row.header_id,
        row_id,
        status: target,
        token,
    })
}

/// Re-derive a header's status from its live rows after a row transition.
///
/// The header write is conditional on the token and status read in this
/// transaction. Returns the header status afterwards.
pub async fn settle_header(
    tx: &mut dyn StorageTransaction,
    header_id: Uuid,
    event: RowEvent,
) -> VoucherResult<RowStatus> {
    let header = match tx.load_header(header_id).await? {
        Some(header) if !header.soft_deleted => header,
        _ => return Err(VoucherError::conflict(EntityKind::Header, header_id)),
    };
    let statuses: Vec<RowStatus> = tx
        .load_rows(header_id)
        .await?
        .into_iter()
        .filter(|row| !row.soft_deleted)
        .map(|row| row.status)
        .collect();

    let settled = aggregate(header.status, &statuses, event.is_reversal());
    if settled == header.status {
        return Ok(settled);
    }

    let condition = WriteCondition::new(header_id, header.token).in_status(header.status);
    tx.update_header(
        &condition,
        HeaderChange::Status {
            status: settled,
            confirmed: ConfirmStamp::Keep,
        },
    )
    .await?
    .ok_or(VoucherError::conflict(EntityKind::Header, header_id))?;

    debug!(
        header_id = %header_id,
        from = %header.status,
        to = %settled,
        "Header status re-derived"
    );
    Ok(settled)
}
