//! One-hop write-back from a downstream document to its source row

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::traits::StorageTransaction;
use crate::types::*;
use crate::voucher::state::{settle_header, transition_row, RowEvent};

/// Lifecycle events of a downstream row that are mirrored upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownstreamEvent {
    Created,
    Deleted,
    Confirmed,
    UnConfirmed,
}

impl DownstreamEvent {
    /// The transition applied to the upstream row
    pub fn upstream_event(self) -> RowEvent {
        match self {
            DownstreamEvent::Created => RowEvent::Execute,
            DownstreamEvent::Deleted => RowEvent::CancelExecute,
            DownstreamEvent::Confirmed => RowEvent::Complete,
            DownstreamEvent::UnConfirmed => RowEvent::CancelComplete,
        }
    }
}

/// A transition to apply to an upstream row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainEvent {
    pub event: RowEvent,
    pub source_kind: VoucherKind,
    pub header_id: Uuid,
    pub row_id: Uuid,
    pub expected_token: ConcurrencyToken,
}

impl ChainEvent {
    pub fn from_link(link: &SourceLink, downstream: DownstreamEvent) -> Self {
        Self {
            event: downstream.upstream_event(),
            source_kind: link.source_kind,
            header_id: link.source_header_id,
            row_id: link.source_row_id,
            expected_token: link.source_row_token,
        }
    }
}

/// Applies chain events exactly one hop upstream
pub struct ChainPropagator;

impl ChainPropagator {
    /// Apply the event to the upstream row and re-derive its header.
    ///
    /// Returns the upstream row's fresh token, which the caller stores in the
    /// downstream link. Any mismatch between the link and the upstream row is
    /// a conflict.
    pub async fn apply(
        tx: &mut dyn StorageTransaction,
        chain: &ChainEvent,
        actor: Uuid,
    ) -> VoucherResult<ConcurrencyToken> {
        if matches!(chain.event, RowEvent::Confirm | RowEvent::UnConfirm) {
            return Err(VoucherError::Validation(format!(
                "{:?} cannot be propagated upstream",
                chain.event
            )));
        }

        let header = tx.load_header(chain.header_id).await?;
        match header {
            Some(header) if !header.soft_deleted && header.kind == chain.source_kind => {}
            _ => return Err(VoucherError::conflict(EntityKind::Header, chain.header_id)),
        }

        let transition = transition_row(
            tx,
            chain.row_id,
            chain.expected_token,
            chain.event,
            actor,
            None,
        )
        .await?;
        if transition.header_id != chain.header_id {
            return Err(VoucherError::conflict(EntityKind::Row, chain.row_id));
        }

        let header_status = settle_header(tx, chain.header_id, chain.event).await?;

        debug!(
            upstream_header = %chain.header_id,
            upstream_row = %chain.row_id,
            event = ?chain.event,
            row_status = %transition.status,
            header_status = %header_status,
            "Chain event propagated"
        );
        Ok(transition.token)
    }
}
