//! Pre-delete reference checks
//!
//! Each deletable entity has a fixed, ordered list of probes over the tables
//! known to reference it. The first probe with a non-zero live count aborts
//! the delete.
//!
//! The check runs inside the deleting transaction but takes no lock on the
//! referencing tables: a reference inserted by a concurrent transaction after
//! the probe and before the delete commits is not detected.

use tracing::debug;
use uuid::Uuid;

use crate::traits::StorageTransaction;
use crate::types::*;

/// One ordered reference check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCheck {
    /// Referencing subsystem, reported in the `InUse` error
    pub description: &'static str,
    pub probe: ReferenceProbe,
}

const fn check(description: &'static str, probe: ReferenceProbe) -> UsageCheck {
    UsageCheck { description, probe }
}

const DEPARTMENT_CHECKS: [UsageCheck; 4] = [
    check(
        "work orders",
        ReferenceProbe::HeaderDepartment(VoucherKind::WorkOrder),
    ),
    check(
        "execution orders",
        ReferenceProbe::HeaderDepartment(VoucherKind::ExecutionOrder),
    ),
    check(
        "issue resolution forms",
        ReferenceProbe::HeaderDepartment(VoucherKind::IssueResolution),
    ),
    check(
        "training records",
        ReferenceProbe::HeaderDepartment(VoucherKind::Training),
    ),
];

const PERSON_CHECKS: [UsageCheck; 4] = [
    check(
        "work order lines",
        ReferenceProbe::RowPerson(VoucherKind::WorkOrder),
    ),
    check(
        "execution order lines",
        ReferenceProbe::RowPerson(VoucherKind::ExecutionOrder),
    ),
    check(
        "issue resolution lines",
        ReferenceProbe::RowPerson(VoucherKind::IssueResolution),
    ),
    check(
        "training lines",
        ReferenceProbe::RowPerson(VoucherKind::Training),
    ),
];

const FILE_CHECKS: [UsageCheck; 1] = [check("attachments", ReferenceProbe::AttachmentFile)];

const RISK_LEVEL_CHECKS: [UsageCheck; 1] = [check(
    "work order lines",
    ReferenceProbe::RowRiskLevel(VoucherKind::WorkOrder),
)];

const WORK_ORDER_CHECKS: [UsageCheck; 1] = [check(
    "execution order lines",
    ReferenceProbe::RowSourceHeader(VoucherKind::ExecutionOrder),
)];

const EXECUTION_ORDER_CHECKS: [UsageCheck; 1] = [check(
    "issue resolution lines",
    ReferenceProbe::RowSourceHeader(VoucherKind::IssueResolution),
)];

/// The ordered check list for an entity
pub fn checks_for(entity: GuardedEntity) -> &'static [UsageCheck] {
    match entity {
        GuardedEntity::Department => &DEPARTMENT_CHECKS,
        GuardedEntity::Person => &PERSON_CHECKS,
        GuardedEntity::File => &FILE_CHECKS,
        GuardedEntity::RiskLevel => &RISK_LEVEL_CHECKS,
        GuardedEntity::WorkOrder => &WORK_ORDER_CHECKS,
        GuardedEntity::ExecutionOrder => &EXECUTION_ORDER_CHECKS,
    }
}

/// Runs the usage checks before a soft delete
pub struct UsageGuard;

impl UsageGuard {
    /// Fail with `InUse` on the first check that finds a live reference
    pub async fn ensure_unused(
        tx: &mut dyn StorageTransaction,
        entity: GuardedEntity,
        id: Uuid,
    ) -> VoucherResult<()> {
        for usage in checks_for(entity) {
            let count = tx.count_references(usage.probe, id).await?;
            if count > 0 {
                debug!(
                    entity = %entity,
                    id = %id,
                    referenced_by = usage.description,
                    count,
                    "Usage check failed"
                );
                return Err(VoucherError::InUse {
                    entity,
                    id,
                    referenced_by: usage.description,
                });
            }
        }
        Ok(())
    }
}
