//! Integration tests for safety-vouchers

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use safety_vouchers::utils::{EnhancedVoucherValidator, IdentityCache, MemoryStorage};
use safety_vouchers::*;
use std::sync::Arc;
use uuid::Uuid;

struct Site {
    engine: VoucherEngine<MemoryStorage>,
    admin: Uuid,
    department: Uuid,
    person: Uuid,
    risk_level: Uuid,
    date: NaiveDate,
}

async fn site() -> Site {
    let engine = VoucherEngine::new(MemoryStorage::new());
    let admin = Uuid::new_v4();
    let department = engine
        .register_master(MasterKind::Department, "Tower B site office", admin)
        .await
        .unwrap()
        .id;
    let person = engine
        .register_master(MasterKind::Person, "Li Wei", admin)
        .await
        .unwrap()
        .id;
    let risk_level = engine
        .register_master(MasterKind::RiskLevel, "High", admin)
        .await
        .unwrap()
        .id;
    Site {
        engine,
        admin,
        department,
        person,
        risk_level,
        date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
    }
}

impl Site {
    fn wo_line(&self, hazard: &str) -> RowPayload {
        RowPayload::WorkOrder(WorkOrderLine {
            hazard: hazard.to_string(),
            rectification: "Install guard rail".to_string(),
            responsible_person_id: self.person,
            risk_level_id: self.risk_level,
            deadline: self.date,
        })
    }

    fn eo_line(&self) -> RowPayload {
        RowPayload::ExecutionOrder(ExecutionLine {
            measure: "Guard rail installed on level 3".to_string(),
            executor_id: self.person,
            planned_finish: self.date,
        })
    }

    fn ir_line(&self) -> RowPayload {
        RowPayload::IssueResolution(ResolutionLine {
            note: "Rail load-tested".to_string(),
            verifier_id: self.person,
            cost: BigDecimal::from(120),
        })
    }

    fn tr_line(&self, trainee: Uuid) -> RowPayload {
        RowPayload::Training(TrainingLine {
            trainee_id: trainee,
            topic: "Working at height".to_string(),
            hours: BigDecimal::from(4),
            passed: false,
        })
    }

    async fn work_order(&self, hazards: &[&str]) -> Voucher {
        let mut builder = VoucherBuilder::new(
            VoucherKind::WorkOrder,
            self.date,
            "Weekly inspection",
            self.department,
        );
        for hazard in hazards {
            builder = builder.row(self.wo_line(hazard));
        }
        self.engine.add(builder.build(), self.admin).await.unwrap()
    }

    async fn confirmed_work_order(&self, hazards: &[&str]) -> Voucher {
        let wo = self.work_order(hazards).await;
        self.engine
            .confirm(wo.header.id, &wo.tokens(), self.admin)
            .await
            .unwrap()
    }

    /// Execution order with one line per given work order row
    async fn execution_order(&self, wo: &Voucher) -> VoucherResult<Voucher> {
        let mut builder = VoucherBuilder::new(
            VoucherKind::ExecutionOrder,
            self.date,
            "Rectification",
            self.department,
        );
        for row in wo.live_rows() {
            builder = builder.linked_row(
                self.eo_line(),
                SourceLink::to_row(VoucherKind::WorkOrder, row),
            );
        }
        self.engine.add(builder.build(), self.admin).await
    }

    async fn reload(&self, voucher: &Voucher) -> Voucher {
        self.engine.get_voucher(voucher.header.id).await.unwrap()
    }
}

#[tokio::test]
async fn test_work_order_chain_scenario() {
    let site = site().await;

    // Add a work order with one Free row
    let wo = site.work_order(&["Open edge on level 3"]).await;
    assert_eq!(wo.header.status, RowStatus::Free);
    assert_eq!(wo.header.bill_number, "WO202403150001");
    assert_eq!(wo.rows.len(), 1);
    assert_eq!(wo.rows[0].status, RowStatus::Free);
    assert_eq!(wo.rows[0].row_no, 1);

    // Confirm: header and row become Confirmed
    let wo = site
        .engine
        .confirm(wo.header.id, &wo.tokens(), site.admin)
        .await
        .unwrap();
    assert_eq!(wo.header.status, RowStatus::Confirmed);
    assert_eq!(wo.rows[0].status, RowStatus::Confirmed);
    assert_eq!(wo.header.confirmed.as_ref().unwrap().by, site.admin);
    let confirmed_row_token = wo.rows[0].token;

    // Execution order linked to the work order row
    let eo = site.execution_order(&wo).await.unwrap();
    let wo = site.reload(&wo).await;
    assert_eq!(wo.rows[0].status, RowStatus::Executing);
    assert_eq!(wo.header.status, RowStatus::Executing);
    assert!(wo.rows[0].token > confirmed_row_token);
    let link = eo.rows[0].source.as_ref().unwrap();
    assert_eq!(link.source_row_id, wo.rows[0].id);
    assert_eq!(link.source_row_token, wo.rows[0].token);

    // Deleting the execution order reverts the work order
    site.engine
        .delete(eo.header.id, &eo.tokens(), site.admin)
        .await
        .unwrap();
    let eo = site.reload(&eo).await;
    assert!(eo.header.soft_deleted);
    assert!(eo.rows.iter().all(|row| row.soft_deleted));
    let wo = site.reload(&wo).await;
    assert_eq!(wo.rows[0].status, RowStatus::Confirmed);
    assert_eq!(wo.header.status, RowStatus::Confirmed);

    // UnConfirm is self-reversal only
    let stranger = Uuid::new_v4();
    let err = site
        .engine
        .unconfirm(wo.header.id, &wo.tokens(), stranger)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GuardViolation);

    let wo = site
        .engine
        .unconfirm(wo.header.id, &wo.tokens(), site.admin)
        .await
        .unwrap();
    assert_eq!(wo.header.status, RowStatus::Free);
    assert_eq!(wo.rows[0].status, RowStatus::Free);
    assert!(wo.header.confirmed.is_none());
    assert!(wo.rows[0].confirmed.is_none());
}

#[tokio::test]
async fn test_stale_token_always_conflicts_and_changes_nothing() {
    let site = site().await;
    let wo = site.work_order(&["Loose scaffold board"]).await;
    let stale = wo.header.token;

    let edited = site
        .engine
        .edit(
            EditVoucher::new(wo.header.id, stale).description("Scaffold walk-down"),
            site.admin,
        )
        .await
        .unwrap();
    assert!(edited.header.token > stale);
    assert_eq!(edited.header.description, "Scaffold walk-down");

    let err = site
        .engine
        .edit(
            EditVoucher::new(wo.header.id, stale).description("Overwritten"),
            site.admin,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(site.reload(&wo).await, edited);

    // Confirm with the stale header token is rejected the same way
    let mut tokens = edited.tokens();
    tokens.header = stale;
    let err = site
        .engine
        .confirm(wo.header.id, &tokens, site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(site.reload(&wo).await, edited);
}

#[tokio::test]
async fn test_deleted_voucher_still_reports_conflict() {
    let site = site().await;
    let wo = site.work_order(&["Missing toe board"]).await;
    let tokens = wo.tokens();

    site.engine
        .delete(wo.header.id, &tokens, site.admin)
        .await
        .unwrap();
    let err = site
        .engine
        .delete(wo.header.id, &tokens, site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let deleted = site.reload(&wo).await;
    let err = site
        .engine
        .delete(wo.header.id, &deleted.tokens(), site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_concurrent_confirms_one_wins() {
    let site = site().await;
    let wo = site.work_order(&["Unguarded opening"]).await;
    let tokens = wo.tokens();

    let first = site.engine.confirm(wo.header.id, &tokens, site.admin).await;
    let second = site.engine.confirm(wo.header.id, &tokens, site.admin).await;
    assert!(first.is_ok());
    assert_eq!(second.unwrap_err().kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_confirm_with_one_stale_row_changes_nothing() {
    let site = site().await;
    let wo = site.work_order(&["A", "B", "C"]).await;

    let mut tokens = wo.tokens();
    tokens
        .rows
        .insert(wo.rows[1].id, ConcurrencyToken::new(u64::MAX));
    let err = site
        .engine
        .confirm(wo.header.id, &tokens, site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(site.reload(&wo).await, wo);

    // A token set missing a live row is stale as well
    let mut tokens = wo.tokens();
    tokens.rows.remove(&wo.rows[2].id);
    let err = site
        .engine
        .confirm(wo.header.id, &tokens, site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(site.reload(&wo).await, wo);
}

#[tokio::test]
async fn test_failed_propagation_rolls_back_earlier_writes() {
    let site = site().await;
    let wo = site.confirmed_work_order(&["Edge 1", "Edge 2"]).await;
    let eo = site.execution_order(&wo).await.unwrap();
    let wo = site.reload(&wo).await;

    // Move the second upstream row's token behind the engine's back
    let upstream = wo.rows[1].clone();
    let mut tx = site.engine.storage().begin().await.unwrap();
    tx.update_row(
        &WriteCondition::new(upstream.id, upstream.token),
        RowChange::Status {
            status: RowStatus::Executing,
            confirmed: ConfirmStamp::Keep,
            link_token: None,
        },
    )
    .await
    .unwrap()
    .unwrap();
    tx.commit().await.unwrap();

    // Header write and the first row's propagation succeed, the second fails
    let err = site
        .engine
        .confirm(eo.header.id, &eo.tokens(), site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let eo_after = site.reload(&eo).await;
    assert_eq!(eo_after, eo);
    let wo_after = site.reload(&wo).await;
    assert_eq!(wo_after.header, wo.header);
    assert_eq!(wo_after.rows[0], wo.rows[0]);
    assert_eq!(wo_after.rows[0].status, RowStatus::Executing);
}

#[tokio::test]
async fn test_three_tier_chain() {
    let site = site().await;
    let wo = site.confirmed_work_order(&["Open edge"]).await;
    let eo = site.execution_order(&wo).await.unwrap();

    // Confirming the execution order completes the work order
    let eo = site
        .engine
        .confirm(eo.header.id, &eo.tokens(), site.admin)
        .await
        .unwrap();
    let wo = site.reload(&wo).await;
    assert_eq!(wo.rows[0].status, RowStatus::Completed);
    assert_eq!(wo.header.status, RowStatus::Completed);
    assert_eq!(
        eo.rows[0].source.as_ref().unwrap().source_row_token,
        wo.rows[0].token
    );

    // Issue resolution from the execution order row
    let ir = site
        .engine
        .add(
            VoucherBuilder::new(
                VoucherKind::IssueResolution,
                site.date,
                "Verification",
                site.department,
            )
            .linked_row(
                site.ir_line(),
                SourceLink::to_row(VoucherKind::ExecutionOrder, &eo.rows[0]),
            )
            .build(),
            site.admin,
        )
        .await
        .unwrap();
    assert_eq!(ir.header.bill_number, "IR202403150001");
    let eo = site.reload(&eo).await;
    assert_eq!(eo.rows[0].status, RowStatus::Executing);
    assert_eq!(eo.header.status, RowStatus::Executing);

    // Propagation is one hop: the work order is untouched
    assert_eq!(site.reload(&wo).await, wo);

    // The execution order cannot be unconfirmed while its row is executing
    let err = site
        .engine
        .unconfirm(eo.header.id, &eo.tokens(), site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GuardViolation);

    let ir = site
        .engine
        .confirm(ir.header.id, &ir.tokens(), site.admin)
        .await
        .unwrap();
    assert_eq!(ir.header.status, RowStatus::Confirmed);
    let eo = site.reload(&eo).await;
    assert_eq!(eo.rows[0].status, RowStatus::Completed);
    assert_eq!(eo.header.status, RowStatus::Completed);

    let ir = site
        .engine
        .unconfirm(ir.header.id, &ir.tokens(), site.admin)
        .await
        .unwrap();
    assert_eq!(ir.header.status, RowStatus::Free);
    let eo = site.reload(&eo).await;
    assert_eq!(eo.rows[0].status, RowStatus::Executing);
    assert_eq!(eo.header.status, RowStatus::Executing);
}

#[tokio::test]
async fn test_stale_source_link_aborts_creation() {
    let site = site().await;
    let wo = site.work_order(&["Trip hazard"]).await;
    // Link formed before the work order was confirmed
    let stale_link = SourceLink::to_row(VoucherKind::WorkOrder, &wo.rows[0]);
    let wo = site
        .engine
        .confirm(wo.header.id, &wo.tokens(), site.admin)
        .await
        .unwrap();

    let request = VoucherBuilder::new(
        VoucherKind::ExecutionOrder,
        site.date,
        "Rectification",
        site.department,
    )
    .linked_row(site.eo_line(), stale_link)
    .build();
    let err = site.engine.add(request, site.admin).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(site.reload(&wo).await, wo);
    // The serial allocated inside the failed transaction was rolled back
    assert!(site
        .engine
        .storage()
        .serial_counter("EO", "20240315")
        .await
        .is_none());
}

#[tokio::test]
async fn test_wrong_source_kind_is_rejected() {
    let site = site().await;
    let wo = site.confirmed_work_order(&["Trip hazard"]).await;
    let request = VoucherBuilder::new(
        VoucherKind::IssueResolution,
        site.date,
        "Verification",
        site.department,
    )
    .linked_row(
        site.ir_line(),
        SourceLink::to_row(VoucherKind::WorkOrder, &wo.rows[0]),
    )
    .build();
    let err = site.engine.add(request, site.admin).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_get_contiguous_serials() {
    let site = site().await;
    let engine = Arc::new(site.engine);
    let line = RowPayload::WorkOrder(WorkOrderLine {
        hazard: "Blocked fire exit".to_string(),
        rectification: "Clear the exit".to_string(),
        responsible_person_id: site.person,
        risk_level_id: site.risk_level,
        deadline: site.date,
    });

    let mut handles = Vec::new();
    for _ in 0..24 {
        let engine = engine.clone();
        let request = VoucherBuilder::new(
            VoucherKind::WorkOrder,
            site.date,
            "Daily patrol",
            site.department,
        )
        .row(line.clone())
        .build();
        let admin = site.admin;
        handles.push(tokio::spawn(
            async move { engine.add(request, admin).await },
        ));
    }

    let mut serials = Vec::new();
    for handle in handles {
        serials.push(handle.await.unwrap().unwrap().header.bill_number);
    }
    serials.sort();
    let expected: Vec<String> = (1..=24).map(|n| format!("WO20240315{n:04}")).collect();
    assert_eq!(serials, expected);
}

#[tokio::test]
async fn test_serials_restart_per_day_and_type() {
    let site = site().await;
    let first = site.work_order(&["A"]).await;
    let second = site.work_order(&["B"]).await;
    assert_eq!(first.header.bill_number, "WO202403150001");
    assert_eq!(second.header.bill_number, "WO202403150002");

    let next_day = site
        .engine
        .add(
            VoucherBuilder::new(
                VoucherKind::WorkOrder,
                site.date.succ_opt().unwrap(),
                "Weekly inspection",
                site.department,
            )
            .row(site.wo_line("C"))
            .build(),
            site.admin,
        )
        .await
        .unwrap();
    assert_eq!(next_day.header.bill_number, "WO202403160001");

    let training = site
        .engine
        .add(
            VoucherBuilder::new(
                VoucherKind::Training,
                site.date,
                "Induction",
                site.department,
            )
            .row(site.tr_line(site.person))
            .build(),
            site.admin,
        )
        .await
        .unwrap();
    assert_eq!(training.header.bill_number, "TR202403150001");
}

#[tokio::test]
async fn test_usage_guard_names_the_referencing_table() {
    let site = site().await;
    let trainee = site
        .engine
        .register_master(MasterKind::Person, "Apprentice", site.admin)
        .await
        .unwrap();
    let training = site
        .engine
        .add(
            VoucherBuilder::new(
                VoucherKind::Training,
                site.date,
                "Induction",
                site.department,
            )
            .row(site.tr_line(trainee.id))
            .build(),
            site.admin,
        )
        .await
        .unwrap();

    let err = site
        .engine
        .delete_master(trainee.id, trainee.token, site.admin)
        .await
        .unwrap_err();
    match err {
        VoucherError::InUse {
            entity,
            id,
            referenced_by,
        } => {
            assert_eq!(entity, GuardedEntity::Person);
            assert_eq!(id, trainee.id);
            assert_eq!(referenced_by, "training lines");
        }
        other => panic!("expected InUse, got {other:?}"),
    }
    let stored = site
        .engine
        .storage()
        .get_master(trainee.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!stored.soft_deleted);
    assert_eq!(stored.token, trainee.token);

    // Once the referencing voucher is gone the delete goes through
    site.engine
        .delete(training.header.id, &training.tokens(), site.admin)
        .await
        .unwrap();
    site.engine
        .delete_master(trainee.id, trainee.token, site.admin)
        .await
        .unwrap();
    let stored = site
        .engine
        .storage()
        .get_master(trainee.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.soft_deleted);
}

#[tokio::test]
async fn test_usage_guard_checks_in_order() {
    let site = site().await;
    let _wo = site.work_order(&["Open edge"]).await;
    let department = site
        .engine
        .storage()
        .get_master(site.department)
        .await
        .unwrap()
        .unwrap();
    let err = site
        .engine
        .delete_master(site.department, department.token, site.admin)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoucherError::InUse {
            referenced_by: "work orders",
            ..
        }
    ));

    let person = site
        .engine
        .storage()
        .get_master(site.person)
        .await
        .unwrap()
        .unwrap();
    let err = site
        .engine
        .delete_master(site.person, person.token, site.admin)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoucherError::InUse {
            referenced_by: "work order lines",
            ..
        }
    ));
}

#[tokio::test]
async fn test_edit_adds_updates_and_removes_rows() {
    let site = site().await;
    let wo = site.work_order(&["First", "Second"]).await;

    let edited = site
        .engine
        .edit(
            EditVoucher::new(wo.header.id, wo.header.token)
                .update_row(wo.rows[0].id, wo.rows[0].token, site.wo_line("First, revised"))
                .remove_row(wo.rows[1].id, wo.rows[1].token)
                .add_row(NewRow::new(site.wo_line("Third"))),
            site.admin,
        )
        .await
        .unwrap();

    let live: Vec<_> = edited.live_rows().collect();
    assert_eq!(live.len(), 2);
    assert_eq!(live[0].row_no, 1);
    assert_eq!(live[1].row_no, 3);
    match &live[0].payload {
        RowPayload::WorkOrder(line) => assert_eq!(line.hazard, "First, revised"),
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(live[0].token > wo.rows[0].token);
    let removed = edited.row(wo.rows[1].id).unwrap();
    assert!(removed.soft_deleted);
    assert!(removed.deleted.is_some());
}

#[tokio::test]
async fn test_edit_that_empties_voucher_is_rejected() {
    let site = site().await;
    let wo = site.work_order(&["Only row"]).await;
    let err = site
        .engine
        .edit(
            EditVoucher::new(wo.header.id, wo.header.token)
                .remove_row(wo.rows[0].id, wo.rows[0].token),
            site.admin,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyBody);
    assert_eq!(site.reload(&wo).await, wo);
}

#[tokio::test]
async fn test_add_without_rows_is_empty_body() {
    let site = site().await;
    let request = VoucherBuilder::new(
        VoucherKind::WorkOrder,
        site.date,
        "Nothing found",
        site.department,
    )
    .build();
    let err = site.engine.add(request, site.admin).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyBody);
}

#[tokio::test]
async fn test_confirmed_voucher_is_not_editable() {
    let site = site().await;
    let wo = site.confirmed_work_order(&["Open edge"]).await;

    let err = site
        .engine
        .edit(
            EditVoucher::new(wo.header.id, wo.header.token).description("Late change"),
            site.admin,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEditable);

    let err = site
        .engine
        .delete(wo.header.id, &wo.tokens(), site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEditable);

    let err = site
        .engine
        .confirm(wo.header.id, &wo.tokens(), site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEditable);
}

#[tokio::test]
async fn test_unconfirm_of_free_voucher_is_not_editable() {
    let site = site().await;
    let wo = site.work_order(&["Open edge"]).await;
    let err = site
        .engine
        .unconfirm(wo.header.id, &wo.tokens(), site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEditable);
}

#[tokio::test]
async fn test_training_header_follows_rows() {
    let site = site().await;
    let other = site
        .engine
        .register_master(MasterKind::Person, "Zhang Min", site.admin)
        .await
        .unwrap();
    let training = site
        .engine
        .add(
            VoucherBuilder::new(
                VoucherKind::Training,
                site.date,
                "Fall protection",
                site.department,
            )
            .row(site.tr_line(site.person))
            .row(site.tr_line(other.id))
            .build(),
            site.admin,
        )
        .await
        .unwrap();
    let training = site
        .engine
        .confirm(training.header.id, &training.tokens(), site.admin)
        .await
        .unwrap();
    let id = training.header.id;

    let step = |voucher: &Voucher, row_no: u32| {
        let row = voucher.row_no(row_no).unwrap();
        (row.id, row.token)
    };

    let (row, token) = step(&training, 1);
    let training = site
        .engine
        .apply_training_event(id, row, token, RowEvent::Execute, site.admin)
        .await
        .unwrap();
    assert_eq!(training.header.status, RowStatus::Executing);

    let (row, token) = step(&training, 1);
    let training = site
        .engine
        .apply_training_event(id, row, token, RowEvent::Complete, site.admin)
        .await
        .unwrap();
    // rows [Completed, Confirmed]
    assert_eq!(training.header.status, RowStatus::Executing);

    let (row, token) = step(&training, 2);
    let training = site
        .engine
        .apply_training_event(id, row, token, RowEvent::Execute, site.admin)
        .await
        .unwrap();
    let (row, token) = step(&training, 2);
    let training = site
        .engine
        .apply_training_event(id, row, token, RowEvent::Complete, site.admin)
        .await
        .unwrap();
    assert_eq!(training.header.status, RowStatus::Completed);

    let (row, token) = step(&training, 2);
    let training = site
        .engine
        .apply_training_event(id, row, token, RowEvent::CancelComplete, site.admin)
        .await
        .unwrap();
    assert_eq!(training.header.status, RowStatus::Executing);

    // Completing twice is rejected by precondition, not double-applied
    let (row, token) = step(&training, 1);
    let err = site
        .engine
        .apply_training_event(id, row, token, RowEvent::Complete, site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotEditable);
}

#[tokio::test]
async fn test_training_events_only_for_training_records() {
    let site = site().await;
    let wo = site.confirmed_work_order(&["Open edge"]).await;
    let err = site
        .engine
        .apply_training_event(
            wo.header.id,
            wo.rows[0].id,
            wo.rows[0].token,
            RowEvent::Execute,
            site.admin,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(site.reload(&wo).await, wo);
}

#[tokio::test]
async fn test_attachments_are_versioned_independently() {
    let site = site().await;
    let file = site
        .engine
        .register_master(MasterKind::File, "photo-001.jpg", site.admin)
        .await
        .unwrap();
    let wo = site
        .engine
        .add(
            VoucherBuilder::new(
                VoucherKind::WorkOrder,
                site.date,
                "Photo evidence",
                site.department,
            )
            .new_row(NewRow::new(site.wo_line("Open edge")).with_file(file.id))
            .build(),
            site.admin,
        )
        .await
        .unwrap();
    assert_eq!(wo.live_attachments().count(), 1);

    let extra = site
        .engine
        .attach(wo.header.id, wo.rows[0].id, Uuid::new_v4(), site.admin)
        .await
        .unwrap();
    let after_attach = site.reload(&wo).await;
    assert_eq!(after_attach.header, wo.header);
    assert_eq!(after_attach.rows, wo.rows);
    assert_eq!(after_attach.live_attachments().count(), 2);

    let err = site
        .engine
        .detach(extra.id, ConcurrencyToken::new(0), site.admin)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    site.engine
        .detach(extra.id, extra.token, site.admin)
        .await
        .unwrap();

    // The file is still referenced by the original attachment
    let err = site
        .engine
        .delete_master(file.id, file.token, site.admin)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VoucherError::InUse {
            referenced_by: "attachments",
            ..
        }
    ));

    // Deleting the voucher removes its attachments too
    let wo = site.reload(&wo).await;
    site.engine
        .delete(wo.header.id, &wo.tokens(), site.admin)
        .await
        .unwrap();
    assert_eq!(site.reload(&wo).await.live_attachments().count(), 0);
    site.engine
        .delete_master(file.id, file.token, site.admin)
        .await
        .unwrap();
}

struct FileServer;

impl AttachmentLocator for FileServer {
    fn locate(&self, file_id: Uuid) -> Option<String> {
        Some(format!("https://files.example.com/{file_id}"))
    }
}

#[tokio::test]
async fn test_describe_voucher_resolves_names_and_urls() {
    let site = site().await;
    let engine = VoucherEngine::new(MemoryStorage::new())
        .with_attachment_locator(Box::new(FileServer))
        .with_validator(Box::new(EnhancedVoucherValidator));
    let department = engine
        .register_master(MasterKind::Department, "Tower B site office", site.admin)
        .await
        .unwrap();
    let person = engine
        .register_master(MasterKind::Person, "Li Wei", site.admin)
        .await
        .unwrap();
    let file_id = Uuid::new_v4();

    let training = engine
        .add(
            VoucherBuilder::new(
                VoucherKind::Training,
                site.date,
                "Induction",
                department.id,
            )
            .new_row(NewRow::new(site.tr_line(person.id)).with_file(file_id))
            .build(),
            site.admin,
        )
        .await
        .unwrap();

    let view = engine.describe_voucher(training.header.id).await.unwrap();
    assert_eq!(view.department.as_deref(), Some("Tower B site office"));
    assert_eq!(view.rows.len(), 1);
    assert_eq!(view.rows[0].person.as_deref(), Some("Li Wei"));
    assert_eq!(
        view.rows[0].attachment_urls,
        vec![format!("https://files.example.com/{file_id}")]
    );
}

#[tokio::test]
async fn test_enhanced_validator_blocks_bad_payloads() {
    let site = site().await;
    let engine =
        VoucherEngine::new(MemoryStorage::new()).with_validator(Box::new(EnhancedVoucherValidator));
    let mut line = match site.tr_line(site.person) {
        RowPayload::Training(line) => line,
        _ => unreachable!(),
    };
    line.hours = BigDecimal::from(0);
    let request = VoucherBuilder::new(
        VoucherKind::Training,
        site.date,
        "Induction",
        site.department,
    )
    .row(RowPayload::Training(line))
    .build();
    let err = engine.add(request, site.admin).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_config_controls_serial_format() {
    let config = EngineConfig::from_json(r#"{ "serial_width": 6, "date_key_format": "%y%m%d" }"#)
        .unwrap();
    let engine = VoucherEngine::with_config(MemoryStorage::new(), config).unwrap();
    let admin = Uuid::new_v4();
    let request = VoucherBuilder::new(
        VoucherKind::Training,
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
        "Induction",
        Uuid::new_v4(),
    )
    .row(RowPayload::Training(TrainingLine {
        trainee_id: Uuid::new_v4(),
        topic: "Site rules".to_string(),
        hours: BigDecimal::from(1),
        passed: true,
    }))
    .build();
    let voucher = engine.add(request, admin).await.unwrap();
    assert_eq!(voucher.header.bill_number, "TR240315000001");

    let bad = EngineConfig {
        serial_width: 0,
        ..EngineConfig::default()
    };
    assert!(VoucherEngine::with_config(MemoryStorage::new(), bad).is_err());

    // Hour fields cannot be rendered from a business date
    let hourly = EngineConfig {
        date_key_format: "%Y%m%d%H".to_string(),
        ..EngineConfig::default()
    };
    let err = VoucherEngine::with_config(MemoryStorage::new(), hourly)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_deleting_master_drops_cached_identity() {
    let storage = MemoryStorage::new();
    let cache = Arc::new(IdentityCache::new(storage.clone(), 16));
    let engine = VoucherEngine::new(storage).with_identity_directory(cache.clone());
    let admin = Uuid::new_v4();
    let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

    let department = engine
        .register_master(MasterKind::Department, "Tower C site office", admin)
        .await
        .unwrap();
    let trainee = engine
        .register_master(MasterKind::Person, "Wang Fang", admin)
        .await
        .unwrap();
    let training = engine
        .add(
            VoucherBuilder::new(VoucherKind::Training, date, "Induction", department.id)
                .row(RowPayload::Training(TrainingLine {
                    trainee_id: trainee.id,
                    topic: "Site rules".to_string(),
                    hours: BigDecimal::from(2),
                    passed: true,
                }))
                .build(),
            admin,
        )
        .await
        .unwrap();

    // Warm the cache through the display path
    let view = engine.describe_voucher(training.header.id).await.unwrap();
    assert_eq!(view.department.as_deref(), Some("Tower C site office"));
    assert_eq!(view.rows[0].person.as_deref(), Some("Wang Fang"));
    assert_eq!(cache.len(), 2);

    // An unreferenced person, looked up once and then deleted
    let visitor = engine
        .register_master(MasterKind::Person, "Visitor", admin)
        .await
        .unwrap();
    let cached = cache.lookup(visitor.id).await.unwrap().unwrap();
    assert_eq!(cached.display_name, "Visitor");
    engine
        .delete_master(visitor.id, visitor.token, admin)
        .await
        .unwrap();
    assert!(cache.lookup(visitor.id).await.unwrap().is_none());

    // Once the training record is gone its department can be deleted too
    engine
        .delete(training.header.id, &training.tokens(), admin)
        .await
        .unwrap();
    engine
        .delete_master(department.id, department.token, admin)
        .await
        .unwrap();
    let view = engine.describe_voucher(training.header.id).await.unwrap();
    assert!(view.department.is_none());
}
