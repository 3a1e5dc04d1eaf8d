//! Walks a hazard through the full work order, execution order and issue
//! resolution chain against the in-memory store.
//!
//! Run with `RUST_LOG=safety_vouchers=debug` to see every transition and hop.

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use safety_vouchers::utils::{DefaultMessages, MemoryStorage};
use safety_vouchers::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> VoucherResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine = VoucherEngine::new(MemoryStorage::new());
    let officer = Uuid::new_v4();
    let date = NaiveDate::from_ymd_opt(2024, 3, 15)
        .ok_or_else(|| VoucherError::Validation("invalid date".to_string()))?;

    let department = engine
        .register_master(MasterKind::Department, "Tower B site office", officer)
        .await?;
    let foreman = engine
        .register_master(MasterKind::Person, "Li Wei", officer)
        .await?;
    let high = engine
        .register_master(MasterKind::RiskLevel, "High", officer)
        .await?;

    let wo = engine
        .add(
            VoucherBuilder::new(VoucherKind::WorkOrder, date, "Weekly inspection", department.id)
                .row(RowPayload::WorkOrder(WorkOrderLine {
                    hazard: "Open edge on level 3".to_string(),
                    rectification: "Install guard rail".to_string(),
                    responsible_person_id: foreman.id,
                    risk_level_id: high.id,
                    deadline: date,
                }))
                .build(),
            officer,
        )
        .await?;
    let wo = engine.confirm(wo.header.id, &wo.tokens(), officer).await?;
    println!("{} is {}", wo.header.bill_number, wo.header.status);

    let eo = engine
        .add(
            VoucherBuilder::new(VoucherKind::ExecutionOrder, date, "Rectification", department.id)
                .linked_row(
                    RowPayload::ExecutionOrder(ExecutionLine {
                        measure: "Guard rail installed".to_string(),
                        executor_id: foreman.id,
                        planned_finish: date,
                    }),
                    SourceLink::to_row(VoucherKind::WorkOrder, &wo.rows[0]),
                )
                .build(),
            officer,
        )
        .await?;
    let eo = engine.confirm(eo.header.id, &eo.tokens(), officer).await?;
    let wo = engine.get_voucher(wo.header.id).await?;
    println!("{} is {}", wo.header.bill_number, wo.header.status);

    let ir = engine
        .add(
            VoucherBuilder::new(VoucherKind::IssueResolution, date, "Verification", department.id)
                .linked_row(
                    RowPayload::IssueResolution(ResolutionLine {
                        note: "Rail load-tested".to_string(),
                        verifier_id: foreman.id,
                        cost: BigDecimal::from(120),
                    }),
                    SourceLink::to_row(VoucherKind::ExecutionOrder, &eo.rows[0]),
                )
                .build(),
            officer,
        )
        .await?;
    engine.confirm(ir.header.id, &ir.tokens(), officer).await?;
    let eo = engine.get_voucher(eo.header.id).await?;
    println!("{} is {}", eo.header.bill_number, eo.header.status);

    // The foreman is still referenced, so the delete is refused
    if let Err(err) = engine.delete_master(foreman.id, foreman.token, officer).await {
        let messages = DefaultMessages;
        let text = messages
            .message(err.kind(), "en")
            .unwrap_or_else(|| err.to_string());
        println!("delete refused: {text} ({err})");
    }

    let view = engine.describe_voucher(wo.header.id).await?;
    for row in &view.rows {
        println!(
            "row {} [{}] responsible: {}",
            row.row_no,
            row.status,
            row.person.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
