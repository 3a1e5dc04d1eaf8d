//! Validation utilities

use bigdecimal::BigDecimal;

use crate::traits::*;
use crate::types::*;

/// Validate a free-text field that must be present and bounded
pub fn validate_text(field: &str, value: &str, max_len: usize) -> VoucherResult<()> {
    if value.trim().is_empty() {
        return Err(VoucherError::Validation(format!("{field} cannot be empty")));
    }

    if value.chars().count() > max_len {
        return Err(VoucherError::Validation(format!(
            "{field} cannot exceed {max_len} characters"
        )));
    }

    Ok(())
}

/// Validate that an amount is not negative
pub fn validate_non_negative(field: &str, amount: &BigDecimal) -> VoucherResult<()> {
    if *amount < BigDecimal::from(0) {
        Err(VoucherError::Validation(format!(
            "{field} cannot be negative"
        )))
    } else {
        Ok(())
    }
}

/// Validate that an amount is positive
pub fn validate_positive(field: &str, amount: &BigDecimal) -> VoucherResult<()> {
    if *amount <= BigDecimal::from(0) {
        Err(VoucherError::Validation(format!("{field} must be positive")))
    } else {
        Ok(())
    }
}

/// Validate a voucher description
pub fn validate_description(description: &str) -> VoucherResult<()> {
    validate_text("Voucher description", description, 500)
}

/// Validator that checks every payload field in addition to the defaults
pub struct EnhancedVoucherValidator;

impl VoucherValidator for EnhancedVoucherValidator {
    fn validate_header(&self, kind: VoucherKind, description: &str) -> VoucherResult<()> {
        DefaultVoucherValidator.validate_header(kind, description)?;
        validate_description(description)
    }

    fn validate_payload(&self, kind: VoucherKind, payload: &RowPayload) -> VoucherResult<()> {
        DefaultVoucherValidator.validate_payload(kind, payload)?;

        match payload {
            RowPayload::WorkOrder(line) => {
                validate_text("Hazard", &line.hazard, 500)?;
                validate_text("Rectification requirement", &line.rectification, 1000)?;
            }
            RowPayload::ExecutionOrder(line) => {
                validate_text("Measure", &line.measure, 1000)?;
            }
            RowPayload::IssueResolution(line) => {
                validate_text("Resolution note", &line.note, 1000)?;
                validate_non_negative("Resolution cost", &line.cost)?;
            }
            RowPayload::Training(line) => {
                validate_text("Training topic", &line.topic, 200)?;
                validate_positive("Training hours", &line.hours)?;
            }
        }

        Ok(())
    }
}
