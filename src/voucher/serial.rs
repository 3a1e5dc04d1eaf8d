//! Bill number allocation

use chrono::NaiveDate;
use std::fmt::Write;
use tracing::debug;

use crate::config::EngineConfig;
use crate::traits::StorageTransaction;
use crate::types::*;

/// Format the date part of a bill number.
///
/// Fails with `Validation` when the format names fields a date does not
/// carry (time of day, offsets) or is not a valid chrono format.
pub fn date_key(date: NaiveDate, format: &str) -> VoucherResult<String> {
    let mut key = String::new();
    write!(key, "{}", date.format(format)).map_err(|_| {
        VoucherError::Validation(format!("'{format}' cannot format a calendar date"))
    })?;
    Ok(key)
}

/// `{typeCode}{dateKey}{zero-padded sequence}`
pub fn format_serial(type_code: &str, date_key: &str, sequence: u64, width: usize) -> String {
    format!("{type_code}{date_key}{sequence:0width$}")
}

/// Mints bill numbers inside the caller's transaction
pub struct SerialNumberAllocator<'a> {
    config: &'a EngineConfig,
}

impl<'a> SerialNumberAllocator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Allocate the next bill number for the voucher type and business date.
    ///
    /// The counter row stays locked until the enclosing transaction ends, so a
    /// rollback also returns the sequence.
    pub async fn allocate(
        &self,
        tx: &mut dyn StorageTransaction,
        kind: VoucherKind,
        business_date: NaiveDate,
    ) -> VoucherResult<String> {
        let key = date_key(business_date, &self.config.date_key_format)?;
        let sequence = tx.next_serial(kind.type_code(), &key).await?;
        let serial = format_serial(kind.type_code(), &key, sequence, self.config.serial_width);
        debug!(%serial, sequence, "Serial number allocated");
        Ok(serial)
    }
}
