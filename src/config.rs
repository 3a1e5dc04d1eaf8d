//! Engine configuration

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{VoucherError, VoucherResult};
use crate::voucher::serial::date_key;

/// Tunables for the voucher engine.
///
/// - `serial_width`: zero-padding of the per-day sequence (default: 4)
/// - `date_key_format`: chrono format of the date part of a bill number (default: `%Y%m%d`)
/// - `max_rows_per_voucher`: upper bound on live rows per voucher (default: 500)
/// - `identity_cache_capacity`: entries kept by the identity cache (default: 1024)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub serial_width: usize,
    pub date_key_format: String,
    pub max_rows_per_voucher: usize,
    pub identity_cache_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            serial_width: 4,
            date_key_format: "%Y%m%d".to_string(),
            max_rows_per_voucher: 500,
            identity_cache_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> VoucherResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VoucherError::Validation(format!("Invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> VoucherResult<()> {
        if !(1..=9).contains(&self.serial_width) {
            return Err(VoucherError::Validation(format!(
                "serial_width must be between 1 and 9, got {}",
                self.serial_width
            )));
        }
        if self.date_key_format.trim().is_empty() {
            return Err(VoucherError::Validation(
                "date_key_format cannot be empty".to_string(),
            ));
        }
        // Formats naming time fields cannot render a date
        let sample = NaiveDate::from_ymd_opt(2000, 1, 1)
            .ok_or_else(|| VoucherError::Internal("sample date out of range".to_string()))?;
        date_key(sample, &self.date_key_format)?;
        if self.max_rows_per_voucher == 0 {
            return Err(VoucherError::Validation(
                "max_rows_per_voucher must be positive".to_string(),
            ));
        }
        if self.identity_cache_capacity == 0 {
            return Err(VoucherError::Validation(
                "identity_cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
