//! # Safety Vouchers
//!
//! Lifecycle engine for construction-site safety paperwork: work orders spawn
//! execution orders, which spawn issue resolution forms; training records
//! follow a single-tier lifecycle.
//!
//! ## Features
//!
//! - **Optimistic concurrency**: every header, row and attachment write is
//!   conditional on a per-record version token
//! - **Row state machine**: Free → Confirmed → Executing → Completed, with the
//!   header status derived from its rows
//! - **Document chains**: one-hop write-back from a downstream row to the
//!   upstream row it was generated from
//! - **Usage guard**: ordered reference checks before any soft delete
//! - **Bill numbers**: per-type, per-day serials allocated inside the
//!   creating transaction
//! - **Storage abstraction**: trait-based backends with an in-memory
//!   implementation
//!
//! ## Quick Start
//!
//! ```rust
//! use safety_vouchers::{utils::MemoryStorage, VoucherEngine};
//!
//! let engine = VoucherEngine::new(MemoryStorage::new());
//! assert_eq!(engine.config().serial_width, 4);
//! ```

pub mod config;
pub mod traits;
pub mod types;
pub mod utils;
pub mod voucher;

// Re-export commonly used types
pub use config::*;
pub use traits::*;
pub use types::*;
pub use voucher::*;
