//! Voucher module containing the lifecycle engine and its building blocks

pub mod chain;
pub mod core;
pub mod guard;
pub mod request;
pub mod serial;
pub mod state;

pub use chain::*;
pub use core::*;
pub use guard::*;
pub use request::*;
pub use serial::*;
pub use state::*;
