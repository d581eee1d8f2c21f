//! Transfer driver
//!
//! Drives rsync against a resolved [`TransferPlan`](crate::plan::TransferPlan)
//! and interprets its exit code and output.

pub mod driver;
pub mod summary;

pub use driver::TransferDriver;
pub use summary::{TransferOutcome, TransferResult};
