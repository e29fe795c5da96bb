//! pbs-analysis crate
//!
//! Post-run analytics: per-block revenue splits, range statistics, and the
//! CSV report writers for block, transaction, and PBS-vs-POS outputs.

pub mod reports;
pub mod revenue;

pub use revenue::{BlockReward, RangeStats};
