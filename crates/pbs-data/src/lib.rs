//! pbs-data crate

pub mod entropy;
pub mod store;
pub mod types;

pub use entropy::{SampleStream, SimRng};
pub use types::{Block, SharedTx, Transaction};
