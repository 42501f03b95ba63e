//! Task ledger and worker pool

pub mod ledger;
pub mod pool;
