//! logfleet Library
//!
//! Core modules for the log-shipper fleet orchestrator.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod fleet;
pub mod logs;
pub mod models;
pub mod remote;
pub mod storage;
pub mod store;
pub mod tasks;
pub mod utils;
pub mod workers;
