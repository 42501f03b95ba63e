//! Response models returned by the logfleet operation API

pub mod models;
