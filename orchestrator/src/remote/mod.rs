//! Remote execution over SSH

pub mod channel;
pub mod host;
pub mod memory;
pub mod native;
pub mod tools;
