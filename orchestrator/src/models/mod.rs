//! Domain records

pub mod machine;
pub mod process;
pub mod task;
