//! Integration tests over the in-memory store and simulated hosts

mod common;
mod test_commands;
mod test_fleet;
mod test_fsm;
mod test_monitor;
mod test_paths;
mod test_retry;
