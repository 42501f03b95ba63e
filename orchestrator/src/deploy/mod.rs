//! Instance deployment and lifecycle

pub mod commands;
pub mod executor;
pub mod fsm;
pub mod paths;
pub mod validator;
