//! Local files: settings, machine inventory and directory layout

pub mod inventory;
pub mod layout;
pub mod settings;
