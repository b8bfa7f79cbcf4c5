//! CLI command handlers.

pub mod config;
pub mod explore;
pub mod settings;
