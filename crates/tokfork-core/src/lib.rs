//! Core tokfork library (session, branch tree, layout, config).

pub mod candidates;
pub mod config;
pub mod core;
pub mod engine;
pub mod explorer;
pub mod fixture;
pub mod layout;
pub mod logging;
pub mod settings;
pub mod tree;
