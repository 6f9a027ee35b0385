//! CLI command modules.

pub mod config;
pub mod files;
pub mod simulate;
pub mod tree;
