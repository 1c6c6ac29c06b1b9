//! Command implementations

pub mod collect;
pub mod config;
pub mod package;
pub mod upload;
