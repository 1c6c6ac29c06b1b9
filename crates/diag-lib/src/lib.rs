//! Diagnostic collection for distributed SQL clusters
//!
//! This crate provides the core functionality for:
//! - Topology discovery (orchestrator metadata, Kubernetes, manual endpoints)
//! - Remote execution over SSH and HTTP fetching
//! - A parallel task runner and the evidence collectors built on it
//! - Time-sliced metric export
//! - Packaging, encryption and resumable upload of the result

pub mod collector;
pub mod error;
pub mod executor;
pub mod http;
pub mod manager;
pub mod metric;
pub mod models;
pub mod packager;
pub mod scrape;
pub mod summary;
pub mod task;
pub mod topology;
pub mod upload;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{DiagError, Result};
pub use manager::{new_session, CollectOutcome, Manager};
pub use models::*;
pub use summary::SizeSummary;
