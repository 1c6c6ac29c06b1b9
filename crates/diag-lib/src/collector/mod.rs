//! Evidence collectors
//!
//! Every evidence kind is gathered by one [`Collector`]. A run calls
//! `prepare` on each selected collector to estimate sizes, then `collect`
//! once the user confirms. Collectors share the run's [`Runner`] (and with it
//! the SSH executor) and the [`HttpFetcher`].

mod http;
mod logs;
mod meta;
mod monitor;
mod remote;
mod system;


pub use http::{ProfileCollector, ProfileTarget, RealtimeConfigCollector};
pub use logs::{ConfigCollector, LogCollector};
pub use meta::{
    build_cluster_json, fetch_cluster_id, write_cluster_json, write_meta, write_source_document,
    META_YAML,
};
pub use monitor::{AlertCollector, MetricCollector, RawMonitorCollector};
pub use system::SystemCollector;

use crate::error::Result;
use crate::executor::{normalize_arch, HelperSpec};
use crate::http::HttpFetcher;
use crate::models::{CollectRequest, CollectorKind, PrepareStats, DIAG_VERSION};
use crate::task::{RunReport, Runner};
use crate::topology::{attr, Cluster, Component};
use std::path::Path;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Name of the helper binary shipped to hosts
pub const HELPER_NAME: &str = "scraper";

/// Everything a collector needs to know about the run
#[derive(Clone)]
pub struct CollectContext {
    pub cluster: Arc<Cluster>,
    pub request: Arc<CollectRequest>,
    pub runner: Runner,
    pub fetcher: HttpFetcher,
    /// Random id of the run, also used for remote temp dirs
    pub session: String,
    /// Version of the helper to ship
    pub helper_version: String,
}

impl CollectContext {
    pub fn new(
        cluster: Arc<Cluster>,
        request: Arc<CollectRequest>,
        runner: Runner,
        fetcher: HttpFetcher,
        session: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            request,
            runner,
            fetcher,
            session: session.into(),
            helper_version: DIAG_VERSION.to_string(),
        }
    }

    /// Components passing the role and node filters
    pub fn components(&self) -> Vec<&Component> {
        self.request.filter.apply(&self.cluster)
    }

    /// Remote scratch directory of this run
    pub fn temp_dir(&self) -> String {
        format!("/tmp/diag-{}", self.session)
    }

    /// Directory the helper binary is installed into
    pub fn helper_dir(&self) -> String {
        format!("{}/bin", self.temp_dir())
    }

    pub fn helper_path(&self) -> String {
        format!("{}/{}", self.helper_dir(), HELPER_NAME)
    }

    /// Helper build matching a component's platform
    pub fn helper_for(&self, c: &Component) -> HelperSpec {
        HelperSpec::new(
            HELPER_NAME,
            &self.helper_version,
            c.attr(attr::OS).unwrap_or("linux"),
            normalize_arch(c.attr(attr::ARCH).unwrap_or("amd64")),
        )
    }
}

/// One kind of evidence
#[async_trait]
pub trait Collector: Send + Sync {
    fn kind(&self) -> CollectorKind;

    /// Human description shown in the plan
    fn describe(&self) -> &'static str;

    /// Estimate what `collect` would fetch, keyed by host. Leaves hosts as found.
    async fn prepare(&self, ctx: &CollectContext) -> Result<PrepareStats>;

    /// Fetch the evidence into `result_dir`
    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport>;
}

/// Instantiate the collector of one kind
pub fn create_collector(kind: CollectorKind) -> Arc<dyn Collector> {
    match kind {
        CollectorKind::System => Arc::new(SystemCollector),
        CollectorKind::Config => Arc::new(ConfigCollector),
        CollectorKind::RealtimeConfig => Arc::new(RealtimeConfigCollector),
        CollectorKind::LogStd | CollectorKind::LogSlow | CollectorKind::LogUnknown => {
            Arc::new(LogCollector::new(kind))
        }
        CollectorKind::Perf => Arc::new(ProfileCollector::new(ProfileTarget::Perf)),
        CollectorKind::Debug => Arc::new(ProfileCollector::new(ProfileTarget::Debug)),
        CollectorKind::MonitorMetric => Arc::new(MetricCollector),
        CollectorKind::MonitorAlert => Arc::new(AlertCollector),
        CollectorKind::MonitorRaw => Arc::new(RawMonitorCollector),
    }
}

/// Collectors for the selected kinds, in order. SSH-based kinds are dropped
/// when no SSH executor is available.
pub fn build_collectors(kinds: &[CollectorKind], ssh_available: bool) -> Vec<Arc<dyn Collector>> {
    kinds
        .iter()
        .filter(|kind| {
            if kind.needs_ssh() && !ssh_available {
                tracing::warn!(collector = %kind, "Skipping collector, no SSH access to hosts");
                return false;
            }
            true
        })
        .map(|kind| create_collector(*kind))
        .collect()
}
