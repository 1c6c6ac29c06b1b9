//! Collectors that talk to component status ports over HTTP

use super::{async_trait, CollectContext, Collector};
use crate::error::Result;
use crate::http::HttpFetcher;
use crate::models::{CollectorKind, PrepareStats};
use crate::task::{parallel, Node, RunReport, TaskBuilder};
use crate::topology::{Component, ComponentKind};
use futures::FutureExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const CONFIG_TIMEOUT: Duration = Duration::from_secs(3);
const PROFILE_TIMEOUT: Duration = Duration::from_secs(15);

/// One endpoint to save
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fetch {
    pub path: String,
    pub file: PathBuf,
    pub timeout: Duration,
    pub headers: Vec<(&'static str, &'static str)>,
}

impl Fetch {
    fn new(path: impl Into<String>, file: PathBuf, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            file,
            timeout,
            headers: Vec::new(),
        }
    }
}

fn warn_unhealthy(c: &Component) {
    if !c.is_healthy() {
        warn!(component = %c.kind, node = %c.id(), "Component reported unhealthy, querying anyway");
    }
}

/// A task saving every fetch of one component; failed endpoints are logged and skipped
fn fetch_node(fetcher: &HttpFetcher, c: &Component, label: String, fetches: Vec<Fetch>) -> Node {
    let fetcher = fetcher.clone();
    let address = c.status_address();
    TaskBuilder::new()
        .func(&c.host, label.clone(), move |_step| {
            let fetcher = fetcher.clone();
            let address = address.clone();
            let fetches = fetches.clone();
            async move {
                for f in &fetches {
                    let url = fetcher.url(&address, &f.path);
                    match fetcher.get_with_headers(&url, &f.headers, f.timeout).await {
                        Ok(body) => {
                            if let Some(parent) = f.file.parent() {
                                tokio::fs::create_dir_all(parent).await?;
                            }
                            tokio::fs::write(&f.file, &body).await?;
                            debug!(url = %url, bytes = body.len(), "Saved endpoint");
                        }
                        Err(e) => warn!(url = %url, error = %e, "Failed to query endpoint, skipped"),
                    }
                }
                Ok(())
            }
            .boxed()
        })
        .build_node(label)
}

/// Live configuration served by each component
pub struct RealtimeConfigCollector;

impl RealtimeConfigCollector {
    pub(crate) fn fetches(c: &Component, result_dir: &Path) -> Vec<Fetch> {
        let Some(endpoint) = c.kind.config_endpoint() else {
            return Vec::new();
        };
        let dir = result_dir.join(c.result_subdir()).join("conf");
        let mut fetches = vec![Fetch::new(endpoint, dir.join("config.json"), CONFIG_TIMEOUT)];
        if c.kind == ComponentKind::Coordinator {
            fetches.push(Fetch::new(
                "/pd/api/v1/config/placement-rule",
                dir.join("placement-rule.json"),
                CONFIG_TIMEOUT,
            ));
            fetches.push(Fetch::new(
                "/pd/api/v1/stores",
                dir.join("store.json"),
                CONFIG_TIMEOUT,
            ));
        }
        fetches
    }
}

#[async_trait]
impl Collector for RealtimeConfigCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::RealtimeConfig
    }

    fn describe(&self) -> &'static str {
        "realtime config of components"
    }

    async fn prepare(&self, _ctx: &CollectContext) -> Result<PrepareStats> {
        Ok(PrepareStats::new())
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let nodes: Vec<Node> = ctx
            .components()
            .into_iter()
            .filter_map(|c| {
                let fetches = Self::fetches(c, result_dir);
                if fetches.is_empty() {
                    return None;
                }
                warn_unhealthy(c);
                let label = format!("Querying config of {} {}", c.kind, c.id());
                Some(fetch_node(&ctx.fetcher, c, label, fetches))
            })
            .collect();
        ctx.runner
            .run(vec![parallel("Query realtime config", nodes)])
            .await
    }
}

/// Which debug surface a [`ProfileCollector`] captures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileTarget {
    /// pprof profiles into `perf/`
    Perf,
    /// change-data-capture state into `debug/`
    Debug,
}

/// Profiles and debug endpoints of components
pub struct ProfileCollector {
    target: ProfileTarget,
}

impl ProfileCollector {
    pub fn new(target: ProfileTarget) -> Self {
        Self { target }
    }

    pub(crate) fn fetches(&self, c: &Component, result_dir: &Path, duration: u64) -> Vec<Fetch> {
        let base = result_dir.join(c.result_subdir());
        match self.target {
            ProfileTarget::Perf => {
                let dir = base.join("perf");
                let cpu = Fetch::new(
                    format!("/debug/pprof/profile?seconds={}", duration),
                    dir.join("cpu_profile.proto"),
                    Duration::from_secs(duration + 3),
                );
                match c.kind {
                    ComponentKind::Coordinator | ComponentKind::SqlGateway => vec![
                        cpu,
                        Fetch::new("/debug/pprof/heap", dir.join("mem_heap.proto"), PROFILE_TIMEOUT),
                        Fetch::new(
                            "/debug/pprof/goroutine?debug=1",
                            dir.join("goroutine.txt"),
                            PROFILE_TIMEOUT,
                        ),
                        Fetch::new("/debug/pprof/mutex?debug=1", dir.join("mutex.txt"), PROFILE_TIMEOUT),
                    ],
                    ComponentKind::KvStore | ComponentKind::ColumnarStore => {
                        let mut cpu = cpu;
                        cpu.headers.push(("Accept", "application/protobuf"));
                        vec![cpu]
                    }
                    _ => Vec::new(),
                }
            }
            ProfileTarget::Debug => {
                if c.kind != ComponentKind::ChangeDataCapture {
                    return Vec::new();
                }
                let dir = base.join("debug");
                [
                    ("/debug/info", "info.txt"),
                    ("/status", "status.txt"),
                    ("/api/v1/changefeeds", "changefeeds.txt"),
                    ("/api/v1/captures", "captures.txt"),
                    ("/api/v1/processors", "processors.txt"),
                ]
                .into_iter()
                .map(|(path, name)| Fetch::new(path, dir.join(name), PROFILE_TIMEOUT))
                .collect()
            }
        }
    }
}

#[async_trait]
impl Collector for ProfileCollector {
    fn kind(&self) -> CollectorKind {
        match self.target {
            ProfileTarget::Perf => CollectorKind::Perf,
            ProfileTarget::Debug => CollectorKind::Debug,
        }
    }

    fn describe(&self) -> &'static str {
        match self.target {
            ProfileTarget::Perf => "pprof profiles of components",
            ProfileTarget::Debug => "debug state of change-data-capture servers",
        }
    }

    async fn prepare(&self, _ctx: &CollectContext) -> Result<PrepareStats> {
        Ok(PrepareStats::new())
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let duration = ctx.request.perf_duration.max(1);
        let mut nodes = Vec::new();
        for c in ctx.components() {
            let fetches = self.fetches(c, result_dir, duration);
            if fetches.is_empty() {
                continue;
            }
            warn_unhealthy(c);
            // one task per endpoint so CPU profiles of different nodes overlap
            for f in fetches {
                let name = f
                    .file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let label = format!("Querying {} of {} {}", name, c.kind, c.id());
                nodes.push(fetch_node(&ctx.fetcher, c, label, vec![f]));
            }
        }
        ctx.runner
            .run(vec![parallel(self.describe(), nodes)])
            .await
    }
}
