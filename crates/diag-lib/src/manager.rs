//! Drives a collection run
//!
//! discovery output -> prepare every collector -> size summary -> confirm ->
//! metadata -> collect every collector -> final metadata -> close connections

use crate::collector::{
    build_cluster_json, build_collectors, fetch_cluster_id, write_cluster_json, write_meta,
    write_source_document, CollectContext, Collector,
};
use crate::error::{DiagError, Result};
use crate::executor::RemoteExecutor;
use crate::http::HttpFetcher;
use crate::models::{CollectRequest, PrepareStats, RunMeta, DIAG_VERSION};
use crate::summary::{merge_stats, SizeSummary};
use crate::task::{Progress, RunReport, Runner, RunnerConfig, TaskOutcome};
use crate::topology::Discovered;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Random hex id of a run
pub fn new_session() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// What a finished run produced
#[derive(Debug)]
pub struct CollectOutcome {
    pub result_dir: PathBuf,
    pub summary: SizeSummary,
    pub report: RunReport,
    pub meta: RunMeta,
}

/// One collection run over a discovered cluster
pub struct Manager {
    discovered: Discovered,
    request: Arc<CollectRequest>,
    fetcher: HttpFetcher,
    executor: Option<Arc<RemoteExecutor>>,
    progress: Arc<Progress>,
    session: String,
    cancel: CancellationToken,
}

impl Manager {
    pub fn new(
        discovered: Discovered,
        request: CollectRequest,
        fetcher: HttpFetcher,
        executor: Option<Arc<RemoteExecutor>>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            discovered,
            request: Arc::new(request),
            fetcher,
            executor,
            progress: Arc::new(Progress::new()),
            session: session.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop the run when `parent` is cancelled
    pub fn with_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn context(&self) -> CollectContext {
        let runner = Runner::new(
            RunnerConfig {
                concurrency: self.request.concurrency.max(1),
                exit_on_error: self.request.exit_on_error,
            },
            self.executor.clone(),
            self.progress.clone(),
        )
        .with_cancel(&self.cancel);
        CollectContext::new(
            Arc::new(self.discovered.cluster.clone()),
            self.request.clone(),
            runner,
            self.fetcher.clone(),
            self.session.clone(),
        )
    }

    fn collectors(&self) -> Vec<Arc<dyn Collector>> {
        build_collectors(&self.request.collectors, self.executor.is_some())
    }

    async fn prepare_all(
        &self,
        ctx: &CollectContext,
        collectors: &[Arc<dyn Collector>],
    ) -> Result<(PrepareStats, SizeSummary)> {
        let mut all = PrepareStats::new();
        let mut summary = SizeSummary::new();
        for collector in collectors {
            info!(collector = %collector.kind(), "Estimating {}", collector.describe());
            match collector.prepare(ctx).await {
                Ok(stats) => {
                    summary.add(&stats);
                    merge_stats(&mut all, stats);
                }
                Err(e) if self.request.exit_on_error => return Err(e),
                Err(e) => warn!(collector = %collector.kind(), error = %e, "Size estimate failed"),
            }
        }
        Ok((all, summary))
    }

    /// Estimate sizes without collecting anything
    pub async fn prepare(&self) -> Result<(PrepareStats, SizeSummary)> {
        let ctx = self.context();
        let result = self.prepare_all(&ctx, &self.collectors()).await;
        self.close().await;
        result
    }

    /// Run everything, asking `confirm` with the size estimate unless the
    /// request skips confirmation. Declining ends the run with `Cancelled`.
    pub async fn run<F>(&self, result_dir: &Path, confirm: F) -> Result<CollectOutcome>
    where
        F: FnOnce(&SizeSummary) -> bool,
    {
        let result = self.run_inner(result_dir, confirm).await;
        self.close().await;
        if let Err(e) = &result {
            error!(session = %self.session, error = %e, kind = e.kind(), "Collection aborted");
        }
        result
    }

    async fn run_inner<F>(&self, result_dir: &Path, confirm: F) -> Result<CollectOutcome>
    where
        F: FnOnce(&SizeSummary) -> bool,
    {
        let ctx = self.context();
        let collectors = self.collectors();

        let (_, summary) = self.prepare_all(&ctx, &collectors).await?;
        if !self.request.skip_confirm && !confirm(&summary) {
            info!("Collection declined");
            return Err(DiagError::Cancelled);
        }

        tokio::fs::create_dir_all(result_dir).await?;
        let cluster = &self.discovered.cluster;
        let cluster_id = fetch_cluster_id(cluster, &self.fetcher).await;
        let doc = build_cluster_json(cluster, &self.request, &self.session, cluster_id)?;
        write_cluster_json(result_dir, &doc).await?;
        if let Some((name, content)) = &self.discovered.source_document {
            write_source_document(result_dir, name, content).await?;
        }

        let mut meta = RunMeta {
            diag_version: DIAG_VERSION.to_string(),
            collector_host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            session: self.session.clone(),
            request: (*self.request).clone(),
            started_at: Utc::now(),
            finished_at: None,
            errors: Default::default(),
        };
        write_meta(result_dir, &meta).await?;

        let mut report = RunReport::default();
        for collector in &collectors {
            let kind = collector.kind();
            info!(collector = %kind, "Collecting {}", collector.describe());
            match collector.collect(&ctx, result_dir).await {
                Ok(r) => report.merge(r),
                Err(e) if self.request.exit_on_error => {
                    meta.errors = report.errors_by_host();
                    meta.errors
                        .entry("local".to_string())
                        .or_default()
                        .push(format!("{}: {}", kind, e));
                    meta.finished_at = Some(Utc::now());
                    if let Err(write_err) = write_meta(result_dir, &meta).await {
                        warn!(error = %write_err, "Failed to record run errors");
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!(collector = %kind, error = %e, "Collector failed");
                    report.outcomes.push(TaskOutcome {
                        label: kind.name().to_string(),
                        host: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        meta.errors = report.errors_by_host();
        meta.finished_at = Some(Utc::now());
        write_meta(result_dir, &meta).await?;
        info!(
            session = %self.session,
            dir = %result_dir.display(),
            status = ?report.status(),
            failed_hosts = meta.errors.len(),
            "Collection finished"
        );

        Ok(CollectOutcome {
            result_dir: result_dir.to_path_buf(),
            summary,
            report,
            meta,
        })
    }

    async fn close(&self) {
        if let Some(executor) = &self.executor {
            executor.close_all().await;
        }
    }
}
