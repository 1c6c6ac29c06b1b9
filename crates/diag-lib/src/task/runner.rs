//! Executes task plans on a bounded worker pool

use super::{Node, Progress, Step, Task};
use crate::error::{DiagError, Result};
use crate::executor::{CommandOutput, RemoteExecutor};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

/// Runner settings
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of leaf tasks allowed in flight
    pub concurrency: usize,
    /// Cancel siblings and propagate the first failure
    pub exit_on_error: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            exit_on_error: false,
        }
    }
}

/// Execution context handed to every step
#[derive(Clone)]
pub struct StepContext {
    pub host: String,
    pub cancel: CancellationToken,
    executor: Option<Arc<RemoteExecutor>>,
    outputs: Arc<DashMap<String, CommandOutput>>,
}

impl StepContext {
    /// Output of the last shell step run on this context's host
    pub fn output(&self) -> Option<CommandOutput> {
        self.outputs.get(&self.host).map(|o| o.clone())
    }

    pub fn executor(&self) -> Result<&Arc<RemoteExecutor>> {
        self.executor
            .as_ref()
            .ok_or_else(|| DiagError::Bug(format!("no SSH executor available for {}", self.host)))
    }
}

/// Result of one leaf task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub label: String,
    pub host: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Complete,
    Partial,
}

/// Aggregate of all leaf outcomes
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.outcomes.iter().any(|o| o.error.is_some()) {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        }
    }

    /// Error messages grouped by host; tasks without a host go under `local`
    pub fn errors_by_host(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for o in &self.outcomes {
            if let Some(err) = &o.error {
                map.entry(o.host.clone().unwrap_or_else(|| "local".to_string()))
                    .or_default()
                    .push(format!("{}: {}", o.label, err));
            }
        }
        map
    }

    pub fn merge(&mut self, other: RunReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// Runs plans of [`Node`]s
#[derive(Clone)]
pub struct Runner {
    config: RunnerConfig,
    executor: Option<Arc<RemoteExecutor>>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    outputs: Arc<DashMap<String, CommandOutput>>,
    progress: Arc<Progress>,
}

impl Runner {
    pub fn new(
        config: RunnerConfig,
        executor: Option<Arc<RemoteExecutor>>,
        progress: Arc<Progress>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            config,
            executor,
            slots,
            cancel: CancellationToken::new(),
            outputs: Arc::new(DashMap::new()),
            progress,
        }
    }

    /// Derive the runner's cancellation from a parent signal
    pub fn with_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn executor(&self) -> Option<&Arc<RemoteExecutor>> {
        self.executor.as_ref()
    }

    /// Run nodes one after another
    pub async fn run(&self, plan: Vec<Node>) -> Result<RunReport> {
        let mut report = RunReport::default();
        for node in plan {
            report.outcomes.extend(self.run_node(node).await?);
        }
        Ok(report)
    }

    fn run_node(&self, node: Node) -> BoxFuture<'_, Result<Vec<TaskOutcome>>> {
        async move {
            match node {
                Node::Serial(task) => self.run_leaf(task).await.map(|o| vec![o]),
                Node::Parallel { label, nodes } => self.run_group(label, nodes).await,
            }
        }
        .boxed()
    }

    async fn run_group(&self, label: String, nodes: Vec<Node>) -> Result<Vec<TaskOutcome>> {
        let mut set = JoinSet::new();
        for node in nodes {
            let runner = self.clone();
            let child = node.label().to_string();
            set.spawn(async move { (child, runner.run_node(node).await) });
        }

        let mut outcomes = Vec::new();
        let mut first_err: Option<DiagError> = None;
        while let Some(joined) = set.join_next().await {
            let (child, result) = match joined {
                Ok(v) => v,
                Err(e) => (label.clone(), Err(DiagError::from(e))),
            };
            match result {
                Ok(o) => outcomes.extend(o),
                Err(e) if self.config.exit_on_error => {
                    self.cancel.cancel();
                    // keep the root cause rather than a sibling's cancellation
                    let replace = match &first_err {
                        None => true,
                        Some(prev) => {
                            matches!(prev, DiagError::Cancelled) && !matches!(e, DiagError::Cancelled)
                        }
                    };
                    if replace {
                        first_err = Some(e);
                    }
                }
                Err(e) => outcomes.push(TaskOutcome {
                    label: child,
                    host: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Run one serial task on a worker slot
    async fn run_leaf(&self, task: Task) -> Result<TaskOutcome> {
        let host = task.host().map(str::to_string);
        let span = info_span!("task", label = %task.label, host = host.as_deref().unwrap_or("-"));

        let result = async {
            let _permit = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DiagError::Cancelled),
                permit = self.slots.clone().acquire_owned() => permit
                    .map_err(|_| DiagError::Bug("worker pool closed".to_string()))?,
            };
            self.progress.started(&task.label, host.as_deref());

            let mut result = Ok(());
            for step in &task.steps {
                if self.cancel.is_cancelled() {
                    result = Err(DiagError::Cancelled);
                    break;
                }
                if let Err(e) = self.run_step(step).await {
                    result = Err(e);
                    break;
                }
            }
            for step in &task.finally {
                if let Err(e) = self.run_step(step).await {
                    warn!(step = ?step, error = %e, "Cleanup step failed");
                }
            }
            result
        }
        .instrument(span)
        .await;

        let error = result.as_ref().err().map(|e| e.to_string());
        self.progress
            .finished(&task.label, host.as_deref(), error.clone());

        match result {
            Err(e) if self.config.exit_on_error => {
                self.cancel.cancel();
                Err(e)
            }
            _ => Ok(TaskOutcome {
                label: task.label,
                host,
                error,
            }),
        }
    }

    fn executor_for(&self, step: &Step) -> Result<&Arc<RemoteExecutor>> {
        self.executor
            .as_ref()
            .ok_or_else(|| DiagError::Bug(format!("{:?} needs an SSH executor", step)))
    }

    async fn run_step(&self, step: &Step) -> Result<()> {
        match step {
            Step::Shell { host, command, sudo } => {
                let out = self.executor_for(step)?.shell(host, command, *sudo).await?;
                let failed = !out.success();
                let code = out.code;
                let stderr = out.stderr_lossy();
                self.outputs.insert(host.clone(), out);
                if failed {
                    return Err(DiagError::RemoteExit {
                        host: host.clone(),
                        code,
                        stderr,
                    });
                }
                Ok(())
            }
            Step::Mkdir { host, path } => self.executor_for(step)?.mkdir(host, path).await,
            Step::Rmdir { host, path } => self.executor_for(step)?.rmdir(host, path).await,
            Step::Copy { host, transfer } => {
                self.executor_for(step)?
                    .copy_file(host, transfer, &self.cancel)
                    .await
            }
            Step::Download { helper, install } => {
                let executor = self.executor_for(step)?;
                match install {
                    Some(i) => executor
                        .copy_component(&i.host, helper, &i.dir, &self.cancel)
                        .await
                        .map(|_| ()),
                    None => executor.download(helper, &self.cancel).await.map(|_| ()),
                }
            }
            Step::Func { host, f, .. } => {
                let ctx = StepContext {
                    host: host.clone(),
                    cancel: self.cancel.clone(),
                    executor: self.executor.clone(),
                    outputs: self.outputs.clone(),
                };
                f(ctx).await
            }
        }
    }
}
