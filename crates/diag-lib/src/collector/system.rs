//! Host-level system information

use super::{async_trait, CollectContext, Collector};
use crate::error::{DiagError, Result};
use crate::models::{CollectorKind, PrepareStats};
use crate::task::{parallel, RunReport, StepContext, TaskBuilder};
use futures::FutureExt;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Commands whose stdout is saved as is; failures only warn
const BEST_EFFORT: [(&str, &str, bool); 3] = [
    ("sysctl -a", "sysctl.txt", true),
    ("dmesg", "dmesg.log", true),
    ("ulimit -a", "limits.txt", false),
];

async fn save(path: PathBuf, data: Vec<u8>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, data).await?;
    Ok(())
}

/// Save the last shell output of the step's host
async fn save_output(step: StepContext, dir: PathBuf, name: &'static str, err_name: &'static str) -> Result<()> {
    let out = step
        .output()
        .ok_or_else(|| DiagError::Bug(format!("no command output recorded for {}", step.host)))?;
    if !out.stderr.is_empty() {
        save(dir.join(err_name), out.stderr).await?;
    }
    save(dir.join(name), out.stdout).await
}

/// insight, listening sockets, kernel tunables, dmesg and limits of every host
pub struct SystemCollector;

#[async_trait]
impl Collector for SystemCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::System
    }

    fn describe(&self) -> &'static str {
        "basic system information of servers"
    }

    async fn prepare(&self, _ctx: &CollectContext) -> Result<PrepareStats> {
        Ok(PrepareStats::new())
    }

    async fn collect(&self, ctx: &CollectContext, result_dir: &Path) -> Result<RunReport> {
        let hosts = ctx.request.filter.hosts(&ctx.cluster);

        let mut platforms = BTreeSet::new();
        let mut downloads = Vec::new();
        for c in &hosts {
            let helper = ctx.helper_for(c);
            if platforms.insert((helper.os.clone(), helper.arch.clone())) {
                let label = format!("Downloading check tools for {}/{}", helper.os, helper.arch);
                downloads.push(TaskBuilder::new().download(helper).build_node(label));
            }
        }

        let mut nodes = Vec::new();
        for c in &hosts {
            let host = c.host.clone();
            let dir = result_dir.join(&host);
            let insight_dir = dir.clone();
            let ss_dir = dir.clone();
            let extra_dir = dir;
            let extra_host = host.clone();

            let node = TaskBuilder::new()
                .mkdir(&host, ctx.helper_dir())
                .copy_component(&host, ctx.helper_for(c), ctx.helper_dir())
                .shell(&host, format!("{} insight", ctx.helper_path()), false)
                .func(&host, "save insight", move |step| {
                    save_output(step, insight_dir.clone(), "insight.json", "insight.err").boxed()
                })
                .shell(&host, "ss -lanp", false)
                .func(&host, "save sockets", move |step| {
                    save_output(step, ss_dir.clone(), "ss.txt", "ss.txt.stderr").boxed()
                })
                .func(&host, "kernel settings", move |step| {
                    let dir = extra_dir.clone();
                    let host = extra_host.clone();
                    async move {
                        let executor = step.executor()?.clone();
                        for (cmd, name, sudo) in BEST_EFFORT {
                            match executor.shell(&host, cmd, sudo).await {
                                Ok(out) if out.success() => save(dir.join(name), out.stdout).await?,
                                Ok(out) => warn!(
                                    host = %host,
                                    cmd,
                                    code = out.code,
                                    stderr = %out.stderr_lossy(),
                                    "Command failed, skipped"
                                ),
                                Err(e) => warn!(host = %host, cmd, error = %e, "Command failed, skipped"),
                            }
                        }
                        debug!(host = %host, "Saved kernel settings");
                        Ok(())
                    }
                    .boxed()
                })
                .cleanup_rmdir(&host, ctx.temp_dir())
                .build_node(format!("Collecting system info of {}", host));
            nodes.push(node);
        }

        ctx.runner
            .run(vec![
                parallel("Download necessary tools", downloads),
                parallel("Collect system information", nodes),
            ])
            .await
    }
}
