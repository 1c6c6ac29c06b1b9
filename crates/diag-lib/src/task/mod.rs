//! Task graph and parallel runner
//!
//! A plan is a list of [`Node`]s executed in order. A node is either a
//! serial [`Task`] of steps against one host, or a parallel group of nodes.
//! Leaf tasks are scheduled on a shared worker pool of `concurrency` slots.

mod progress;
mod runner;


pub use progress::{Progress, ProgressEvent, ProgressSink};
pub use runner::{RunReport, RunStatus, Runner, RunnerConfig, StepContext, TaskOutcome};

use crate::error::Result;
use crate::executor::{Direction, HelperSpec, Transfer};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Closure run by a [`Step::Func`]
pub type StepFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Where a downloaded helper gets installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Install {
    pub host: String,
    pub dir: String,
}

/// One unit of work
#[derive(Clone)]
pub enum Step {
    Shell {
        host: String,
        command: String,
        sudo: bool,
    },
    Mkdir {
        host: String,
        path: String,
    },
    Rmdir {
        host: String,
        path: String,
    },
    Copy {
        host: String,
        transfer: Transfer,
    },
    /// Fetch a helper into the local cache, optionally shipping it to a host
    Download {
        helper: HelperSpec,
        install: Option<Install>,
    },
    Func {
        host: String,
        label: String,
        f: StepFn,
    },
}

impl Step {
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Shell { host, .. }
            | Self::Mkdir { host, .. }
            | Self::Rmdir { host, .. }
            | Self::Copy { host, .. }
            | Self::Func { host, .. } => Some(host),
            Self::Download { install, .. } => install.as_ref().map(|i| i.host.as_str()),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell { host, command, sudo } => {
                write!(f, "Shell({}: {}{})", host, if *sudo { "sudo " } else { "" }, command)
            }
            Self::Mkdir { host, path } => write!(f, "Mkdir({}: {})", host, path),
            Self::Rmdir { host, path } => write!(f, "Rmdir({}: {})", host, path),
            Self::Copy { host, transfer } => write!(
                f,
                "Copy({}: {} -> {}, {:?})",
                host, transfer.src, transfer.dst, transfer.direction
            ),
            Self::Download { helper, install } => {
                write!(f, "Download({} {} {}/{}", helper.name, helper.version, helper.os, helper.arch)?;
                if let Some(i) = install {
                    write!(f, " -> {}:{}", i.host, i.dir)?;
                }
                write!(f, ")")
            }
            Self::Func { host, label, .. } => write!(f, "Func({}: {})", host, label),
        }
    }
}

/// Labeled serial list of steps
#[derive(Debug, Clone)]
pub struct Task {
    pub label: String,
    pub steps: Vec<Step>,
    /// Run after `steps` whatever their outcome
    pub finally: Vec<Step>,
}

impl Task {
    /// First host any step touches
    pub fn host(&self) -> Option<&str> {
        self.steps
            .iter()
            .chain(self.finally.iter())
            .find_map(Step::host)
    }
}

/// Node of a plan
#[derive(Debug, Clone)]
pub enum Node {
    Serial(Task),
    Parallel { label: String, nodes: Vec<Node> },
}

impl Node {
    pub fn label(&self) -> &str {
        match self {
            Self::Serial(t) => &t.label,
            Self::Parallel { label, .. } => label,
        }
    }
}

/// Assembles the steps of one serial task
#[derive(Debug, Default)]
pub struct TaskBuilder {
    steps: Vec<Step>,
    finally: Vec<Step>,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shell(mut self, host: &str, command: impl Into<String>, sudo: bool) -> Self {
        self.steps.push(Step::Shell {
            host: host.to_string(),
            command: command.into(),
            sudo,
        });
        self
    }

    pub fn mkdir(mut self, host: &str, path: impl Into<String>) -> Self {
        self.steps.push(Step::Mkdir {
            host: host.to_string(),
            path: path.into(),
        });
        self
    }

    pub fn rmdir(mut self, host: &str, path: impl Into<String>) -> Self {
        self.steps.push(Step::Rmdir {
            host: host.to_string(),
            path: path.into(),
        });
        self
    }

    /// Copy a remote file back to the local machine
    pub fn copy_from(
        mut self,
        host: &str,
        src: impl Into<String>,
        dst: impl Into<String>,
        limit_kbps: u32,
        compress: bool,
    ) -> Self {
        self.steps.push(Step::Copy {
            host: host.to_string(),
            transfer: Transfer {
                src: src.into(),
                dst: dst.into(),
                direction: Direction::Download,
                limit_kbps,
                compress,
            },
        });
        self
    }

    /// Fetch a helper to the local cache
    pub fn download(mut self, helper: HelperSpec) -> Self {
        self.steps.push(Step::Download {
            helper,
            install: None,
        });
        self
    }

    /// Fetch a helper if needed and install it into `dir` on `host`
    pub fn copy_component(mut self, host: &str, helper: HelperSpec, dir: impl Into<String>) -> Self {
        self.steps.push(Step::Download {
            helper,
            install: Some(Install {
                host: host.to_string(),
                dir: dir.into(),
            }),
        });
        self
    }

    pub fn func<F>(mut self, host: &str, label: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.steps.push(Step::Func {
            host: host.to_string(),
            label: label.into(),
            f: Arc::new(f),
        });
        self
    }

    /// Remove a directory once the task ends, even after a failure
    pub fn cleanup_rmdir(mut self, host: &str, path: impl Into<String>) -> Self {
        self.finally.push(Step::Rmdir {
            host: host.to_string(),
            path: path.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn build(self, label: impl Into<String>) -> Task {
        Task {
            label: label.into(),
            steps: self.steps,
            finally: self.finally,
        }
    }

    pub fn build_node(self, label: impl Into<String>) -> Node {
        Node::Serial(self.build(label))
    }
}

/// Group nodes to run concurrently
pub fn parallel(label: impl Into<String>, nodes: Vec<Node>) -> Node {
    Node::Parallel {
        label: label.into(),
        nodes,
    }
}
