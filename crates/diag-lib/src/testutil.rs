//! Shared test doubles

use crate::error::{DiagError, Result};
use crate::executor::{
    CommandOutput, Direction, HelperCache, RemoteExecutor, SshOptions, Transfer, Transport,
    TransportFactory,
};
use crate::http::{HttpFetcher, HttpOptions};
use crate::topology::{attr, Cluster, Component, ComponentKind, DeployMode};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything the mock transports observed
#[derive(Default)]
pub struct MockState {
    pub connects: AtomicUsize,
    pub commands: Mutex<Vec<(String, String)>>,
    pub transfers: Mutex<Vec<(String, Transfer)>>,
    /// Hosts that refuse connections
    pub unreachable: HashSet<String>,
    /// Command substring -> stdout returned for it
    pub scripted: HashMap<String, String>,
    /// Command substrings that exit with code 1
    pub failing: HashSet<String>,
    /// Content written to the destination of downloads
    pub download_body: Vec<u8>,
}

impl MockState {
    pub fn commands_on(&self, host: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

pub struct MockFactory {
    pub state: Arc<MockState>,
}

impl MockFactory {
    pub fn new(state: MockState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self, host: &str, _port: u16, _opts: &SshOptions) -> Result<Arc<dyn Transport>> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.unreachable.contains(host) {
            return Err(DiagError::Unreachable {
                target: host.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(MockTransport {
            host: host.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct MockTransport {
    host: String,
    state: Arc<MockState>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn exec(&self, cmd: &str, _sudo: bool, _timeout: Duration) -> Result<CommandOutput> {
        self.state
            .commands
            .lock()
            .unwrap()
            .push((self.host.clone(), cmd.to_string()));

        if self.state.failing.iter().any(|f| cmd.contains(f.as_str())) {
            return Ok(CommandOutput {
                stdout: Vec::new(),
                stderr: b"scripted failure".to_vec(),
                code: 1,
            });
        }
        let stdout = self
            .state
            .scripted
            .iter()
            .find(|(k, _)| cmd.contains(k.as_str()))
            .map(|(_, v)| v.clone().into_bytes())
            .unwrap_or_default();
        Ok(CommandOutput {
            stdout,
            stderr: Vec::new(),
            code: 0,
        })
    }

    async fn transfer(&self, transfer: &Transfer, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DiagError::Cancelled);
        }
        self.state
            .transfers
            .lock()
            .unwrap()
            .push((self.host.clone(), transfer.clone()));
        if transfer.direction == Direction::Download {
            if let Some(parent) = Path::new(&transfer.dst).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&transfer.dst, &self.state.download_body)?;
        }
        Ok(())
    }
}

/// Orchestrated cluster with one coordinator, kv-store, sql-gateway and monitor
pub fn sample_cluster() -> Cluster {
    let comp = |kind, host: &str, port, status, dir: &str| {
        Component::new(kind, host, port, status)
            .with_ssh_port(22)
            .with_attr(attr::DEPLOY_DIR, dir)
            .with_attr(attr::OS, std::env::consts::OS)
            .with_attr(
                attr::ARCH,
                crate::executor::normalize_arch(std::env::consts::ARCH),
            )
    };
    Cluster::new(
        "test-cluster",
        "v7.5.0",
        DeployMode::Orchestrated,
        vec![
            comp(ComponentKind::Coordinator, "10.0.0.1", 2379, 2379, "/tidb-deploy/pd-2379"),
            comp(ComponentKind::KvStore, "10.0.0.2", 20160, 20180, "/tidb-deploy/tikv-20160"),
            comp(ComponentKind::SqlGateway, "10.0.0.3", 4000, 10080, "/tidb-deploy/tidb-4000"),
            comp(ComponentKind::Monitor, "10.0.0.9", 9090, 9090, "/tidb-deploy/prometheus-9090"),
        ],
    )
    .unwrap()
}

/// Executor over mock transports with a helper cache primed from `helper_dir`
pub fn mock_executor(cluster: &Cluster, state: MockState, cache_root: &Path, helper_dir: &Path) -> (Arc<RemoteExecutor>, Arc<MockState>) {
    let factory = MockFactory::new(state);
    let state = factory.state.clone();
    let fetcher = HttpFetcher::new(&HttpOptions::default()).unwrap();
    let cache = HelperCache::new(cache_root, None, fetcher).with_sibling_dir(helper_dir);
    let executor = RemoteExecutor::new(cluster, SshOptions::default(), Arc::new(factory), cache);
    (Arc::new(executor), state)
}
