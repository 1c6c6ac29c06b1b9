//! Cluster topology model and discovery
//!
//! A [`Cluster`] is produced once per run by one of three discovery sources:
//! - an orchestrator metadata file on local disk (`orchestrated`)
//! - a custom resource read from the Kubernetes API (`kubernetes`)
//! - endpoints supplied by the caller (`manual`)
//!
//! After discovery the cluster is immutable. Collectors select the
//! components they work on through a [`ComponentFilter`].

mod k8s;
mod manual;
mod orchestrated;


pub use k8s::{components_from_resource, discover_kubernetes, KubeTarget};
pub use manual::{discover_manual, ManualEndpoints};
pub use orchestrated::{discover_orchestrated, parse_meta, MetaStore, OrchestratedTarget};

use crate::error::{DiagError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Attribute keys carried on components
pub mod attr {
    pub const DEPLOY_DIR: &str = "deploy_dir";
    pub const LOG_DIR: &str = "log_dir";
    pub const DATA_DIR: &str = "data_dir";
    pub const OS: &str = "os";
    pub const ARCH: &str = "arch";
    pub const POD: &str = "pod";
    pub const HEALTHY: &str = "healthy";
}

/// Attribute keys carried on the cluster
pub mod cluster_attr {
    pub const CLUSTER_ID: &str = "cluster_id";
    pub const CLUSTER_TYPE: &str = "cluster_type";
    pub const NAMESPACE: &str = "namespace";
    pub const PD_ENDPOINTS: &str = "pd_endpoints";
}

/// Kind of a component process
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    Coordinator,
    SqlGateway,
    KvStore,
    ColumnarStore,
    ChangeDataCapture,
    BinlogPump,
    BinlogDrainer,
    Analytics,
    Monitor,
    DmMaster,
    DmWorker,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 11] = [
        Self::Coordinator,
        Self::SqlGateway,
        Self::KvStore,
        Self::ColumnarStore,
        Self::ChangeDataCapture,
        Self::BinlogPump,
        Self::BinlogDrainer,
        Self::Analytics,
        Self::Monitor,
        Self::DmMaster,
        Self::DmWorker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::SqlGateway => "sql-gateway",
            Self::KvStore => "kv-store",
            Self::ColumnarStore => "columnar-store",
            Self::ChangeDataCapture => "change-data-capture",
            Self::BinlogPump => "binlog-pump",
            Self::BinlogDrainer => "binlog-drainer",
            Self::Analytics => "analytics",
            Self::Monitor => "monitor",
            Self::DmMaster => "dm-master",
            Self::DmWorker => "dm-worker",
        }
    }

    /// Directory prefix the orchestrator uses for default deploy dirs
    pub fn dir_prefix(&self) -> &'static str {
        match self {
            Self::Coordinator => "pd",
            Self::SqlGateway => "tidb",
            Self::KvStore => "tikv",
            Self::ColumnarStore => "tiflash",
            Self::ChangeDataCapture => "cdc",
            Self::BinlogPump => "pump",
            Self::BinlogDrainer => "drainer",
            Self::Analytics => "tispark",
            Self::Monitor => "prometheus",
            Self::DmMaster => "dm-master",
            Self::DmWorker => "dm-worker",
        }
    }

    /// Default (main, status) ports
    pub fn default_ports(&self) -> (u16, u16) {
        match self {
            Self::Coordinator => (2379, 2379),
            Self::SqlGateway => (4000, 10080),
            Self::KvStore => (20160, 20180),
            Self::ColumnarStore => (9000, 20292),
            Self::ChangeDataCapture => (8300, 8300),
            Self::BinlogPump => (8250, 8250),
            Self::BinlogDrainer => (8249, 8249),
            Self::Analytics => (7077, 8080),
            Self::Monitor => (9090, 9090),
            Self::DmMaster => (8261, 8261),
            Self::DmWorker => (8262, 8262),
        }
    }

    /// Path of the live configuration endpoint on the status port
    pub fn config_endpoint(&self) -> Option<&'static str> {
        match self {
            Self::Coordinator => Some("/pd/api/v1/config"),
            Self::KvStore => Some("/config?full=true"),
            Self::SqlGateway | Self::ColumnarStore => Some("/config"),
            _ => None,
        }
    }

    /// Monitoring stack and analytics processes are not inspected for static configs
    pub fn is_monitor_adjacent(&self) -> bool {
        matches!(self, Self::Monitor | Self::Analytics)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = DiagError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|k| k.as_str() == normalized || k.dir_prefix() == normalized)
            .copied()
            .ok_or_else(|| DiagError::parse(format!("unknown component kind '{}'", s)))
    }
}

/// How the cluster was discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Orchestrated,
    Kubernetes,
    Manual,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrated => "orchestrated",
            Self::Kubernetes => "kubernetes",
            Self::Manual => "manual",
        }
    }

    /// Whether hosts are reachable over SSH in this mode
    pub fn has_ssh(&self) -> bool {
        matches!(self, Self::Orchestrated)
    }
}

/// One process instance of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub kind: ComponentKind,
    pub host: String,
    pub port: u16,
    /// 0 when the component has no status port
    pub status_port: u16,
    /// 0 when the component is not reachable over SSH
    pub ssh_port: u16,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Component {
    pub fn new(kind: ComponentKind, host: impl Into<String>, port: u16, status_port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            status_port,
            ssh_port: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Node id in the form `host:main-port`
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `host:status-port`, falling back to the main port
    pub fn status_address(&self) -> String {
        let port = if self.status_port == 0 {
            self.port
        } else {
            self.status_port
        };
        format!("{}:{}", self.host, port)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn deploy_dir(&self) -> Option<&str> {
        self.attr(attr::DEPLOY_DIR).filter(|d| !d.is_empty())
    }

    /// Log directory, `<deploy-dir>/log` unless set explicitly
    pub fn log_dir(&self) -> Option<String> {
        match self.attr(attr::LOG_DIR).filter(|d| !d.is_empty()) {
            Some(dir) => Some(dir.to_string()),
            None => self.deploy_dir().map(|d| format!("{}/log", d.trim_end_matches('/'))),
        }
    }

    /// Local result subdirectory mirroring the remote deploy dir, keyed by
    /// pod name on Kubernetes
    pub fn result_subdir(&self) -> PathBuf {
        let mut path = PathBuf::from(self.attr(attr::POD).unwrap_or(&self.host));
        if let Some(dir) = self.deploy_dir() {
            for part in dir.split('/').filter(|p| !p.is_empty() && *p != "..") {
                path.push(part);
            }
        }
        path
    }

    pub fn is_healthy(&self) -> bool {
        self.attr(attr::HEALTHY) != Some("false")
    }
}

/// A cooperating set of components at one deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub version: String,
    pub mode: DeployMode,
    pub components: Vec<Component>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Cluster {
    /// Build a cluster, checking name and (kind, host, port) uniqueness
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        mode: DeployMode,
        components: Vec<Component>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(DiagError::parse("cluster name must not be empty"));
        }

        let mut seen = HashSet::new();
        for c in &components {
            if !seen.insert((c.kind, c.host.clone(), c.port)) {
                return Err(DiagError::parse(format!(
                    "duplicate {} component {}",
                    c.kind,
                    c.id()
                )));
            }
        }

        Ok(Self {
            name,
            version: version.into(),
            mode,
            components,
            attributes: BTreeMap::new(),
        })
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn of_kind(&self, kind: ComponentKind) -> impl Iterator<Item = &Component> {
        self.components.iter().filter(move |c| c.kind == kind)
    }

    /// Monitoring endpoints (`host:port`), in topology order
    pub fn monitors(&self) -> Vec<String> {
        self.of_kind(ComponentKind::Monitor).map(Component::id).collect()
    }
}

/// Role and node filter applied to components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentFilter {
    /// Kinds to keep, empty keeps all
    #[serde(default)]
    pub roles: BTreeSet<ComponentKind>,
    /// `host:port` ids to keep, empty keeps all
    #[serde(default)]
    pub nodes: BTreeSet<String>,
}

impl ComponentFilter {
    pub fn new(roles: impl IntoIterator<Item = ComponentKind>, nodes: impl IntoIterator<Item = String>) -> Self {
        Self {
            roles: roles.into_iter().collect(),
            nodes: nodes.into_iter().collect(),
        }
    }

    pub fn matches(&self, c: &Component) -> bool {
        (self.roles.is_empty() || self.roles.contains(&c.kind))
            && (self.nodes.is_empty() || self.nodes.contains(&c.id()))
    }

    pub fn apply<'a>(&self, cluster: &'a Cluster) -> Vec<&'a Component> {
        cluster.components.iter().filter(|c| self.matches(c)).collect()
    }

    /// Distinct hosts of the matching components, in first-seen order
    pub fn hosts<'a>(&self, cluster: &'a Cluster) -> Vec<&'a Component> {
        let mut seen = HashSet::new();
        self.apply(cluster)
            .into_iter()
            .filter(|c| seen.insert(c.host.clone()))
            .collect()
    }
}

/// SSH login discovered alongside the topology
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshLogin {
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

/// Output of a discovery source
#[derive(Debug, Clone)]
pub struct Discovered {
    pub cluster: Cluster,
    pub ssh: Option<SshLogin>,
    /// Raw source document saved next to `cluster.json`, as (file name, bytes)
    pub source_document: Option<(String, Vec<u8>)>,
}

/// Arguments of a discovery call
#[derive(Debug, Clone)]
pub enum DiscoveryArgs {
    Orchestrated(OrchestratedTarget),
    Kubernetes(KubeTarget),
    Manual(ManualEndpoints),
}

/// Produce a cluster from the selected source
pub async fn discover(args: DiscoveryArgs) -> Result<Discovered> {
    let discovered = match args {
        DiscoveryArgs::Orchestrated(target) => discover_orchestrated(&target).await?,
        DiscoveryArgs::Kubernetes(target) => discover_kubernetes(&target).await?,
        DiscoveryArgs::Manual(endpoints) => discover_manual(&endpoints)?,
    };

    tracing::info!(
        cluster = %discovered.cluster.name,
        mode = discovered.cluster.mode.as_str(),
        components = discovered.cluster.components.len(),
        "Discovered cluster topology"
    );
    Ok(discovered)
}
