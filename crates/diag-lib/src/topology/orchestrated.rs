//! Discovery from the orchestrator's on-disk cluster metadata

use super::{attr, cluster_attr, Cluster, Component, ComponentKind, DeployMode, Discovered, SshLogin};
use crate::error::{DiagError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which orchestrator store the cluster lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStore {
    Cluster,
    Dm,
}

impl MetaStore {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Dm => "dm",
        }
    }

    fn cluster_type(&self) -> &'static str {
        match self {
            Self::Cluster => "tidb-cluster",
            Self::Dm => "dm-cluster",
        }
    }
}

/// Cluster name plus where to look for its metadata
#[derive(Debug, Clone)]
pub struct OrchestratedTarget {
    pub name: String,
    pub store: MetaStore,
    /// Orchestrator home, defaults to `$TIUP_HOME` or `~/.tiup`
    pub home: Option<PathBuf>,
}

impl OrchestratedTarget {
    pub fn new(name: impl Into<String>, store: MetaStore) -> Self {
        Self {
            name: name.into(),
            store,
            home: None,
        }
    }

    fn home_dir(&self) -> Result<PathBuf> {
        if let Some(home) = &self.home {
            return Ok(home.clone());
        }
        if let Ok(home) = std::env::var("TIUP_HOME") {
            if !home.is_empty() {
                return Ok(PathBuf::from(home));
            }
        }
        dirs_next::home_dir()
            .map(|h| h.join(".tiup"))
            .ok_or_else(|| DiagError::io_other("could not determine home directory"))
    }

    /// Directory holding `meta.yaml` and the `ssh/` key pair
    pub fn cluster_dir(&self) -> Result<PathBuf> {
        Ok(self
            .home_dir()?
            .join("storage")
            .join(self.store.dir_name())
            .join("clusters")
            .join(&self.name))
    }
}

#[derive(Debug, Deserialize)]
struct MetaFile {
    #[serde(default)]
    user: String,
    #[serde(default, rename = "tidb_version", alias = "dm_version")]
    version: String,
    #[serde(default)]
    topology: TopologySpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TopologySpec {
    global: GlobalSpec,
    pd_servers: Vec<InstanceSpec>,
    tidb_servers: Vec<InstanceSpec>,
    tikv_servers: Vec<InstanceSpec>,
    tiflash_servers: Vec<InstanceSpec>,
    cdc_servers: Vec<InstanceSpec>,
    pump_servers: Vec<InstanceSpec>,
    drainer_servers: Vec<InstanceSpec>,
    tispark_masters: Vec<InstanceSpec>,
    tispark_workers: Vec<InstanceSpec>,
    monitoring_servers: Vec<InstanceSpec>,
    master_servers: Vec<InstanceSpec>,
    worker_servers: Vec<InstanceSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GlobalSpec {
    user: Option<String>,
    ssh_port: Option<u16>,
    deploy_dir: Option<String>,
    log_dir: Option<String>,
    os: Option<String>,
    arch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InstanceSpec {
    host: String,
    ssh_port: Option<u16>,
    port: Option<u16>,
    status_port: Option<u16>,
    client_port: Option<u16>,
    tcp_port: Option<u16>,
    flash_proxy_status_port: Option<u16>,
    web_port: Option<u16>,
    deploy_dir: Option<String>,
    log_dir: Option<String>,
    data_dir: Option<String>,
    os: Option<String>,
    arch: Option<String>,
}

impl InstanceSpec {
    fn ports(&self, kind: ComponentKind) -> (u16, u16) {
        let (main, status) = kind.default_ports();
        match kind {
            ComponentKind::Coordinator => {
                let p = self.client_port.unwrap_or(main);
                (p, p)
            }
            ComponentKind::ColumnarStore => (
                self.tcp_port.unwrap_or(main),
                self.flash_proxy_status_port.unwrap_or(status),
            ),
            ComponentKind::Analytics => (
                self.port.unwrap_or(main),
                self.web_port.unwrap_or(status),
            ),
            ComponentKind::DmMaster | ComponentKind::DmWorker | ComponentKind::Monitor
            | ComponentKind::ChangeDataCapture | ComponentKind::BinlogPump
            | ComponentKind::BinlogDrainer => {
                let p = self.port.unwrap_or(main);
                (p, p)
            }
            _ => (
                self.port.unwrap_or(main),
                self.status_port.unwrap_or(status),
            ),
        }
    }
}

/// Parse orchestrator metadata into a cluster and its SSH user
pub fn parse_meta(name: &str, store: MetaStore, content: &str) -> Result<(Cluster, String)> {
    let meta: MetaFile = serde_yaml::from_str(content)?;
    let topo = &meta.topology;
    let global = &topo.global;

    let user = global
        .user
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| meta.user.clone());
    let user = if user.is_empty() { "tidb".to_string() } else { user };

    let groups: [(ComponentKind, &Vec<InstanceSpec>); 12] = [
        (ComponentKind::Coordinator, &topo.pd_servers),
        (ComponentKind::KvStore, &topo.tikv_servers),
        (ComponentKind::ColumnarStore, &topo.tiflash_servers),
        (ComponentKind::SqlGateway, &topo.tidb_servers),
        (ComponentKind::ChangeDataCapture, &topo.cdc_servers),
        (ComponentKind::BinlogPump, &topo.pump_servers),
        (ComponentKind::BinlogDrainer, &topo.drainer_servers),
        (ComponentKind::Analytics, &topo.tispark_masters),
        (ComponentKind::Analytics, &topo.tispark_workers),
        (ComponentKind::Monitor, &topo.monitoring_servers),
        (ComponentKind::DmMaster, &topo.master_servers),
        (ComponentKind::DmWorker, &topo.worker_servers),
    ];

    let mut components = Vec::new();
    for (kind, instances) in groups {
        for inst in instances {
            if inst.host.is_empty() {
                return Err(DiagError::parse(format!("{} instance without host", kind)));
            }
            let (port, status_port) = inst.ports(kind);
            let deploy_dir = resolve_deploy_dir(&user, global, inst, kind, port);
            let log_dir = resolve_log_dir(&deploy_dir, global, inst);

            let mut c = Component::new(kind, &inst.host, port, status_port)
                .with_ssh_port(inst.ssh_port.or(global.ssh_port).unwrap_or(22))
                .with_attr(attr::DEPLOY_DIR, deploy_dir)
                .with_attr(attr::LOG_DIR, log_dir);
            if let Some(data_dir) = &inst.data_dir {
                c = c.with_attr(attr::DATA_DIR, data_dir.clone());
            }
            c = c
                .with_attr(
                    attr::OS,
                    inst.os.clone().or_else(|| global.os.clone()).unwrap_or_else(|| "linux".into()),
                )
                .with_attr(
                    attr::ARCH,
                    inst.arch.clone().or_else(|| global.arch.clone()).unwrap_or_else(|| "amd64".into()),
                );
            components.push(c);
        }
    }

    let cluster = Cluster::new(name, meta.version, DeployMode::Orchestrated, components)?
        .with_attr(cluster_attr::CLUSTER_TYPE, store.cluster_type());
    Ok((cluster, user))
}

fn resolve_deploy_dir(
    user: &str,
    global: &GlobalSpec,
    inst: &InstanceSpec,
    kind: ComponentKind,
    port: u16,
) -> String {
    let dir = match &inst.deploy_dir {
        Some(d) if !d.is_empty() => d.clone(),
        _ => {
            let base = global.deploy_dir.clone().unwrap_or_else(|| "deploy".to_string());
            format!("{}/{}-{}", base.trim_end_matches('/'), kind.dir_prefix(), port)
        }
    };
    if dir.starts_with('/') {
        dir
    } else {
        format!("/home/{}/{}", user, dir)
    }
}

fn resolve_log_dir(deploy_dir: &str, global: &GlobalSpec, inst: &InstanceSpec) -> String {
    let dir = inst
        .log_dir
        .clone()
        .or_else(|| global.log_dir.clone())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "log".to_string());
    if dir.starts_with('/') {
        dir
    } else {
        format!("{}/{}", deploy_dir, dir)
    }
}

/// Read `meta.yaml` of a named cluster from the orchestrator store
pub async fn discover_orchestrated(target: &OrchestratedTarget) -> Result<Discovered> {
    let dir = target.cluster_dir()?;
    let meta_path = dir.join("meta.yaml");
    let content = match tokio::fs::read(&meta_path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DiagError::TopologyNotFound(format!(
                "{} (no metadata at {})",
                target.name,
                meta_path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };

    let text = String::from_utf8_lossy(&content);
    let (cluster, user) = parse_meta(&target.name, target.store, &text)?;

    let identity = identity_file(&dir);
    Ok(Discovered {
        cluster,
        ssh: Some(SshLogin {
            user,
            identity_file: identity,
        }),
        source_document: Some(("topology.yaml".to_string(), content)),
    })
}

fn identity_file(cluster_dir: &Path) -> Option<PathBuf> {
    let path = cluster_dir.join("ssh").join("id_rsa");
    path.exists().then_some(path)
}
