//! Discovery from endpoints supplied on the command line

use super::{cluster_attr, Cluster, Component, ComponentKind, DeployMode, Discovered};
use crate::error::{DiagError, Result};

/// Endpoints of a cluster that is neither orchestrated nor on Kubernetes
#[derive(Debug, Clone, Default)]
pub struct ManualEndpoints {
    pub cluster_name: String,
    pub cluster_id: Option<String>,
    /// Coordinator client addresses, `host:port`
    pub coordinators: Vec<String>,
    /// SQL gateways, `host:port` or `host:port:status-port`
    pub sql_gateways: Vec<String>,
    /// Monitoring endpoints, `host:port`
    pub monitors: Vec<String>,
}

fn split_endpoint(endpoint: &str) -> Result<(String, Vec<u16>)> {
    let trimmed = endpoint
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');
    let mut parts = trimmed.split(':');
    let host = parts
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DiagError::parse(format!("missing host in '{}'", endpoint)))?;
    let ports = parts
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| DiagError::parse(format!("invalid port '{}' in '{}'", p, endpoint)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((host.to_string(), ports))
}

fn component(kind: ComponentKind, endpoint: &str) -> Result<Component> {
    let (host, ports) = split_endpoint(endpoint)?;
    let (default_main, default_status) = kind.default_ports();
    let main = ports.first().copied().unwrap_or(default_main);
    let status = match (kind, ports.get(1)) {
        (_, Some(p)) => *p,
        (ComponentKind::Coordinator | ComponentKind::Monitor, None) => main,
        (_, None) => default_status,
    };
    Ok(Component::new(kind, host, main, status))
}

/// Build a cluster from explicit endpoints
pub fn discover_manual(endpoints: &ManualEndpoints) -> Result<Discovered> {
    if endpoints.coordinators.is_empty() && endpoints.sql_gateways.is_empty() {
        return Err(DiagError::TopologyNotFound(
            "manual mode needs at least one coordinator or sql-gateway endpoint".to_string(),
        ));
    }

    let mut components = Vec::new();
    for e in &endpoints.coordinators {
        components.push(component(ComponentKind::Coordinator, e)?);
    }
    for e in &endpoints.sql_gateways {
        components.push(component(ComponentKind::SqlGateway, e)?);
    }
    for e in &endpoints.monitors {
        components.push(component(ComponentKind::Monitor, e)?);
    }

    let name = if endpoints.cluster_name.is_empty() {
        "manual".to_string()
    } else {
        endpoints.cluster_name.clone()
    };

    let pd_endpoints = components
        .iter()
        .filter(|c| c.kind == ComponentKind::Coordinator)
        .map(Component::status_address)
        .collect::<Vec<_>>()
        .join(",");

    let mut cluster = Cluster::new(name, "", DeployMode::Manual, components)?
        .with_attr(cluster_attr::CLUSTER_TYPE, "tidb-cluster")
        .with_attr(cluster_attr::PD_ENDPOINTS, pd_endpoints);
    if let Some(id) = endpoints.cluster_id.as_ref().filter(|id| !id.is_empty()) {
        cluster = cluster.with_attr(cluster_attr::CLUSTER_ID, id.clone());
    }

    Ok(Discovered {
        cluster,
        ssh: None,
        source_document: None,
    })
}
