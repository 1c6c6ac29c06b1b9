//! Run metadata: `cluster.json`, `meta.yaml` and the raw topology source

use crate::error::{DiagError, Result};
use crate::http::HttpFetcher;
use crate::models::{ClusterJson, CollectRequest, RunMeta, DIAG_VERSION};
use crate::packager::CLUSTER_JSON;
use crate::topology::{cluster_attr, Cluster, ComponentKind};
use chrono::SecondsFormat;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const META_YAML: &str = "meta.yaml";

const ID_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct PdCluster {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct DmClusterInfo {
    cluster_id: serde_json::Value,
}

fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Cluster id from the topology, or from the first coordinator (dm-master for
/// DM clusters) that answers. Failures are logged and yield `None`.
pub async fn fetch_cluster_id(cluster: &Cluster, fetcher: &HttpFetcher) -> Option<String> {
    if let Some(id) = cluster.attr(cluster_attr::CLUSTER_ID) {
        return Some(id.to_string());
    }

    let dm = cluster.attr(cluster_attr::CLUSTER_TYPE) == Some("dm-cluster");
    let (kind, path) = if dm {
        (ComponentKind::DmMaster, "/api/v1/cluster/info")
    } else {
        (ComponentKind::Coordinator, "/pd/api/v1/cluster")
    };

    for c in cluster.of_kind(kind) {
        let url = fetcher.url(&c.status_address(), path);
        let body = match fetcher.get(&url, ID_TIMEOUT).await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %url, error = %e, "Cluster id unavailable");
                continue;
            }
        };
        let id = if dm {
            serde_json::from_slice::<DmClusterInfo>(&body)
                .ok()
                .and_then(|info| id_string(&info.cluster_id))
        } else {
            serde_json::from_slice::<PdCluster>(&body)
                .ok()
                .map(|pd| pd.id.to_string())
        };
        if let Some(id) = id {
            info!(cluster_id = %id, source = %c.id(), "Fetched cluster id");
            return Some(id);
        }
    }
    warn!(cluster = %cluster.name, "Could not determine cluster id");
    None
}

/// Contents of `cluster.json` for a run
pub fn build_cluster_json(
    cluster: &Cluster,
    request: &CollectRequest,
    session: &str,
    cluster_id: Option<String>,
) -> Result<ClusterJson> {
    Ok(ClusterJson {
        diag_version: DIAG_VERSION.to_string(),
        cluster_name: cluster.name.clone(),
        cluster_id: cluster_id.unwrap_or_default(),
        cluster_type: cluster
            .attr(cluster_attr::CLUSTER_TYPE)
            .unwrap_or("tidb-cluster")
            .to_string(),
        deploy_type: cluster.mode.as_str().to_string(),
        session: session.to_string(),
        begin_time: request.window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        end_time: request.window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        collectors: request.collectors.iter().map(|k| k.name().to_string()).collect(),
        raw_request: serde_json::to_value(request)?,
        topology: cluster.clone(),
    })
}

pub async fn write_cluster_json(result_dir: &Path, doc: &ClusterJson) -> Result<()> {
    let data = serde_json::to_vec_pretty(doc)?;
    tokio::fs::write(result_dir.join(CLUSTER_JSON), data).await?;
    Ok(())
}

pub async fn write_meta(result_dir: &Path, meta: &RunMeta) -> Result<()> {
    let data = serde_yaml::to_string(meta)?;
    tokio::fs::write(result_dir.join(META_YAML), data).await?;
    Ok(())
}

/// Save the document the topology was discovered from
pub async fn write_source_document(result_dir: &Path, name: &str, content: &[u8]) -> Result<()> {
    let file_name = Path::new(name)
        .file_name()
        .ok_or_else(|| DiagError::Bug(format!("invalid source document name '{}'", name)))?;
    tokio::fs::write(result_dir.join(file_name), content).await?;
    Ok(())
}
