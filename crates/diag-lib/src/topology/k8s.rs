//! Discovery from the cluster custom resource on Kubernetes

use super::{attr, cluster_attr, Cluster, Component, ComponentKind, DeployMode, Discovered};
use crate::error::{DiagError, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

const GROUP: &str = "pingcap.com";
const VERSION: &str = "v1alpha1";

/// Name and namespace of the cluster resource
#[derive(Debug, Clone)]
pub struct KubeTarget {
    pub name: String,
    /// Falls back to `$NAMESPACE`, then `default`
    pub namespace: Option<String>,
}

impl KubeTarget {
    pub fn namespace(&self) -> String {
        self.namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .or_else(|| std::env::var("NAMESPACE").ok().filter(|ns| !ns.is_empty()))
            .unwrap_or_else(|| "default".to_string())
    }
}

fn resource(kind: &str, plural: &str) -> ApiResource {
    let gvk = GroupVersionKind::gvk(GROUP, VERSION, kind);
    ApiResource::from_gvk_with_plural(&gvk, plural)
}

fn kube_err(err: kube::Error) -> DiagError {
    match err {
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => DiagError::AuthFailed {
            host: "kubernetes api".to_string(),
            message: resp.message,
        },
        other => DiagError::Unreachable {
            target: "kubernetes api".to_string(),
            message: other.to_string(),
        },
    }
}

/// Locate the named cluster resource and build its components
pub async fn discover_kubernetes(target: &KubeTarget) -> Result<Discovered> {
    let ns = target.namespace();
    let client = Client::try_default().await.map_err(kube_err)?;

    let clusters: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), &ns, &resource("TidbCluster", "tidbclusters"));
    let tc = clusters
        .get_opt(&target.name)
        .await
        .map_err(kube_err)?
        .ok_or_else(|| {
            DiagError::TopologyNotFound(format!("{} in namespace {}", target.name, ns))
        })?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &ns);
    let mut running = HashMap::new();
    for pod in pods.list(&ListParams::default()).await.map_err(kube_err)? {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let status = pod.status.unwrap_or_default();
        if status.phase.as_deref() != Some("Running") {
            debug!(pod = %name, phase = ?status.phase, "Skipping pod that is not running");
            continue;
        }
        if let Some(ip) = status.pod_ip {
            running.insert(name, ip);
        }
    }

    let mut components = components_from_resource(&target.name, &ns, &tc.data, &running);

    let monitors: Api<DynamicObject> =
        Api::namespaced_with(client, &ns, &resource("TidbMonitor", "tidbmonitors"));
    match monitors.list(&ListParams::default()).await {
        Ok(list) => {
            for tm in list.items {
                if monitor_targets(&tm.data, &target.name) {
                    let tm_name = tm.metadata.name.unwrap_or_default();
                    components.push(Component::new(
                        ComponentKind::Monitor,
                        format!("{}-prometheus.{}.svc", tm_name, ns),
                        9090,
                        9090,
                    ));
                }
            }
        }
        Err(e) => warn!(error = %e, "Failed to list monitor resources"),
    }

    let cluster_id = tc.data["status"]["clusterID"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let version = tc.data["spec"]["version"].as_str().unwrap_or_default();

    let cluster = Cluster::new(&target.name, version, DeployMode::Kubernetes, components)?
        .with_attr(cluster_attr::CLUSTER_ID, cluster_id)
        .with_attr(cluster_attr::CLUSTER_TYPE, "tidb-cluster")
        .with_attr(cluster_attr::NAMESPACE, ns);

    let document = serde_json::to_vec_pretty(&tc)?;
    Ok(Discovered {
        cluster,
        ssh: None,
        source_document: Some(("tidbcluster.json".to_string(), document)),
    })
}

fn monitor_targets(data: &Value, cluster: &str) -> bool {
    data["spec"]["clusters"]
        .as_array()
        .map(|cs| cs.iter().any(|c| c["name"].as_str() == Some(cluster)))
        .unwrap_or(false)
}

/// Build components from the `status` of a cluster resource.
///
/// `running` maps running pod names to their IP; members whose pod is not
/// running are skipped. Unhealthy members are kept and marked.
pub fn components_from_resource(
    cluster: &str,
    ns: &str,
    data: &Value,
    running: &HashMap<String, String>,
) -> Vec<Component> {
    let status = &data["status"];
    let mut out = Vec::new();

    let tiers: [(ComponentKind, &str, &str, &str); 5] = [
        (ComponentKind::Coordinator, "pd", "members", "name"),
        (ComponentKind::SqlGateway, "tidb", "members", "name"),
        (ComponentKind::KvStore, "tikv", "stores", "podName"),
        (ComponentKind::ColumnarStore, "tiflash", "stores", "podName"),
        (ComponentKind::ChangeDataCapture, "ticdc", "captures", "podName"),
    ];

    for (kind, tier, field, pod_key) in tiers {
        let Some(members) = status[tier][field].as_object() else {
            continue;
        };
        for member in members.values() {
            let Some(pod) = member[pod_key].as_str() else {
                continue;
            };
            let Some(ip) = running.get(pod) else {
                warn!(pod = %pod, kind = %kind, "Pod is not running, skipping it");
                continue;
            };
            let healthy = match kind {
                ComponentKind::Coordinator | ComponentKind::SqlGateway => {
                    member["health"].as_bool().unwrap_or(true)
                }
                ComponentKind::KvStore | ComponentKind::ColumnarStore => {
                    member["state"].as_str().map(|s| s == "Up").unwrap_or(true)
                }
                _ => true,
            };
            if !healthy {
                warn!(pod = %pod, kind = %kind, "Component is unhealthy, collecting anyway");
            }

            let (port, status_port) = kind.default_ports();
            out.push(
                Component::new(kind, ip.clone(), port, status_port)
                    .with_attr(attr::POD, pod)
                    .with_attr(attr::HEALTHY, healthy.to_string())
                    .with_attr(
                        "domain",
                        format!("{}.{}-{}-peer.{}.svc", pod, cluster, tier, ns),
                    ),
            );
        }
    }

    out.sort_by(|a, b| (a.kind, &a.host).cmp(&(b.kind, &b.host)));
    out
}
