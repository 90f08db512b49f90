//! Argument and node-config generation for the kind CLI
//!
//! Pure functions only; process handling lives in the provisioner.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::config::{ClusterConfig, PortMapping};

/// Prefix for generated cluster names
pub const CLUSTER_NAME_PREFIX: &str = "kindtest";

/// kind's own readiness wait passed to `create cluster`
pub const KIND_WAIT: Duration = Duration::from_secs(60);

const KIND_API_VERSION: &str = "kind.x-k8s.io/v1alpha4";

/// Generate a unique cluster name
pub fn generate_cluster_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", CLUSTER_NAME_PREFIX, &id[..8])
}

/// kubeconfig context kind creates for a cluster
pub fn context_name(cluster_name: &str) -> String {
    format!("kind-{}", cluster_name)
}

/// Generate `kind create cluster` arguments
///
/// `image` is only passed on the command line when the nodes are not
/// described by a generated config (which already carries the image).
pub fn generate_create_args(
    name: &str,
    config_file: Option<&Path>,
    image: Option<&str>,
    wait: Duration,
) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "cluster".to_string(),
        "--name".to_string(),
        name.to_string(),
    ];

    if let Some(path) = config_file {
        args.push("--config".to_string());
        args.push(path.to_string_lossy().into_owned());
    }

    if let Some(image) = image {
        args.push("--image".to_string());
        args.push(image.to_string());
    }

    args.push(format!("--wait={}s", wait.as_secs()));
    args
}

/// Generate `kind delete cluster` arguments
pub fn generate_delete_args(name: &str) -> Vec<String> {
    vec![
        "delete".to_string(),
        "cluster".to_string(),
        "--name".to_string(),
        name.to_string(),
    ]
}

/// Generate `kind get clusters` arguments
pub fn generate_list_args() -> Vec<String> {
    vec!["get".to_string(), "clusters".to_string()]
}

/// Generate `kind export kubeconfig` arguments
pub fn generate_export_kubeconfig_args(name: &str, kubeconfig: &Path) -> Vec<String> {
    vec![
        "export".to_string(),
        "kubeconfig".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--kubeconfig".to_string(),
        kubeconfig.to_string_lossy().into_owned(),
    ]
}

/// Generate `kubectl get nodes` arguments for the readiness probe
pub fn generate_probe_args(kubeconfig: &Path) -> Vec<String> {
    vec![
        "--kubeconfig".to_string(),
        kubeconfig.to_string_lossy().into_owned(),
        "get".to_string(),
        "nodes".to_string(),
    ]
}

/// Parse `kind get clusters` output into cluster names
///
/// kind reports "No kind clusters found." on stderr, so stdout is simply
/// one name per line.
pub fn parse_cluster_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("No kind clusters"))
        .map(String::from)
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindClusterDocument {
    kind: &'static str,
    api_version: &'static str,
    nodes: Vec<KindNode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindNode {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    extra_port_mappings: Vec<PortMapping>,
}

/// Render a kind `Cluster` document for the merged configuration
///
/// One control-plane node (carrying the image and any port mappings) and
/// `workers` worker nodes on the same image.
pub fn generate_node_config(config: &ClusterConfig) -> Result<String, serde_yaml::Error> {
    let mut nodes = vec![KindNode {
        role: "control-plane",
        image: config.image.clone(),
        extra_port_mappings: config.extra_port_mappings.clone(),
    }];

    for _ in 0..config.workers {
        nodes.push(KindNode {
            role: "worker",
            image: config.image.clone(),
            extra_port_mappings: Vec::new(),
        });
    }

    serde_yaml::to_string(&KindClusterDocument {
        kind: "Cluster",
        api_version: KIND_API_VERSION,
        nodes,
    })
}
