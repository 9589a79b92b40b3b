//! Control-plane node discovery through kubectl

use serde::Deserialize;

use crate::config::StatePaths;
use crate::exec::{argv, CommandRunner};
use crate::{Error, Result};

/// Label carried by every control-plane node
pub const CONTROL_PLANE_SELECTOR: &str =
    "node.kubernetes.io/microk8s-controlplane=microk8s-controlplane";

#[derive(Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<Node>,
}

#[derive(Deserialize)]
struct Node {
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Deserialize)]
struct NodeAddress {
    address: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Internal IPs from `kubectl get nodes -o json` output
pub fn parse_internal_ips(output: &str) -> Result<Vec<String>> {
    let list: NodeList = serde_json::from_str(output)
        .map_err(|e| Error::state("parse kubectl node list", e.to_string()))?;

    Ok(list
        .items
        .into_iter()
        .flat_map(|node| node.status.addresses)
        .filter(|a| a.kind == "InternalIP")
        .map(|a| a.address)
        .collect())
}

/// Internal IPs of the cluster's control-plane nodes
pub async fn control_plane_nodes(
    paths: &StatePaths,
    runner: &dyn CommandRunner,
) -> Result<Vec<String>> {
    let kubectl = paths.kubectl().display().to_string();
    let output = runner
        .output(&argv([
            kubectl.as_str(),
            "get",
            "nodes",
            "-l",
            CONTROL_PLANE_SELECTOR,
            "-o",
            "json",
        ]))
        .await
        .map_err(|e| e.within("list control plane nodes"))?;

    parse_internal_ips(&output)
}
