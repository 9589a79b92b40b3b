//! Node admission
//!
//! Two join protocols exist side by side:
//!
//! - [`v1`]: legacy clusters with a single control plane on etcd
//! - [`v2`]: HA clusters on the consensus store, for control-plane and
//!   worker-only joiners
//!
//! Both spend the admission token before doing anything else and never give
//! it back, so a failed join must be retried with a fresh token.

pub mod v1;
pub mod v2;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::config::StatePaths;
use crate::error::io_state;
use crate::membership::split_host_port;
use crate::Result;

pub use v1::JoinCoordinatorV1;
pub use v2::JoinCoordinatorV2;

/// Checks whether a claimed hostname resolves
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// True when `hostname` resolves to at least one address
    async fn resolves(&self, hostname: &str) -> bool;
}

/// Resolves through the host's resolver configuration
#[derive(Clone, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolves(&self, hostname: &str) -> bool {
        if hostname.is_empty() {
            return false;
        }
        match tokio::net::lookup_host((hostname, 0)).await {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(e) => {
                debug!(hostname, error = %e, "Hostname does not resolve");
                false
            }
        }
    }
}

/// Name the cluster will use for a joining node.
///
/// The claimed hostname wins when it resolves; otherwise the IP the request
/// came from is used.
pub async fn resolve_remote_host(
    resolver: &dyn HostResolver,
    claimed: &str,
    remote_address: &str,
) -> String {
    if resolver.resolves(claimed).await {
        claimed.to_string()
    } else {
        split_host_port(remote_address).0.to_string()
    }
}

/// Kubelet arguments for the joiner, pinned to `resolved` when it differs
/// from the claimed hostname
async fn kubelet_arguments(paths: &StatePaths, resolved: &str, claimed: &str) -> Result<String> {
    let mut args = tokio::fs::read_to_string(paths.service_args("kubelet"))
        .await
        .map_err(|e| io_state("read arguments of kubelet service", e))?;
    if resolved != claimed {
        args.push_str(&format!("\n--hostname-override={resolved}"));
    }
    Ok(args)
}

/// Disable automatic certificate reissue now that the node has peers
async fn disable_cert_reissue(paths: &StatePaths) -> Result<()> {
    let marker = paths.no_cert_reissue_marker();
    if let Some(parent) = marker.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_state("create lock directory", e))?;
    }
    tokio::fs::write(&marker, b"")
        .await
        .map_err(|e| io_state("disable certificate reissue", e))
}
