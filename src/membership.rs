//! Consensus store membership
//!
//! The consensus store publishes its member list in `cluster.yaml` and this
//! node's own record in `info.yaml`. Both are owned by the store; the agent
//! only reads them. The one write the agent performs is the rebind request
//! (`update.yaml`) used when a fresh single-node store, still bound to the
//! loopback placeholder, admits its first peer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::StatePaths;
use crate::error::io_state;
use crate::lock::ResourceLocks;
use crate::services::ServiceManager;
use crate::{Error, Result};

/// Host a new consensus store binds to before it has peers
pub const LOOPBACK_PLACEHOLDER: &str = "127.0.0.1";

/// Cadence of the membership poll-wait
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consensus group role of a member
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeRole {
    /// Participates in quorum
    #[default]
    Voter,
    /// Replicates the log, promoted when a voter is lost
    StandBy,
    /// Neither votes nor replicates
    Spare,
}

impl TryFrom<u8> for NodeRole {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Voter),
            1 => Ok(Self::StandBy),
            2 => Ok(Self::Spare),
            other => Err(format!("unknown node role {other}")),
        }
    }
}

impl From<NodeRole> for u8 {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Voter => 0,
            NodeRole::StandBy => 1,
            NodeRole::Spare => 2,
        }
    }
}

/// One member of the consensus group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipNode {
    /// Dialable `host:port`
    #[serde(rename = "Address")]
    pub address: String,
    /// Stable node identifier
    #[serde(rename = "ID", default)]
    pub id: u64,
    /// Consensus role
    #[serde(rename = "Role", default)]
    pub role: NodeRole,
}

impl MembershipNode {
    /// Host part of the address
    pub fn host(&self) -> &str {
        split_host_port(&self.address).0
    }

    /// Whether this member is still bound to the loopback placeholder
    pub fn is_placeholder(&self) -> bool {
        self.address.starts_with(&format!("{LOOPBACK_PLACEHOLDER}:"))
    }
}

/// Ordered member list, as published by the consensus store
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MembershipList(pub Vec<MembershipNode>);

impl MembershipList {
    /// Parse the YAML list published by the consensus store
    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let nodes: Option<Vec<MembershipNode>> = serde_yaml::from_str(contents)
            .map_err(|e| Error::state("parse consensus membership", e.to_string()))?;
        Ok(Self(nodes.unwrap_or_default()))
    }

    /// Members in store order
    pub fn nodes(&self) -> &[MembershipNode] {
        &self.0
    }

    /// Addresses of the voting members
    pub fn voters(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|n| n.role == NodeRole::Voter)
            .map(|n| n.address.clone())
            .collect()
    }

    /// Whether some member's address has `host` as its host part
    pub fn contains_host(&self, host: &str) -> bool {
        self.0.iter().any(|n| n.host() == host)
    }

    /// True for a fresh store whose only member is the loopback placeholder
    pub fn awaiting_bootstrap(&self) -> bool {
        matches!(self.0.as_slice(), [only] if only.is_placeholder())
    }
}

/// Split `host:port`, tolerating bracketed IPv6 hosts
pub fn split_host_port(address: &str) -> (&str, &str) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
        None => (address, ""),
    }
}

/// Join a host and port, bracketing IPv6 hosts
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Contents of the rebind request picked up by the consensus store
#[derive(Serialize)]
struct RebindRequest<'a> {
    #[serde(rename = "Address")]
    address: &'a str,
}

/// Read side of the consensus store, plus the bootstrap rebind hook
#[derive(Clone)]
pub struct MembershipView {
    paths: StatePaths,
    services: ServiceManager,
    locks: ResourceLocks,
}

impl MembershipView {
    /// Create a view over the store's files
    pub fn new(paths: StatePaths, services: ServiceManager, locks: ResourceLocks) -> Self {
        Self {
            paths,
            services,
            locks,
        }
    }

    /// Current member list
    pub async fn get_membership(&self) -> Result<MembershipList> {
        let path = self.paths.cluster_membership();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_state("read consensus membership", e))?;
        MembershipList::parse(&contents)
    }

    /// Poll the member list until `predicate` holds.
    ///
    /// The list is read immediately and then once per [`POLL_INTERVAL`].
    /// Passing `deadline` yields a timeout error; an unreadable list aborts
    /// the wait with a state error. Dropping the future stops the wait.
    pub async fn await_membership<F>(&self, predicate: F, deadline: Instant) -> Result<MembershipList>
    where
        F: Fn(&MembershipList) -> bool,
    {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let list = self.get_membership().await?;
            if predicate(&list) {
                return Ok(list);
            }
            debug!(members = list.nodes().len(), "Membership condition not met yet");

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::timeout(
                        "await consensus membership",
                        "deadline exceeded before membership converged",
                    ));
                }
                _ = ticker.tick() => {}
            }
        }
    }

    /// Exclusive hold over the bootstrap transition
    ///
    /// Concurrent joins into a fresh store must not both decide to rebind it.
    pub async fn bootstrap_guard(&self) -> OwnedMutexGuard<()> {
        self.locks.lock(&self.paths.cluster_membership()).await
    }

    /// Rebind the local consensus node to `new_host`, keeping its port.
    ///
    /// Stages `update.yaml` and restarts the consensus store and then the
    /// API server so both come back on the new address.
    pub async fn rebind_local_node(&self, new_host: &str) -> Result<()> {
        let request_path = self.paths.rebind_request();
        let _guard = self.locks.lock(&request_path).await;

        let info = tokio::fs::read_to_string(self.paths.local_node_info())
            .await
            .map_err(|e| io_state("read local consensus node info", e))?;
        let node: MembershipNode = serde_yaml::from_str(&info)
            .map_err(|e| Error::state("parse local consensus node info", e.to_string()))?;

        let (_, port) = split_host_port(&node.address);
        let address = join_host_port(new_host, port);
        let request = serde_yaml::to_string(&RebindRequest { address: &address })
            .map_err(|e| Error::state("encode rebind request", e.to_string()))?;

        tokio::fs::write(&request_path, request)
            .await
            .map_err(|e| io_state("write rebind request", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&request_path, std::fs::Permissions::from_mode(0o660))
                .await
                .map_err(|e| io_state("set rebind request permissions", e))?;
        }
        info!(address = %address, "Staged consensus store rebind");

        self.services
            .restart("k8s-dqlite")
            .await
            .map_err(|e| e.within("rebind consensus store"))?;
        self.services
            .restart("apiserver")
            .await
            .map_err(|e| e.within("rebind consensus store"))?;
        Ok(())
    }
}
