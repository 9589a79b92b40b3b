//! Agent configuration
//!
//! All state lives in files below two roots: the writable data directory and
//! the read-only install directory. [`StatePaths`] resolves every artifact
//! the agent touches, and [`AgentConfig`] bundles the paths with the cluster
//! mode and service topology detected at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

/// Whether the consensus store (HA datastore) backs this cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterMode {
    /// Replicated consensus store, joins go through the v2 API
    Ha,
    /// Single control plane with etcd, joins go through the v1 API
    Legacy,
}

/// How the Kubernetes daemons are packaged on this node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceTopology {
    /// apiserver, kubelet, proxy, scheduler and controller-manager run in one
    /// `kubelite` process
    Merged,
    /// Every daemon is its own service
    Split,
}

/// Locations of every file the agent reads or writes
#[derive(Clone, Debug)]
pub struct StatePaths {
    data_dir: PathBuf,
    install_dir: PathBuf,
}

impl StatePaths {
    /// Create paths rooted at the given data and install directories
    pub fn new(data_dir: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            install_dir: install_dir.into(),
        }
    }

    /// Writable state root
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Read-only install root
    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    fn data(&self, parts: &[&str]) -> PathBuf {
        parts.iter().fold(self.data_dir.clone(), |p, part| p.join(part))
    }

    fn install(&self, parts: &[&str]) -> PathBuf {
        parts
            .iter()
            .fold(self.install_dir.clone(), |p, part| p.join(part))
    }

    // -------------------------------------------------------------------------
    // Credentials
    // -------------------------------------------------------------------------

    /// Admission tokens, one `token` or `token|expiry` per line
    pub fn cluster_tokens(&self) -> PathBuf {
        self.data(&["credentials", "cluster-tokens.txt"])
    }

    /// Certificate-request tokens
    pub fn cert_request_tokens(&self) -> PathBuf {
        self.data(&["credentials", "certs-request-tokens.txt"])
    }

    /// Callback tokens of peers, `endpoint token` per line
    pub fn callback_tokens(&self) -> PathBuf {
        self.data(&["credentials", "callback-tokens.txt"])
    }

    /// This node's own callback token
    pub fn self_callback_token(&self) -> PathBuf {
        self.data(&["credentials", "callback-token.txt"])
    }

    /// Static bearer tokens, `token,identity,short-name,groups`
    pub fn known_tokens(&self) -> PathBuf {
        self.data(&["credentials", "known_tokens.csv"])
    }

    // -------------------------------------------------------------------------
    // Certificates
    // -------------------------------------------------------------------------

    /// Cluster CA certificate
    pub fn ca_cert(&self) -> PathBuf {
        self.data(&["certs", "ca.crt"])
    }

    /// Cluster CA private key
    pub fn ca_key(&self) -> PathBuf {
        self.data(&["certs", "ca.key"])
    }

    /// Serial number of the last certificate signed by the CA
    pub fn ca_serial(&self) -> PathBuf {
        self.data(&["certs", "ca.srl"])
    }

    /// Service account token signing key
    pub fn service_account_key(&self) -> PathBuf {
        self.data(&["certs", "serviceaccount.key"])
    }

    // -------------------------------------------------------------------------
    // Service arguments
    // -------------------------------------------------------------------------

    /// Argument file of a service
    pub fn service_args(&self, service: &str) -> PathBuf {
        self.data(&["args", service])
    }

    /// CNI manifest applied to the cluster
    pub fn cni_manifest(&self) -> PathBuf {
        self.data(&["args", "cni-network", "cni.yaml"])
    }

    // -------------------------------------------------------------------------
    // Consensus store
    // -------------------------------------------------------------------------

    /// Membership list maintained by the consensus store
    pub fn cluster_membership(&self) -> PathBuf {
        self.data(&["var", "kubernetes", "backend", "cluster.yaml"])
    }

    /// This node's own membership record
    pub fn local_node_info(&self) -> PathBuf {
        self.data(&["var", "kubernetes", "backend", "info.yaml"])
    }

    /// Rebind request picked up by the consensus store on restart
    pub fn rebind_request(&self) -> PathBuf {
        self.data(&["var", "kubernetes", "backend", "update.yaml"])
    }

    /// Client certificate for the consensus store
    pub fn datastore_cert(&self) -> PathBuf {
        self.data(&["var", "kubernetes", "backend", "cluster.crt"])
    }

    /// Client key for the consensus store
    pub fn datastore_key(&self) -> PathBuf {
        self.data(&["var", "kubernetes", "backend", "cluster.key"])
    }

    // -------------------------------------------------------------------------
    // Markers
    // -------------------------------------------------------------------------

    /// Present when the cluster runs on the consensus store
    pub fn ha_marker(&self) -> PathBuf {
        self.data(&["var", "lock", "ha-cluster"])
    }

    /// Present when the Kubernetes daemons run as one kubelite process
    pub fn kubelite_marker(&self) -> PathBuf {
        self.data(&["var", "lock", "lite.lock"])
    }

    /// Present once this node joined or admitted a peer; disables
    /// automatic certificate reissue
    pub fn no_cert_reissue_marker(&self) -> PathBuf {
        self.data(&["var", "lock", "no-cert-reissue"])
    }

    // -------------------------------------------------------------------------
    // Tools
    // -------------------------------------------------------------------------

    /// kubectl wrapper bound to the local cluster
    pub fn kubectl(&self) -> PathBuf {
        self.install(&["microk8s-kubectl.wrapper"])
    }

    /// Addon enable wrapper
    pub fn enable_addon(&self) -> PathBuf {
        self.install(&["microk8s-enable.wrapper"])
    }

    /// Addon disable wrapper
    pub fn disable_addon(&self) -> PathBuf {
        self.install(&["microk8s-disable.wrapper"])
    }

    /// Node-side script of one upgrade phase
    pub fn upgrade_script(&self, upgrade: &str, phase: &str) -> PathBuf {
        self.install(&["upgrade-scripts", upgrade, &format!("{phase}-node.sh")])
    }
}

/// Explicit configuration handed to every coordinator
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// File locations
    pub paths: StatePaths,
    /// Legacy or HA cluster
    pub mode: ClusterMode,
    /// Merged or split daemons
    pub topology: ServiceTopology,
    /// Per-request deadline applied by the transport
    pub request_timeout: Duration,
}

impl AgentConfig {
    /// Build a config by probing the marker files once
    pub fn detect(paths: StatePaths, request_timeout: Duration) -> Self {
        let mode = if paths.ha_marker().exists() {
            ClusterMode::Ha
        } else {
            ClusterMode::Legacy
        };
        let topology = if paths.kubelite_marker().exists() {
            ServiceTopology::Merged
        } else {
            ServiceTopology::Split
        };

        info!(?mode, ?topology, data_dir = %paths.data_dir().display(), "Detected node configuration");

        Self {
            paths,
            mode,
            topology,
            request_timeout,
        }
    }
}
