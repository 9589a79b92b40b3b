//! HA join into a cluster backed by the consensus store
//!
//! The first control-plane join into a fresh store also performs the
//! bootstrap transition: the store is still bound to the loopback
//! placeholder and has to be rebound to the address peers can dial before
//! the joiner can become a member.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::config::{AgentConfig, ClusterMode};
use crate::exec::CommandRunner;
use crate::issuer::CredentialIssuer;
use crate::membership::{split_host_port, MembershipList, MembershipView};
use crate::services::service_argument;
use crate::token::{TokenCategory, TokenStore};
use crate::{cni, kubectl, Error, Result};

use super::{disable_cert_reissue, kubelet_arguments, resolve_remote_host, HostResolver};

/// Sentinel accepted in place of `true` for the `worker` field
pub const AS_WORKER: &str = "as-worker";

/// The `worker` request field.
///
/// True only for JSON `true` or the string `"as-worker"`; any other value,
/// including `null` and other strings, means a control-plane join.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerOnly(pub bool);

impl<'de> Deserialize<'de> for WorkerOnly {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self(
            value.as_bool() == Some(true) || value.as_str() == Some(AS_WORKER),
        ))
    }
}

/// Body of an HA join request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct JoinRequest {
    /// Admission token
    #[serde(rename = "token")]
    pub cluster_token: String,
    /// Hostname the joiner claims
    pub hostname: String,
    /// Port of the joiner's agent, must match ours
    #[serde(rename = "port")]
    pub agent_port: String,
    /// Join as a worker without control-plane duties
    pub worker: WorkerOnly,
}

/// Everything an HA joiner needs; trust material only for control-plane
/// joiners
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Cluster CA certificate
    pub ca: String,
    /// This node's callback token
    pub callback_token: String,
    /// API server port
    pub apiport: String,
    /// Kubelet arguments for the joiner
    pub kubelet_args: String,
    /// Name the joiner is known by
    pub hostname_override: String,
    /// Voting consensus members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub voters: Vec<String>,
    /// Service account signing key
    #[serde(default)]
    pub service_account_key: String,
    /// Static admin token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub admin_token: String,
    /// CA private key, explicitly null for workers
    #[serde(default)]
    pub ca_key: Option<String>,
    /// Consensus store client certificate
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_cert: String,
    /// Consensus store client key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_key: String,
    /// Known control-plane node addresses, for workers only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_nodes: Option<Vec<String>>,
}

/// Runs HA joins
#[derive(Clone)]
pub struct JoinCoordinatorV2 {
    config: AgentConfig,
    tokens: TokenStore,
    issuer: CredentialIssuer,
    membership: MembershipView,
    runner: Arc<dyn CommandRunner>,
    resolver: Arc<dyn HostResolver>,
}

impl JoinCoordinatorV2 {
    /// Create a coordinator
    pub fn new(
        config: AgentConfig,
        tokens: TokenStore,
        issuer: CredentialIssuer,
        membership: MembershipView,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            config,
            tokens,
            issuer,
            membership,
            runner,
            resolver,
        }
    }

    /// Admit a node into an HA cluster.
    ///
    /// `host_port` is the local address that accepted the request and
    /// `remote_address` the peer address it came from. `deadline` bounds
    /// the wait for the consensus store during the bootstrap transition.
    pub async fn join(
        &self,
        request: &JoinRequest,
        host_port: &str,
        remote_address: &str,
        deadline: Instant,
    ) -> Result<JoinResponse> {
        if self.config.mode != ClusterMode::Ha {
            return Err(Error::conflict("join cluster", "this is not an HA cluster"));
        }

        self.tokens
            .consume_valid(&request.cluster_token, TokenCategory::Admission)
            .await?;

        let paths = &self.config.paths;
        let bind = service_argument(paths, "cluster-agent", "--bind")
            .await
            .unwrap_or_default();
        let (_, port) = split_host_port(&bind);
        if port != request.agent_port {
            return Err(Error::validation(
                "verify cluster agent port",
                format!("cluster agent port needs to be set to {port}"),
            ));
        }

        let hostname =
            resolve_remote_host(self.resolver.as_ref(), &request.hostname, remote_address).await;
        let worker = request.worker.0;
        info!(hostname = %hostname, worker, "Admitting node into HA cluster");

        let membership = self.check_and_bootstrap(&hostname, host_port, deadline).await?;

        let callback_token = self
            .tokens
            .self_callback_token()
            .await
            .map_err(|e| e.within("retrieve self callback token"))?;
        let ca = self.issuer.ca_certificate().await?;
        let kubelet_args = kubelet_arguments(paths, &hostname, &request.hostname).await?;

        cni::apply_can_reach_detection(paths, self.runner.as_ref(), &hostname).await?;
        disable_cert_reissue(paths).await?;

        let mut response = JoinResponse {
            ca,
            callback_token,
            apiport: service_argument(paths, "kube-apiserver", "--secure-port")
                .await
                .unwrap_or_default(),
            kubelet_args,
            hostname_override: hostname,
            ..Default::default()
        };

        if worker {
            self.issuer.worker_bundle(&request.cluster_token).await?;
            response.control_plane_nodes =
                Some(kubectl::control_plane_nodes(paths, self.runner.as_ref()).await?);
        } else {
            let bundle = self.issuer.control_plane_bundle(&membership).await?;
            response.ca_key = Some(bundle.ca_key);
            response.service_account_key = bundle.service_account_key;
            response.admin_token = bundle.admin_token;
            response.cluster_cert = bundle.cluster_cert;
            response.cluster_key = bundle.cluster_key;
            response.voters = bundle.voters;
        }

        info!(hostname = %response.hostname_override, worker, "Node joined HA cluster");
        Ok(response)
    }

    /// Refuse known members and rebind a fresh store, returning the
    /// membership the rest of the join works from
    async fn check_and_bootstrap(
        &self,
        hostname: &str,
        host_port: &str,
        deadline: Instant,
    ) -> Result<MembershipList> {
        let _bootstrap = self.membership.bootstrap_guard().await;

        let membership = self
            .membership
            .get_membership()
            .await
            .map_err(|e| e.within("retrieve consensus members"))?;
        if membership.contains_host(hostname) {
            return Err(Error::conflict(
                "check consensus membership",
                format!("joining node {hostname:?} is already known to the consensus store"),
            ));
        }

        if !membership.awaiting_bootstrap() {
            return Ok(membership);
        }

        let (local_host, _) = split_host_port(host_port);
        info!(address = local_host, "Rebinding consensus store for first peer");
        self.membership
            .rebind_local_node(local_host)
            .await
            .map_err(|e| e.within(&format!("update consensus store address to {local_host:?}")))?;

        self.membership
            .await_membership(
                |list| list.nodes().first().is_some_and(|n| !n.is_placeholder()),
                deadline,
            )
            .await
            .map_err(|e| e.within("wait for consensus store"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{ServiceTopology, StatePaths};
    use crate::exec::RecordingCommandRunner;
    use crate::join::testing::{paths, seed, HA_NODE};
    use crate::join::MockHostResolver;
    use crate::lock::ResourceLocks;
    use crate::pki::MockCertificateSigner;
    use crate::services::ServiceManager;
    use crate::token::KnownTokens;

    const CONTROL_PLANE_NODES: &str = r#"{"items":[
        {"status":{"addresses":[{"address":"10.10.10.10","type":"InternalIP"}]}},
        {"status":{"addresses":[{"address":"10.10.10.11","type":"InternalIP"}]}}
    ]}"#;

    struct Node {
        dir: tempfile::TempDir,
        paths: StatePaths,
        tokens: TokenStore,
        runner: Arc<RecordingCommandRunner>,
        coordinator: JoinCoordinatorV2,
    }

    fn node_with(files: &[(&str, &str)], mode: ClusterMode, runner: RecordingCommandRunner) -> Node {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), files);
        let paths = paths(dir.path());
        let locks = ResourceLocks::new();

        let tokens = TokenStore::new(paths.clone(), locks.clone());
        let known = KnownTokens::new(paths.clone(), locks.clone());
        let issuer = CredentialIssuer::new(
            paths.clone(),
            tokens.clone(),
            known,
            Arc::new(MockCertificateSigner::new()),
        );
        let runner = Arc::new(runner);
        let services = ServiceManager::new(runner.clone(), ServiceTopology::Split);
        let membership = MembershipView::new(paths.clone(), services, locks);

        let mut resolver = MockHostResolver::new();
        resolver.expect_resolves().returning(|_| false);

        let coordinator = JoinCoordinatorV2::new(
            AgentConfig {
                paths: paths.clone(),
                mode,
                topology: ServiceTopology::Split,
                request_timeout: Duration::from_secs(5),
            },
            tokens.clone(),
            issuer,
            membership,
            runner.clone(),
            Arc::new(resolver),
        );
        Node {
            dir,
            paths,
            tokens,
            runner,
            coordinator,
        }
    }

    fn node() -> Node {
        // Only the node listing captures output, so an empty prefix suffices.
        node_with(
            HA_NODE,
            ClusterMode::Ha,
            RecordingCommandRunner::new().with_output("", CONTROL_PLANE_NODES),
        )
    }

    fn request(token: &str, hostname: &str, worker: bool) -> JoinRequest {
        JoinRequest {
            cluster_token: token.to_string(),
            hostname: hostname.to_string(),
            agent_port: "25000".to_string(),
            worker: WorkerOnly(worker),
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    fn apply_cni(paths: &StatePaths) -> String {
        format!(
            "{} apply -f {}",
            paths.kubectl().display(),
            paths.cni_manifest().display()
        )
    }

    // =========================================================================
    // Story: joining an established HA cluster
    // =========================================================================

    #[tokio::test]
    async fn story_control_plane_join_receives_trust_material() {
        let node = node();

        let resp = node
            .coordinator
            .join(
                &request("control-plane-token", "some-invalid-hostname", false),
                "10.10.10.10:25000",
                "10.10.10.13:41532",
                deadline(),
            )
            .await
            .unwrap();

        let expected = JoinResponse {
            ca: "CA CERTIFICATE DATA".into(),
            callback_token: "callback-token".into(),
            apiport: "16443".into(),
            kubelet_args: "kubelet arguments\n\n--hostname-override=10.10.10.13".into(),
            hostname_override: "10.10.10.13".into(),
            voters: vec!["10.10.10.10:19001".into(), "10.10.10.11:19001".into()],
            service_account_key: "SERVICE ACCOUNT KEY DATA".into(),
            admin_token: "admin-token-123".into(),
            ca_key: Some("CA KEY DATA".into()),
            cluster_cert: "DQLITE CERTIFICATE DATA".into(),
            cluster_key: "DQLITE KEY DATA".into(),
            control_plane_nodes: None,
        };
        assert_eq!(resp, expected);

        assert!(!node.tokens.is_valid("control-plane-token", TokenCategory::Admission).await);
        assert_eq!(node.runner.calls(), vec![apply_cni(&node.paths)]);
        assert!(node.paths.no_cert_reissue_marker().exists());

        let cni = std::fs::read_to_string(node.paths.cni_manifest()).unwrap();
        assert!(cni.contains("\"can-reach=10.10.10.13\""));
    }

    #[tokio::test]
    async fn story_worker_join_gets_request_tokens_not_trust_material() {
        let node = node();

        let resp = node
            .coordinator
            .join(
                &request("worker-token", "10.10.10.12", true),
                "10.10.10.10:25000",
                "10.10.10.12:31451",
                deadline(),
            )
            .await
            .unwrap();

        assert_eq!(resp.ca, "CA CERTIFICATE DATA");
        assert_eq!(resp.callback_token, "callback-token");
        assert_eq!(resp.kubelet_args, "kubelet arguments\n");
        assert_eq!(resp.hostname_override, "10.10.10.12");
        assert_eq!(
            resp.control_plane_nodes,
            Some(vec!["10.10.10.10".to_string(), "10.10.10.11".to_string()])
        );
        assert!(resp.ca_key.is_none());
        assert!(resp.service_account_key.is_empty());
        assert!(resp.admin_token.is_empty());
        assert!(resp.cluster_cert.is_empty());
        assert!(resp.cluster_key.is_empty());
        assert!(resp.voters.is_empty());

        for minted in ["worker-token-kubelet", "worker-token-proxy"] {
            assert!(
                node.tokens
                    .is_valid(minted, TokenCategory::CertificateRequest)
                    .await
            );
        }

        let calls = node.runner.calls();
        assert_eq!(calls[0], apply_cni(&node.paths));
        assert!(calls[1].contains("get nodes -l"));
    }

    #[test]
    fn worker_response_hides_trust_material_on_the_wire() {
        let resp = JoinResponse {
            ca: "CA".into(),
            control_plane_nodes: Some(vec![]),
            ..Default::default()
        };
        let json = serde_json::to_value(&resp).unwrap();
        let obj = json.as_object().unwrap();

        assert!(obj["ca_key"].is_null());
        assert_eq!(obj["control_plane_nodes"], serde_json::json!([]));
        for absent in ["voters", "admin_token", "cluster_cert", "cluster_key"] {
            assert!(!obj.contains_key(absent), "{absent} should be omitted");
        }
    }

    // =========================================================================
    // Story: first peer of a fresh HA cluster
    // =========================================================================

    #[tokio::test]
    async fn story_first_join_rebinds_loopback_store() {
        let fresh: Vec<(&str, &str)> = HA_NODE
            .iter()
            .map(|(file, contents)| match *file {
                "var/kubernetes/backend/info.yaml" => {
                    (*file, "Address: 127.0.0.1:19001\nID: 1238719276943521\nRole: 0\n")
                }
                "var/kubernetes/backend/cluster.yaml" => (
                    *file,
                    "- Address: 127.0.0.1:19001\n  ID: 1238719276943521\n  Role: 0\n",
                ),
                _ => (*file, *contents),
            })
            .collect();
        let node = node_with(&fresh, ClusterMode::Ha, RecordingCommandRunner::new());

        // The store picks up update.yaml and republishes its membership.
        let cluster_yaml = node.dir.path().join("var/kubernetes/backend/cluster.yaml");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tokio::fs::write(
                cluster_yaml,
                "- Address: 10.10.10.10:19001\n  ID: 1238719276943521\n  Role: 0\n",
            )
            .await
            .unwrap();
        });

        let resp = node
            .coordinator
            .join(
                &request("control-plane-token", "some-invalid-hostname", false),
                "10.10.10.10:25000",
                "10.10.10.13:41532",
                deadline(),
            )
            .await
            .unwrap();

        assert_eq!(resp.voters, vec!["10.10.10.10:19001"]);
        let staged = std::fs::read_to_string(node.paths.rebind_request()).unwrap();
        assert_eq!(staged.trim(), "Address: 10.10.10.10:19001");
        assert_eq!(
            node.runner.calls(),
            vec![
                "snapctl restart microk8s.daemon-k8s-dqlite".to_string(),
                "snapctl restart microk8s.daemon-apiserver".to_string(),
                apply_cni(&node.paths),
            ]
        );
    }

    #[tokio::test]
    async fn first_join_times_out_if_store_never_rebinds() {
        let fresh: Vec<(&str, &str)> = HA_NODE
            .iter()
            .map(|(file, contents)| match *file {
                "var/kubernetes/backend/info.yaml" => (*file, "Address: 127.0.0.1:19001\n"),
                "var/kubernetes/backend/cluster.yaml" => (*file, "- Address: 127.0.0.1:19001\n"),
                _ => (*file, *contents),
            })
            .collect();
        let node = node_with(&fresh, ClusterMode::Ha, RecordingCommandRunner::new());

        let err = node
            .coordinator
            .join(
                &request("control-plane-token", "host", false),
                "10.10.10.10:25000",
                "10.10.10.13:41532",
                Instant::now() + Duration::from_millis(300),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert!(!node.tokens.is_valid("control-plane-token", TokenCategory::Admission).await);
        assert!(!node.paths.no_cert_reissue_marker().exists());
    }

    // =========================================================================
    // Refusals
    // =========================================================================

    #[tokio::test]
    async fn invalid_token_is_rejected() {
        let node = node();
        let err = node
            .coordinator
            .join(
                &request("invalid-token", "host", false),
                "10.10.10.10:25000",
                "10.10.10.13:1",
                deadline(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
        assert!(node.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn legacy_node_refuses_ha_join() {
        let node = node_with(HA_NODE, ClusterMode::Legacy, RecordingCommandRunner::new());
        let err = node
            .coordinator
            .join(
                &request("control-plane-token", "host", false),
                "10.10.10.10:25000",
                "10.10.10.13:1",
                deadline(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn agent_port_mismatch_is_validation_error() {
        let node = node();
        let mut req = request("control-plane-token", "host", false);
        req.agent_port = "25001".into();

        let err = node
            .coordinator
            .join(&req, "10.10.10.10:25000", "10.10.10.13:1", deadline())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("25000"));
        // Token spent all the same
        assert!(!node.tokens.is_valid("control-plane-token", TokenCategory::Admission).await);
    }

    #[tokio::test]
    async fn known_member_cannot_join_twice() {
        let node = node();
        let err = node
            .coordinator
            .join(
                &request("control-plane-token", "unresolvable", false),
                "10.10.10.10:25000",
                "10.10.10.11:41532",
                deadline(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict { .. }));
        assert!(node.runner.calls().is_empty());
    }

    #[test]
    fn worker_field_accepts_bool_or_sentinel() {
        for (json, expected) in [
            ("true", true),
            ("false", false),
            ("null", false),
            (r#""as-worker""#, true),
            (r#""as-controlplane""#, false),
            ("1", false),
        ] {
            let value: WorkerOnly = serde_json::from_str(json).unwrap();
            assert_eq!(value.0, expected, "worker = {json}");
        }
    }

    #[test]
    fn missing_worker_field_means_control_plane() {
        let req: JoinRequest =
            serde_json::from_str(r#"{"token":"t","hostname":"h","port":"25000"}"#).unwrap();
        assert!(!req.worker.0);
    }
}
