//! Legacy join into a single control-plane cluster

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{AgentConfig, ClusterMode};
use crate::issuer::CredentialIssuer;
use crate::membership::join_host_port;
use crate::services::{service_argument, ServiceManager};
use crate::token::known::KUBE_PROXY_IDENTITY;
use crate::token::{KnownTokens, TokenCategory, TokenStore};
use crate::{Error, Result};

use super::{disable_cert_reissue, kubelet_arguments, resolve_remote_host, HostResolver};

/// Body of a legacy join request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct JoinRequest {
    /// Admission token
    #[serde(rename = "token")]
    pub cluster_token: String,
    /// Hostname the joiner claims
    pub hostname: String,
    /// Port of the joiner's agent
    #[serde(rename = "port")]
    pub agent_port: String,
    /// Token this node uses to call back into the joiner
    #[serde(rename = "callback")]
    pub callback_token: String,
}

/// Everything a legacy joiner needs to start its services
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// Cluster CA certificate
    pub ca: String,
    /// etcd client URLs, as configured on this node
    pub etcd: String,
    /// API server port
    pub apiport: String,
    /// Static kube-proxy token
    pub kubeproxy: String,
    /// Kubelet token of the joiner
    pub kubelet: String,
    /// Kubelet arguments for the joiner
    pub kubelet_args: String,
    /// Name the joiner is known by
    pub hostname_override: String,
}

/// Runs legacy joins
#[derive(Clone)]
pub struct JoinCoordinatorV1 {
    config: AgentConfig,
    tokens: TokenStore,
    known: KnownTokens,
    issuer: CredentialIssuer,
    services: ServiceManager,
    resolver: Arc<dyn HostResolver>,
}

impl JoinCoordinatorV1 {
    /// Create a coordinator
    pub fn new(
        config: AgentConfig,
        tokens: TokenStore,
        known: KnownTokens,
        issuer: CredentialIssuer,
        services: ServiceManager,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self {
            config,
            tokens,
            known,
            issuer,
            services,
            resolver,
        }
    }

    /// Admit a node into a legacy cluster.
    ///
    /// HA nodes refuse before the token is looked at. Any failure after
    /// the token is spent aborts the join without restoring it.
    pub async fn join(&self, request: &JoinRequest, remote_address: &str) -> Result<JoinResponse> {
        if self.config.mode == ClusterMode::Ha {
            return Err(Error::conflict(
                "join cluster",
                "this is an HA cluster, run 'microk8s enable ha-cluster' on the joining node and retry",
            ));
        }

        self.tokens
            .consume_valid(&request.cluster_token, TokenCategory::Admission)
            .await?;

        self.issuer
            .mint_certificate_request(&request.cluster_token)
            .await?;

        let hostname =
            resolve_remote_host(self.resolver.as_ref(), &request.hostname, remote_address).await;
        let endpoint = join_host_port(&hostname, &request.agent_port);
        info!(hostname = %hostname, endpoint = %endpoint, "Admitting node into legacy cluster");

        self.tokens
            .add_callback(&endpoint, &request.callback_token)
            .await
            .map_err(|e| e.within(&format!("add callback token for {endpoint}")))?;

        let ca = self.issuer.ca_certificate().await?;
        let kubeproxy = self
            .known
            .get(KUBE_PROXY_IDENTITY)
            .await
            .map_err(|e| e.within("retrieve kube-proxy token"))?;
        let kubelet = self
            .known
            .get_or_create_kubelet(&hostname)
            .await
            .map_err(|e| e.within("retrieve kubelet token"))?;

        // Static tokens are only read at API server startup.
        self.services.restart("apiserver").await?;

        let kubelet_args = kubelet_arguments(&self.config.paths, &hostname, &request.hostname).await?;
        disable_cert_reissue(&self.config.paths).await?;

        let paths = &self.config.paths;
        let response = JoinResponse {
            ca,
            etcd: service_argument(paths, "etcd", "--listen-client-urls")
                .await
                .unwrap_or_default(),
            apiport: service_argument(paths, "kube-apiserver", "--secure-port")
                .await
                .unwrap_or_default(),
            kubeproxy,
            kubelet,
            kubelet_args,
            hostname_override: hostname,
        };

        info!(hostname = %response.hostname_override, "Node joined legacy cluster");
        Ok(response)
    }
}
