//! Static bearer-token registry
//!
//! `known_tokens.csv` maps static API-server bearer tokens to identities:
//! `token,identity,short-name,groups`. The registry is append-only; lookups
//! return the first row whose identity column matches.

use rand::Rng;

use crate::config::StatePaths;
use crate::error::io_state;
use crate::lock::ResourceLocks;
use crate::{Error, Result};

use super::{append_line, generate_token, read_tokens};

/// Identity of the kube-proxy static token
pub const KUBE_PROXY_IDENTITY: &str = "system:kube-proxy";

/// Identity of the cluster admin static token
pub const ADMIN_IDENTITY: &str = "admin";

/// Kubelet identity of a node
pub fn kubelet_identity(hostname: &str) -> String {
    format!("system:node:{hostname}")
}

/// Find the token of `identity` in registry contents
pub fn find_token<'a>(contents: &'a str, identity: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let mut cols = line.trim().splitn(3, ',');
        let token = cols.next()?;
        (cols.next()? == identity).then_some(token)
    })
}

fn random_digits(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Known-token registry
#[derive(Clone, Debug)]
pub struct KnownTokens {
    paths: StatePaths,
    locks: ResourceLocks,
}

impl KnownTokens {
    /// Create a registry over the given paths
    pub fn new(paths: StatePaths, locks: ResourceLocks) -> Self {
        Self { paths, locks }
    }

    async fn read(&self) -> Result<String> {
        let path = self.paths.known_tokens();
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_state(format!("read {}", path.display()), e))
    }

    /// Token of an existing identity
    pub async fn get(&self, identity: &str) -> Result<String> {
        let _guard = self.locks.lock(&self.paths.known_tokens()).await;
        let contents = self.read().await?;
        find_token(&contents, identity)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::state(
                    format!("retrieve known token for {identity}"),
                    "no known token found",
                )
            })
    }

    /// Kubelet token of `hostname`, minted and registered on first request
    pub async fn get_or_create_kubelet(&self, hostname: &str) -> Result<String> {
        let path = self.paths.known_tokens();
        let _guard = self.locks.lock(&path).await;

        let identity = kubelet_identity(hostname);
        let contents = read_tokens(&path).await?;
        if let Some(token) = find_token(&contents, &identity) {
            return Ok(token.to_string());
        }

        let token = generate_token();
        let row = format!(
            "{token},{identity},kubelet-{},\"system:nodes\"",
            random_digits(8)
        );
        append_line(&path, &row)
            .await
            .map_err(|e| e.within(&format!("add kubelet token for {identity}")))?;
        Ok(token)
    }
}
