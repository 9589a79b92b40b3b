//! Node side of cluster-wide upgrades
//!
//! Upgrades run as a two-phase commit driven by a peer: every node prepares,
//! then every node commits, or all roll back. Each phase maps to a script
//! shipped under `upgrade-scripts/<upgrade>/<phase>-node.sh`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::config::StatePaths;
use crate::exec::{argv, CommandRunner};
use crate::token::{TokenCategory, TokenStore};
use crate::{Error, Result};

/// Phase of an upgrade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradePhase {
    /// Stage the change
    Prepare,
    /// Make the staged change effective
    Commit,
    /// Undo a prepared change
    Rollback,
}

impl UpgradePhase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradePhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prepare" => Ok(Self::Prepare),
            "commit" => Ok(Self::Commit),
            "rollback" => Ok(Self::Rollback),
            other => Err(Error::validation(
                "parse upgrade phase",
                format!("unknown upgrade phase {other:?}"),
            )),
        }
    }
}

/// Body of an upgrade request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpgradeRequest {
    /// This node's self callback token
    #[serde(rename = "callback")]
    pub callback_token: String,
    /// Upgrade name, e.g. `000-switch-to-calico`
    pub upgrade: String,
    /// `prepare`, `commit` or `rollback`
    pub phase: String,
}

/// Runs upgrade phase scripts
#[derive(Clone)]
pub struct Upgrader {
    paths: StatePaths,
    tokens: TokenStore,
    runner: Arc<dyn CommandRunner>,
}

impl Upgrader {
    /// Create an upgrader
    pub fn new(paths: StatePaths, tokens: TokenStore, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            paths,
            tokens,
            runner,
        }
    }

    /// Run one phase of an upgrade on this node
    pub async fn upgrade(&self, request: &UpgradeRequest) -> Result<()> {
        if !self
            .tokens
            .is_valid(&request.callback_token, TokenCategory::SelfCallback)
            .await
        {
            return Err(Error::auth("upgrade node", "invalid callback token"));
        }

        let phase: UpgradePhase = request.phase.parse()?;
        let script = self.paths.upgrade_script(&request.upgrade, phase.as_str());
        if !tokio::fs::try_exists(&script).await.unwrap_or(false) {
            return Err(Error::validation(
                "locate upgrade script",
                format!("could not find script {}", script.display()),
            ));
        }

        info!(upgrade = %request.upgrade, %phase, "Running upgrade phase");
        let script = script.display().to_string();
        self.runner
            .run(&argv([script.as_str()]))
            .await
            .map_err(|e| e.within(&format!("{phase} upgrade {:?}", request.upgrade)))
    }
}
