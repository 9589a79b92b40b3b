//! Service and addon configuration pushed by peer agents
//!
//! Peers authenticate with this node's self callback token, handed out
//! during HA joins.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tracing::info;

use crate::args::update_argument_file;
use crate::config::StatePaths;
use crate::exec::{argv, CommandRunner};
use crate::services::ServiceManager;
use crate::token::{TokenCategory, TokenStore};
use crate::{Error, Result};

/// The `restart` field: JSON `true` or the string `"yes"`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestartFlag(pub bool);

impl<'de> Deserialize<'de> for RestartFlag {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self(
            value.as_bool() == Some(true) || value.as_str() == Some("yes"),
        ))
    }
}

/// Argument changes for one service
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfiguration {
    /// Service name, as used for its argument file
    pub name: String,
    /// Arguments to set, applied in order
    #[serde(rename = "arguments_update")]
    pub update: Vec<BTreeMap<String, String>>,
    /// Arguments to drop
    #[serde(rename = "arguments_remove")]
    pub remove: Vec<String>,
    /// Restart the service afterwards
    pub restart: RestartFlag,
}

/// Addon to enable or disable
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct AddonConfiguration {
    /// Addon name
    pub name: String,
    /// Enable the addon
    pub enable: bool,
    /// Disable the addon
    pub disable: bool,
}

/// Body of a configure request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigureRequest {
    /// This node's self callback token
    #[serde(rename = "callback")]
    pub callback_token: String,
    /// Service changes
    #[serde(rename = "service")]
    pub services: Vec<ServiceConfiguration>,
    /// Addon changes
    #[serde(rename = "addon")]
    pub addons: Vec<AddonConfiguration>,
}

/// Applies configuration requests
#[derive(Clone)]
pub struct Configurator {
    paths: StatePaths,
    tokens: TokenStore,
    services: ServiceManager,
    runner: Arc<dyn CommandRunner>,
}

impl Configurator {
    /// Create a configurator
    pub fn new(
        paths: StatePaths,
        tokens: TokenStore,
        services: ServiceManager,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            paths,
            tokens,
            services,
            runner,
        }
    }

    /// Apply service changes, then addon changes, stopping at the first
    /// failure
    pub async fn configure(&self, request: &ConfigureRequest) -> Result<()> {
        if !self
            .tokens
            .is_valid(&request.callback_token, TokenCategory::SelfCallback)
            .await
        {
            return Err(Error::auth("configure node", "invalid callback token"));
        }

        for service in &request.services {
            let updates: Vec<(String, String)> = service
                .update
                .iter()
                .flat_map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())))
                .collect();

            update_argument_file(&self.paths.service_args(&service.name), &updates, &service.remove)
                .await
                .map_err(|e| e.within(&format!("update arguments of service {:?}", service.name)))?;
            info!(service = %service.name, updated = updates.len(), removed = service.remove.len(), "Updated service arguments");

            if service.restart.0 {
                self.services.restart(&service.name).await?;
            }
        }

        for addon in &request.addons {
            let (wrapper, action) = match (addon.enable, addon.disable) {
                (true, _) => (self.paths.enable_addon(), "enable"),
                (false, true) => (self.paths.disable_addon(), "disable"),
                (false, false) => continue,
            };
            let wrapper = wrapper.display().to_string();
            self.runner
                .run(&argv([wrapper.as_str(), addon.name.as_str()]))
                .await
                .map_err(|e| e.within(&format!("{action} addon {:?}", addon.name)))?;
            info!(addon = %addon.name, action, "Configured addon");
        }

        Ok(())
    }
}
