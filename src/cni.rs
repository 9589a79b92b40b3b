//! CNI address auto-detection
//!
//! A single-node cluster ships Calico with `IP_AUTODETECTION_METHOD` set to
//! `first-found`. Once a second node joins, nodes with several interfaces
//! must pick the one that reaches their peers, so the manifest is switched to
//! `can-reach=<host>` and re-applied.

use tracing::info;

use crate::config::StatePaths;
use crate::error::io_state;
use crate::exec::{argv, CommandRunner};
use crate::Result;

const FIRST_FOUND: &str = r#""first-found""#;

/// Replace `first-found` address detection with `can-reach` against `host`
pub fn patch_autodetection(manifest: &str, host: &str) -> String {
    manifest.replace(FIRST_FOUND, &format!(r#""can-reach={host}""#))
}

/// Patch the CNI manifest on disk and apply it to the cluster
pub async fn apply_can_reach_detection(
    paths: &StatePaths,
    runner: &dyn CommandRunner,
    host: &str,
) -> Result<()> {
    let manifest_path = paths.cni_manifest();
    let manifest = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|e| io_state("read CNI configuration", e))?;

    let patched = patch_autodetection(&manifest, host);
    if patched != manifest {
        tokio::fs::write(&manifest_path, patched)
            .await
            .map_err(|e| io_state("update CNI configuration", e))?;
        info!(host, "Switched CNI address detection to can-reach");
    }

    let kubectl = paths.kubectl().display().to_string();
    let manifest_arg = manifest_path.display().to_string();
    runner
        .run(&argv([kubectl.as_str(), "apply", "-f", manifest_arg.as_str()]))
        .await
        .map_err(|e| e.within("apply CNI configuration"))
}
