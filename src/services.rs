//! Service control
//!
//! Daemons are managed through the package's service manager. Service names
//! accept both the upstream spelling (`kube-apiserver`) and the short one
//! (`apiserver`); on nodes running the merged `kubelite` process the
//! Kubernetes daemons all resolve to that one service.

use std::sync::Arc;

use tracing::info;

use crate::config::{ServiceTopology, StatePaths};
use crate::exec::{argv, CommandRunner};
use crate::Result;

/// Service manager executable
const SERVICE_CTL: &str = "snapctl";

/// Prefix of every managed daemon unit
const UNIT_PREFIX: &str = "microk8s.daemon-";

/// Daemons folded into `kubelite` on merged topologies
const KUBELITE_MEMBERS: [&str; 5] = [
    "apiserver",
    "proxy",
    "kubelet",
    "scheduler",
    "controller-manager",
];

/// Map a service name to the unit that actually runs it
pub fn unit_name(service: &str, topology: ServiceTopology) -> String {
    let short = match service {
        "kube-apiserver" | "kube-proxy" | "kube-scheduler" | "kube-controller-manager" => {
            &service["kube-".len()..]
        }
        other => other,
    };

    let short = match topology {
        ServiceTopology::Merged if KUBELITE_MEMBERS.contains(&short) => "kubelite",
        _ => short,
    };

    format!("{UNIT_PREFIX}{short}")
}

/// Starts, stops and restarts node daemons
#[derive(Clone)]
pub struct ServiceManager {
    runner: Arc<dyn CommandRunner>,
    topology: ServiceTopology,
}

impl ServiceManager {
    /// Create a manager for the given topology
    pub fn new(runner: Arc<dyn CommandRunner>, topology: ServiceTopology) -> Self {
        Self { runner, topology }
    }

    async fn control(&self, action: &str, service: &str) -> Result<()> {
        let unit = unit_name(service, self.topology);
        info!(action, unit = %unit, "Controlling service");
        self.runner
            .run(&argv([SERVICE_CTL, action, unit.as_str()]))
            .await
            .map_err(|e| e.within(&format!("{action} service {service}")))
    }

    /// Restart a service
    pub async fn restart(&self, service: &str) -> Result<()> {
        self.control("restart", service).await
    }

    /// Start a service
    pub async fn start(&self, service: &str) -> Result<()> {
        self.control("start", service).await
    }

    /// Stop a service
    pub async fn stop(&self, service: &str) -> Result<()> {
        self.control("stop", service).await
    }
}

/// Read one argument of a service by its upstream name
pub async fn service_argument(paths: &StatePaths, service: &str, key: &str) -> Option<String> {
    crate::args::read_argument(&paths.service_args(service), key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockCommandRunner;
    use crate::Error;

    #[test]
    fn kube_prefix_is_dropped() {
        assert_eq!(
            unit_name("kube-apiserver", ServiceTopology::Split),
            "microk8s.daemon-apiserver"
        );
        assert_eq!(
            unit_name("k8s-dqlite", ServiceTopology::Split),
            "microk8s.daemon-k8s-dqlite"
        );
    }

    #[test]
    fn merged_topology_routes_to_kubelite() {
        for service in ["apiserver", "kube-proxy", "kubelet", "kube-scheduler"] {
            assert_eq!(
                unit_name(service, ServiceTopology::Merged),
                "microk8s.daemon-kubelite"
            );
        }
        assert_eq!(
            unit_name("k8s-dqlite", ServiceTopology::Merged),
            "microk8s.daemon-k8s-dqlite"
        );
    }

    #[tokio::test]
    async fn restart_runs_service_manager() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| cmd.join(" ") == "snapctl restart microk8s.daemon-kubelite")
            .times(1)
            .returning(|_| Ok(()));

        let services = ServiceManager::new(Arc::new(runner), ServiceTopology::Merged);
        services.restart("apiserver").await.unwrap();
    }

    #[tokio::test]
    async fn failed_restart_names_the_service() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Err(Error::external_command("run snapctl", "exit status: 1")));

        let services = ServiceManager::new(Arc::new(runner), ServiceTopology::Split);
        let err = services.stop("kubelet").await.unwrap_err();

        assert!(matches!(err, Error::ExternalCommand { .. }));
        assert!(err.to_string().contains("stop service kubelet"));
    }

    #[tokio::test]
    async fn service_argument_reads_from_args_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path(), dir.path());
        std::fs::create_dir_all(dir.path().join("args")).unwrap();
        std::fs::write(paths.service_args("kube-apiserver"), "--secure-port 16443\n").unwrap();

        assert_eq!(
            service_argument(&paths, "kube-apiserver", "--secure-port").await,
            Some("16443".to_string())
        );
        assert_eq!(service_argument(&paths, "etcd", "--listen-client-urls").await, None);
    }
}
