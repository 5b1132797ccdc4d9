//! Load balancer managers
//!
//! Every strategy implements the [`Manager`] contract. The strategy is picked
//! once, from the cluster's [`LoadBalancerSpec`], by [`manager_for_cluster`].
//!
//! # Strategies
//!
//! - [`ProxyInstanceManager`] - haproxy instance, native or packaged
//! - [`NetworkLoadBalancerManager`] - host network load balancer
//! - [`KubeVipManager`] - kube-vip static pod on the control plane
//! - [`ExternalManager`] - endpoint managed outside of the cluster

mod external;
mod kubevip;
mod network;
mod proxy;

pub use external::ExternalManager;
pub use kubevip::{KubeVipManager, DEFAULT_KUBE_VIP_IMAGE, DEFAULT_KUBE_VIP_MANIFEST_PATH};
pub use network::NetworkLoadBalancerManager;
pub use proxy::{ProxyFlavor, ProxyInstanceManager};

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use lattice_common::{Error, Result};
use lattice_lxc::Client;

use crate::haproxy::validate_haproxy_template;
use crate::inspect::InspectReport;
use crate::spec::{ClusterIdentity, LoadBalancerInstance, LoadBalancerSpec, ManagerKind};

/// Load balancer of one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Manager: Send + Sync {
    /// Selected strategy
    fn kind(&self) -> ManagerKind;

    /// Provision the load balancer and return its addresses
    ///
    /// Terminal errors (missing extensions, invalid configuration, ownership
    /// conflicts) must not be retried.
    async fn create(&self, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// Remove every load balancer resource; succeeds if nothing exists
    async fn delete(&self, cancel: &CancellationToken) -> Result<()>;

    /// Point the load balancer at the currently running control plane instances
    async fn reconfigure(&self, cancel: &CancellationToken) -> Result<()>;

    /// Files (path to content) injected as templates into every control plane instance
    fn control_plane_instance_templates(
        &self,
        control_plane_initialized: bool,
    ) -> Result<BTreeMap<String, String>>;

    /// Best-effort dump of the load balancer state
    async fn inspect(&self, cancel: &CancellationToken) -> InspectReport;
}

/// Build the manager for a cluster's load balancer strategy
///
/// `endpoint_host` is the cluster's control plane endpoint host, used as the
/// listen address or VIP by strategies that do not allocate one.
pub fn manager_for_cluster(
    identity: ClusterIdentity,
    endpoint_host: &str,
    spec: &LoadBalancerSpec,
    client: Client,
) -> Result<Box<dyn Manager>> {
    let kind = spec.kind()?;
    let manager: Box<dyn Manager> = match (kind, spec) {
        (ManagerKind::NativeProxy, LoadBalancerSpec { lxc: Some(lb), .. }) => {
            Box::new(proxy_manager(ProxyFlavor::Native, identity, lb, client)?)
        }
        (ManagerKind::PackagedProxy, LoadBalancerSpec { oci: Some(lb), .. }) => {
            Box::new(proxy_manager(ProxyFlavor::Packaged, identity, lb, client)?)
        }
        (ManagerKind::NetworkLoadBalancer, LoadBalancerSpec { ovn: Some(ovn), .. }) => {
            Box::new(NetworkLoadBalancerManager::new(
                client,
                identity,
                ovn.network_name.clone(),
                endpoint_host,
            ))
        }
        (ManagerKind::KubeVip, LoadBalancerSpec { kube_vip: Some(kube_vip), .. }) => {
            Box::new(KubeVipManager::new(identity, endpoint_host, kube_vip))
        }
        _ => Box::new(ExternalManager::new(identity, endpoint_host)),
    };
    Ok(manager)
}

fn proxy_manager(
    flavor: ProxyFlavor,
    identity: ClusterIdentity,
    lb: &LoadBalancerInstance,
    client: Client,
) -> Result<ProxyInstanceManager> {
    let custom_template = if lb.custom_haproxy_config_template.is_empty() {
        None
    } else {
        validate_haproxy_template(&lb.custom_haproxy_config_template).map_err(|e| {
            Error::validation_for_field("customHAProxyConfigTemplate", e.to_string())
        })?;
        Some(lb.custom_haproxy_config_template.clone())
    };
    Ok(ProxyInstanceManager::new(
        flavor,
        client,
        identity,
        lb.instance_spec.clone(),
        custom_template,
    ))
}

/// Create the load balancer, then point it at the control plane
///
/// A terminal create error is returned before any reconfigure. A failed
/// reconfigure after a successful create is logged and left to the next
/// reconcile, since new control plane instances trigger it again.
pub async fn provision(manager: &dyn Manager, cancel: &CancellationToken) -> Result<Vec<String>> {
    let addresses = match manager.create(cancel).await {
        Ok(addresses) => addresses,
        Err(e) if e.is_terminal() => {
            warn!(kind = %manager.kind(), error = %e, "Load balancer cannot be provisioned");
            return Err(e);
        }
        Err(e) => return Err(e),
    };
    info!(kind = %manager.kind(), addresses = ?addresses, "Load balancer provisioned");

    if let Err(e) = manager.reconfigure(cancel).await {
        if e.is_cancelled() {
            return Err(e);
        }
        warn!(kind = %manager.kind(), error = %e, "Failed to reconfigure load balancer");
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{LoadBalancerExternal, LoadBalancerKubeVip, LoadBalancerOvn};
    use lattice_lxc::testing::FakeServer;
    use std::sync::Arc;

    async fn client() -> Client {
        Client::from_api(Arc::new(FakeServer::new()))
            .await
            .expect("connect")
    }

    fn identity() -> ClusterIdentity {
        ClusterIdentity::new("c1", "default")
    }

    #[tokio::test]
    async fn test_manager_matches_strategy() {
        let cases = [
            (
                LoadBalancerSpec {
                    lxc: Some(LoadBalancerInstance::default()),
                    ..Default::default()
                },
                ManagerKind::NativeProxy,
            ),
            (
                LoadBalancerSpec {
                    oci: Some(LoadBalancerInstance::default()),
                    ..Default::default()
                },
                ManagerKind::PackagedProxy,
            ),
            (
                LoadBalancerSpec {
                    ovn: Some(LoadBalancerOvn {
                        network_name: "ovn0".to_string(),
                    }),
                    ..Default::default()
                },
                ManagerKind::NetworkLoadBalancer,
            ),
            (
                LoadBalancerSpec {
                    kube_vip: Some(LoadBalancerKubeVip::default()),
                    ..Default::default()
                },
                ManagerKind::KubeVip,
            ),
            (
                LoadBalancerSpec {
                    external: Some(LoadBalancerExternal {}),
                    ..Default::default()
                },
                ManagerKind::External,
            ),
            (LoadBalancerSpec::default(), ManagerKind::External),
        ];

        for (spec, expected) in cases {
            let manager = manager_for_cluster(identity(), "10.1.0.10", &spec, client().await)
                .expect("manager");
            assert_eq!(manager.kind(), expected);
        }
    }

    #[tokio::test]
    async fn test_invalid_custom_template_is_terminal() {
        let spec = LoadBalancerSpec {
            lxc: Some(LoadBalancerInstance {
                custom_haproxy_config_template: "{% for %}".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = match manager_for_cluster(identity(), "", &spec, client().await) {
            Ok(_) => panic!("invalid template accepted"),
            Err(e) => e,
        };
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_conflicting_strategies_are_terminal() {
        let spec = LoadBalancerSpec {
            oci: Some(LoadBalancerInstance::default()),
            external: Some(LoadBalancerExternal {}),
            ..Default::default()
        };
        let err = match manager_for_cluster(identity(), "", &spec, client().await) {
            Ok(_) => panic!("two strategies accepted"),
            Err(e) => e,
        };
        assert!(err.is_terminal());
    }

    // ==========================================================================
    // Story Tests: Provisioning
    // ==========================================================================

    /// Story: a terminal create error never reaches reconfigure
    #[tokio::test]
    async fn story_terminal_create_short_circuits() {
        let mut manager = MockManager::new();
        manager.expect_kind().return_const(ManagerKind::PackagedProxy);
        manager
            .expect_create()
            .times(1)
            .returning(|_| Err(Error::missing_extensions(vec!["instance_oci".to_string()])));
        manager.expect_reconfigure().times(0);

        let err = provision(&manager, &CancellationToken::new())
            .await
            .expect_err("missing extension");
        assert!(err.is_terminal());
    }

    /// Story: a failed reconfigure after create is left to the next reconcile
    #[tokio::test]
    async fn story_reconfigure_failure_keeps_addresses() {
        let mut manager = MockManager::new();
        manager.expect_kind().return_const(ManagerKind::NativeProxy);
        manager
            .expect_create()
            .times(1)
            .returning(|_| Ok(vec!["10.0.0.9".to_string()]));
        manager
            .expect_reconfigure()
            .times(1)
            .returning(|_| Err(Error::api("ListInstances", 500, "database is locked")));

        let addresses = provision(&manager, &CancellationToken::new())
            .await
            .expect("addresses");
        assert_eq!(addresses, vec!["10.0.0.9"]);
    }
}
