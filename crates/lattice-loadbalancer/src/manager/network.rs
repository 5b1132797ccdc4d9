//! Host network load balancer on an OVN network

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use lattice_common::{Error, Result, ResultExt};
use lattice_lxc::api::{
    NetworkLoadBalancerBackend, NetworkLoadBalancerPort, NetworkLoadBalancerPut,
    NetworkLoadBalancersPost,
};
use lattice_lxc::operation::with_deadline;
use lattice_lxc::Client;

use super::Manager;
use crate::backend::{discover_backends, BackendView};
use crate::inspect::{add_info_for, InspectReport};
use crate::spec::{ClusterIdentity, ManagerKind};

/// Health check settings of every pushed load balancer
const HEALTH_CHECK_CONFIG: [(&str, &str); 5] = [
    ("healthcheck", "true"),
    ("healthcheck.interval", "5"),
    ("healthcheck.timeout", "5"),
    ("healthcheck.failure_count", "3"),
    ("healthcheck.success_count", "2"),
];

/// Load balancer implemented by the host's network stack
pub struct NetworkLoadBalancerManager {
    client: Client,
    identity: ClusterIdentity,
    network_name: String,
    listen_address: String,
}

impl NetworkLoadBalancerManager {
    /// Manager for a load balancer on `network_name` listening on `listen_address`
    pub fn new(
        client: Client,
        identity: ClusterIdentity,
        network_name: impl Into<String>,
        listen_address: impl Into<String>,
    ) -> Self {
        Self {
            client,
            identity,
            network_name: network_name.into(),
            listen_address: listen_address.into(),
        }
    }

    /// Full replacement of the load balancer's writable fields for `view`
    ///
    /// Backends and target backends follow the name order of `view`.
    pub fn desired_state(&self, view: &BackendView) -> NetworkLoadBalancerPut {
        let mut config = self.identity.labels();
        config.extend(
            HEALTH_CHECK_CONFIG
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );

        NetworkLoadBalancerPut {
            config,
            backends: view
                .backend_servers
                .iter()
                .map(|(name, server)| NetworkLoadBalancerBackend {
                    name: name.clone(),
                    target_port: view.backend_control_plane_port.clone(),
                    target_address: server.address.clone(),
                    ..Default::default()
                })
                .collect(),
            ports: vec![NetworkLoadBalancerPort {
                protocol: "tcp".to_string(),
                listen_port: view.frontend_control_plane_port.clone(),
                target_backend: view.backend_servers.keys().cloned().collect(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.network_name.is_empty() {
            return Err(Error::validation_for_field(
                "loadBalancer.ovn.networkName",
                "network load balancer cannot be provisioned as networkName is not specified",
            ));
        }
        if self.listen_address.is_empty() {
            return Err(Error::validation_for_field(
                "controlPlaneEndpoint.host",
                "network load balancer requires the control plane endpoint host as listen address",
            ));
        }
        Ok(())
    }

    async fn push_config(&self) -> Result<()> {
        let view = discover_backends(&self.client, &self.identity)
            .await
            .context("failed to build load balancer configuration")?;

        debug!(
            servers = ?view.backend_servers.keys().collect::<Vec<_>>(),
            "Updating network load balancer"
        );
        self.client
            .api()
            .update_network_load_balancer(
                &self.network_name,
                &self.listen_address,
                &self.desired_state(&view),
            )
            .await
            .context("failed to UpdateNetworkLoadBalancer")
    }
}

#[async_trait]
impl Manager for NetworkLoadBalancerManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::NetworkLoadBalancer
    }

    #[instrument(skip_all, fields(network = %self.network_name, listen_address = %self.listen_address))]
    async fn create(&self, _cancel: &CancellationToken) -> Result<Vec<String>> {
        self.validate()?;
        self.client
            .supports_network_load_balancers()
            .context("server does not support network load balancers")?;

        let api = self.client.api();
        match api.get_network(&self.network_name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                return Err(Error::validation_for_field(
                    "loadBalancer.ovn.networkName",
                    format!("network {:?} does not exist", self.network_name),
                ))
            }
            Err(e) => {
                return Err(e.context(format!("failed to check network {:?}", self.network_name)))
            }
        }

        match api
            .get_network_load_balancer(&self.network_name, &self.listen_address)
            .await
        {
            Ok(lb) if self.identity.owns(&lb.put.config) => {
                debug!("Network load balancer already exists");
                return Ok(vec![self.listen_address.clone()]);
            }
            Ok(_) => {
                return Err(Error::conflict(
                    format!("network load balancer {}", self.listen_address),
                    format!(
                        "already exists without the labels user.cluster-name={} and user.cluster-namespace={}",
                        self.identity.name, self.identity.namespace
                    ),
                ))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context("failed to GetNetworkLoadBalancer")),
        }

        info!("Creating network load balancer");
        api.create_network_load_balancer(
            &self.network_name,
            &NetworkLoadBalancersPost {
                listen_address: self.listen_address.clone(),
                put: NetworkLoadBalancerPut {
                    config: self.identity.labels(),
                    ..Default::default()
                },
            },
        )
        .await
        .context("failed to CreateNetworkLoadBalancer")?;

        Ok(vec![self.listen_address.clone()])
    }

    #[instrument(skip_all, fields(network = %self.network_name, listen_address = %self.listen_address))]
    async fn delete(&self, _cancel: &CancellationToken) -> Result<()> {
        info!("Deleting network load balancer");
        match self
            .client
            .api()
            .delete_network_load_balancer(&self.network_name, &self.listen_address)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.context("failed to DeleteNetworkLoadBalancer")),
        }
    }

    #[instrument(skip_all, fields(network = %self.network_name, listen_address = %self.listen_address))]
    async fn reconfigure(&self, cancel: &CancellationToken) -> Result<()> {
        with_deadline(
            cancel,
            "ReconfigureLoadBalancer",
            self.client.timeouts().reconfigure,
            self.push_config(),
        )
        .await
    }

    fn control_plane_instance_templates(
        &self,
        _control_plane_initialized: bool,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn inspect(&self, _cancel: &CancellationToken) -> InspectReport {
        let api = self.client.api();
        let mut report = InspectReport::new();

        let network = api.get_network(&self.network_name).await;
        let uplink = network
            .as_ref()
            .ok()
            .and_then(|n| n.config.get("network").cloned())
            .unwrap_or_default();
        add_info_for(&mut report, "Network", network);
        add_info_for(&mut report, "UplinkNetwork", api.get_network(&uplink).await);
        add_info_for(
            &mut report,
            "NetworkLoadBalancer",
            api.get_network_load_balancer(&self.network_name, &self.listen_address)
                .await,
        );
        add_info_for(
            &mut report,
            "NetworkLoadBalancerState",
            api.get_network_load_balancer_state(&self.network_name, &self.listen_address)
                .await,
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_common::{CLUSTER_NAMESPACE_KEY, CLUSTER_NAME_KEY, CLUSTER_ROLE_KEY, ROLE_CONTROL_PLANE};
    use lattice_lxc::api::NetworkLoadBalancer;
    use lattice_lxc::testing::FakeServer;
    use std::sync::Arc;

    const NETWORK: &str = "ovn0";
    const VIP: &str = "10.100.0.10";

    async fn manager(fake: &FakeServer, network: &str) -> NetworkLoadBalancerManager {
        let client = Client::from_api(Arc::new(fake.clone()))
            .await
            .expect("connect");
        NetworkLoadBalancerManager::new(client, ClusterIdentity::new("c1", "default"), network, VIP)
    }

    fn control_plane(fake: &FakeServer, name: &str, address: &str) {
        fake.add_running_instance(
            name,
            &[
                (CLUSTER_NAME_KEY, "c1"),
                (CLUSTER_NAMESPACE_KEY, "default"),
                (CLUSTER_ROLE_KEY, ROLE_CONTROL_PLANE),
            ],
            address,
        );
    }

    #[tokio::test]
    async fn test_create_tags_load_balancer_with_identity() {
        let fake = FakeServer::new();
        fake.add_network(NETWORK, "ovn");
        let manager = manager(&fake, NETWORK).await;
        let cancel = CancellationToken::new();

        assert_eq!(manager.create(&cancel).await.expect("create"), vec![VIP]);
        let lb = fake.load_balancer(NETWORK, VIP).expect("created");
        assert_eq!(lb.put.config.get(CLUSTER_NAME_KEY).map(String::as_str), Some("c1"));

        assert_eq!(manager.create(&cancel).await.expect("create again"), vec![VIP]);
        assert_eq!(fake.calls("create_network_load_balancer"), 1);
    }

    // ==========================================================================
    // Story Tests: Ownership of the listen address
    // ==========================================================================

    /// Story: an unrelated load balancer on the listen address is never adopted
    #[tokio::test]
    async fn story_foreign_load_balancer_is_a_terminal_conflict() {
        let fake = FakeServer::new();
        fake.add_network(NETWORK, "ovn");
        let foreign = NetworkLoadBalancer {
            listen_address: VIP.to_string(),
            put: NetworkLoadBalancerPut {
                config: BTreeMap::from([(CLUSTER_NAME_KEY.to_string(), "other".to_string())]),
                ..Default::default()
            },
            ..Default::default()
        };
        fake.add_load_balancer(NETWORK, foreign.clone());
        let manager = manager(&fake, NETWORK).await;

        let err = manager
            .create(&CancellationToken::new())
            .await
            .expect_err("conflict");
        assert!(err.is_terminal());
        assert!(matches!(err.root(), Error::Conflict { .. }));
        assert_eq!(fake.load_balancer(NETWORK, VIP), Some(foreign));
        assert_eq!(fake.calls("create_network_load_balancer"), 0);
        assert_eq!(fake.calls("update_network_load_balancer"), 0);
    }

    #[tokio::test]
    async fn test_missing_configuration_is_terminal() {
        let fake = FakeServer::new();
        let cancel = CancellationToken::new();

        let err = manager(&fake, "").await.create(&cancel).await.expect_err("no network name");
        assert!(err.is_terminal());

        let err = manager(&fake, NETWORK).await.create(&cancel).await.expect_err("no network");
        assert!(err.is_terminal());

        let fake = FakeServer::new().with_extensions(&["instance_oci"]);
        fake.add_network(NETWORK, "ovn");
        let err = manager(&fake, NETWORK).await.create(&cancel).await.expect_err("no extension");
        assert!(err.is_terminal());
        assert!(err.to_string().contains("network_load_balancer"));
    }

    /// Story: reconfigure pushes a full, name-ordered backend set with health checks
    #[tokio::test]
    async fn story_reconfigure_replaces_backend_set() {
        let fake = FakeServer::new();
        fake.add_network(NETWORK, "ovn");
        control_plane(&fake, "c1-cp-c", "10.0.0.3");
        control_plane(&fake, "c1-cp-a", "10.0.0.1");
        control_plane(&fake, "c1-cp-b", "10.0.0.2");
        let manager = manager(&fake, NETWORK).await;
        let cancel = CancellationToken::new();
        manager.create(&cancel).await.expect("create");

        manager.reconfigure(&cancel).await.expect("reconfigure");
        let lb = fake.load_balancer(NETWORK, VIP).expect("lb");
        let targets: Vec<(&str, &str, &str)> = lb
            .put
            .backends
            .iter()
            .map(|b| (b.name.as_str(), b.target_address.as_str(), b.target_port.as_str()))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("c1-cp-a", "10.0.0.1", "6443"),
                ("c1-cp-b", "10.0.0.2", "6443"),
                ("c1-cp-c", "10.0.0.3", "6443"),
            ]
        );
        assert_eq!(lb.put.ports.len(), 1);
        assert_eq!(lb.put.ports[0].listen_port, "6443");
        assert_eq!(lb.put.ports[0].protocol, "tcp");
        assert_eq!(lb.put.ports[0].target_backend, vec!["c1-cp-a", "c1-cp-b", "c1-cp-c"]);
        assert_eq!(lb.put.config.get("healthcheck").map(String::as_str), Some("true"));
        assert_eq!(lb.put.config.get("healthcheck.failure_count").map(String::as_str), Some("3"));
        assert!(ClusterIdentity::new("c1", "default").owns(&lb.put.config));

        fake.remove_instance("c1-cp-b");
        manager.reconfigure(&cancel).await.expect("reconfigure");
        let lb = fake.load_balancer(NETWORK, VIP).expect("lb");
        assert_eq!(lb.put.ports[0].target_backend, vec!["c1-cp-a", "c1-cp-c"]);
        assert_eq!(lb.put.backends.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_load_balancer() {
        let fake = FakeServer::new();
        fake.add_network(NETWORK, "ovn");
        let manager = manager(&fake, NETWORK).await;
        let cancel = CancellationToken::new();
        manager.create(&cancel).await.expect("create");

        manager.delete(&cancel).await.expect("delete");
        assert!(fake.load_balancer(NETWORK, VIP).is_none());
        manager.delete(&cancel).await.expect("delete again");
    }

    #[tokio::test]
    async fn test_inspect_records_objects_and_failures() {
        let fake = FakeServer::new();
        fake.add_network(NETWORK, "ovn");
        let manager = manager(&fake, NETWORK).await;
        manager.create(&CancellationToken::new()).await.expect("create");

        let report = manager.inspect(&CancellationToken::new()).await;
        assert!(report.contains_key("Network.yaml"));
        assert!(report.contains_key("UplinkNetwork.err"));
        assert!(report.contains_key("NetworkLoadBalancer.yaml"));
        assert!(report.contains_key("NetworkLoadBalancerState.yaml"));
    }
}
