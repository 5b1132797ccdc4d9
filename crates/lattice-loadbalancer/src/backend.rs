//! Backend discovery
//!
//! Control plane instances are found by their identity labels. Each instance
//! with a host address becomes one backend server, keyed by instance name so
//! that rendering and API pushes iterate in a stable order.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use lattice_common::{ResultExt, Result, DEFAULT_API_SERVER_PORT, ROLE_CONTROL_PLANE};
use lattice_lxc::{host_addresses, Client, ListFilter};

use crate::spec::ClusterIdentity;

/// Weight of every backend server
pub const DEFAULT_BACKEND_WEIGHT: u32 = 100;

/// One backend server
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendServer {
    /// Host address of the instance
    pub address: String,
    /// Relative weight
    pub weight: u32,
}

/// Inputs of a load balancer configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendView {
    /// Port the load balancer listens on
    pub frontend_control_plane_port: String,
    /// Port of the API server on each backend
    pub backend_control_plane_port: String,
    /// Backend servers by instance name
    pub backend_servers: BTreeMap<String, BackendServer>,
}

impl Default for BackendView {
    fn default() -> Self {
        Self {
            frontend_control_plane_port: DEFAULT_API_SERVER_PORT.to_string(),
            backend_control_plane_port: DEFAULT_API_SERVER_PORT.to_string(),
            backend_servers: BTreeMap::new(),
        }
    }
}

impl BackendView {
    /// Add a backend server with the default weight
    pub fn with_server(mut self, name: impl Into<String>, address: impl Into<String>) -> Self {
        self.backend_servers.insert(
            name.into(),
            BackendServer {
                address: address.into(),
                weight: DEFAULT_BACKEND_WEIGHT,
            },
        );
        self
    }
}

/// Filter matching the control plane instances of a cluster
pub fn control_plane_filter(identity: &ClusterIdentity) -> ListFilter {
    ListFilter::with_config(identity.labels_with_role(ROLE_CONTROL_PLANE))
}

/// List the cluster's control plane instances and build a [`BackendView`]
///
/// Instances without a host address yet are skipped. The first reported
/// address of each instance is used.
pub async fn discover_backends(client: &Client, identity: &ClusterIdentity) -> Result<BackendView> {
    let instances = client
        .list_instances(&[control_plane_filter(identity)])
        .await
        .context("failed to retrieve cluster control plane instances")?;

    let mut view = BackendView::default();
    for instance in instances {
        let Some(address) = instance
            .state
            .as_ref()
            .and_then(|state| host_addresses(state).into_iter().next())
        else {
            debug!(instance = %instance.name, "Control plane instance has no address yet");
            continue;
        };
        view = view.with_server(instance.name, address);
    }
    Ok(view)
}
