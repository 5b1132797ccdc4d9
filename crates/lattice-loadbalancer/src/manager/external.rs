//! Endpoint managed outside of the cluster

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lattice_common::Result;

use super::Manager;
use crate::inspect::InspectReport;
use crate::spec::{ClusterIdentity, ManagerKind};

/// Manager that provisions nothing
///
/// The operator is responsible for making the control plane endpoint reachable.
pub struct ExternalManager {
    identity: ClusterIdentity,
    address: String,
}

impl ExternalManager {
    /// Manager for an externally provided `address`
    pub fn new(identity: ClusterIdentity, address: impl Into<String>) -> Self {
        Self {
            identity,
            address: address.into(),
        }
    }
}

#[async_trait]
impl Manager for ExternalManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::External
    }

    async fn create(&self, _cancel: &CancellationToken) -> Result<Vec<String>> {
        debug!(cluster = %self.identity, address = %self.address, "Load balancer is managed externally");
        if self.address.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.address.clone()])
    }

    async fn delete(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn reconfigure(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn control_plane_instance_templates(
        &self,
        _control_plane_initialized: bool,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn inspect(&self, _cancel: &CancellationToken) -> InspectReport {
        InspectReport::new()
    }
}
