//! Connection and capability probe
//!
//! A `Client` wraps one `LxcApi` together with the server information
//! fetched exactly once when the client is created. Capability checks consult
//! that snapshot and never query the server again.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use lattice_common::{Error, Result, ResultExt};

use crate::api::Server;
use crate::config::{Configuration, Timeouts};
use crate::http::HttpLxcClient;
use crate::transport::LxcApi;

/// Server implementation behind the API
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerName {
    /// Incus
    Incus,
    /// Canonical LXD
    Lxd,
    /// Anything else
    Unknown,
}

impl ServerName {
    /// Identify the server from the `environment.server` field
    pub fn from_environment(server: &str) -> Self {
        match server {
            "incus" => ServerName::Incus,
            "lxd" => ServerName::Lxd,
            _ => ServerName::Unknown,
        }
    }

    /// Lowercase name as reported by the server
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerName::Incus => "incus",
            ServerName::Lxd => "lxd",
            ServerName::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session to one Incus or LXD server, optionally scoped to a project
/// (via the API) and to a cluster member (via [`Client::with_target`])
#[derive(Clone)]
pub struct Client {
    api: Arc<dyn LxcApi>,
    server: Arc<Server>,
    timeouts: Timeouts,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.server_name())
            .field("version", &self.server.environment.server_version)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl Client {
    /// Connect to the configured endpoint and fetch server information
    ///
    /// Deadlines are read from the environment, see [`Timeouts::from_env`].
    pub async fn connect(config: &Configuration) -> Result<Self> {
        let api = HttpLxcClient::new(config).context("failed to initialize client")?;
        Self::from_api(Arc::new(api)).await
    }

    /// Wrap an existing API implementation and fetch server information
    pub async fn from_api(api: Arc<dyn LxcApi>) -> Result<Self> {
        let server = api
            .get_server()
            .await
            .context("failed to retrieve server information")?;
        debug!(
            server = %server.environment.server,
            version = %server.environment.server_version,
            clustered = server.environment.server_clustered,
            "Initialized client"
        );
        Ok(Self {
            api,
            server: Arc::new(server),
            timeouts: Timeouts::from_env(),
        })
    }

    /// Replace the operation deadlines
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Operation deadlines of this client
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Underlying API, for calls the lifecycle engine does not wrap
    pub fn api(&self) -> &dyn LxcApi {
        self.api.as_ref()
    }

    /// Server information fetched when the client was created
    pub fn server_info(&self) -> &Server {
        &self.server
    }

    /// Return a client that creates instances on the given cluster member
    /// (`name`) or cluster group (`@name`)
    ///
    /// Ignored when the target is empty or the server is not clustered.
    pub fn with_target(&self, target: &str) -> Self {
        if target.is_empty() || self.supports_instance_target().is_err() {
            return self.clone();
        }
        Self {
            api: self.api.use_target(target),
            server: Arc::clone(&self.server),
            timeouts: self.timeouts,
        }
    }

    /// Server implementation
    pub fn server_name(&self) -> ServerName {
        ServerName::from_environment(&self.server.environment.server)
    }

    /// Terminal error unless every extension is advertised by the server
    pub fn supports_extensions(&self, extensions: &[&str]) -> Result<()> {
        let available: BTreeSet<&str> = self
            .server
            .api_extensions
            .iter()
            .map(String::as_str)
            .collect();
        let missing: Vec<String> = extensions
            .iter()
            .filter(|e| !available.contains(*e))
            .map(|e| e.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::missing_extensions(missing))
        }
    }

    /// OCI application containers
    pub fn supports_instance_oci(&self) -> Result<()> {
        self.supports_extensions(&["instance_oci", "instance_oci_entrypoint"])
    }

    /// Network load balancers with health checks
    pub fn supports_network_load_balancers(&self) -> Result<()> {
        self.supports_extensions(&[
            "network_load_balancer",
            "network_load_balancer_health_check",
        ])
    }

    /// tmpfs disk devices for containers
    pub fn supports_container_disk_tmpfs(&self) -> Result<()> {
        self.supports_extensions(&["container_disk_tmpfs"])
    }

    /// Virtual machines (the qemu driver)
    pub fn supports_instance_kvm(&self) -> Result<()> {
        let driver = &self.server.environment.driver;
        if driver.split(" | ").any(|d| d == "qemu") {
            Ok(())
        } else {
            Err(Error::unsupported(format!(
                "server is missing driver qemu, supported drivers are: {:?}",
                driver
            )))
        }
    }

    /// Architectures supported by the server
    pub fn supported_architectures(&self) -> Vec<String> {
        self.server.environment.architectures.clone()
    }

    /// Whether instances can be placed on a specific cluster member
    ///
    /// Unlike the extension checks this is not terminal: a standalone server
    /// simply ignores placement.
    pub fn supports_instance_target(&self) -> Result<()> {
        if self.server.environment.server_clustered {
            Ok(())
        } else {
            Err(Error::internal_with_context(
                "supports_instance_target",
                "server is not part of a cluster",
            ))
        }
    }
}
