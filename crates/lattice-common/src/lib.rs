//! Common types for the Lattice LXC provider: errors, templating, telemetry

#![deny(missing_docs)]

pub mod error;
pub mod telemetry;
pub mod template;

pub use error::{Error, ResultExt};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Config key namespace for user-defined instance labels
pub const USER_CONFIG_PREFIX: &str = "user.";

/// Instance config key holding the owning cluster's name
pub const CLUSTER_NAME_KEY: &str = "user.cluster-name";

/// Instance config key holding the owning cluster's namespace
pub const CLUSTER_NAMESPACE_KEY: &str = "user.cluster-namespace";

/// Instance config key holding the instance's role within the cluster
pub const CLUSTER_ROLE_KEY: &str = "user.cluster-role";

/// Role label value for control plane instances
pub const ROLE_CONTROL_PLANE: &str = "control-plane";

/// Role label value for load balancer instances
pub const ROLE_LOAD_BALANCER: &str = "loadbalancer";

/// Default Kubernetes API server port
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;
