//! Control plane load balancers for clusters on Incus and LXD
//!
//! A cluster declares one load balancer strategy ([`LoadBalancerSpec`]).
//! [`manager_for_cluster`] turns it into a [`Manager`] that creates, deletes
//! and reconfigures the load balancer. Reconfigure keeps its backend set in
//! sync with the cluster's running control plane instances.

#![deny(missing_docs)]

pub mod backend;
pub mod haproxy;
pub mod inspect;
pub mod manager;
pub mod spec;

pub use backend::{discover_backends, BackendServer, BackendView, DEFAULT_BACKEND_WEIGHT};
pub use inspect::InspectReport;
pub use manager::{manager_for_cluster, provision, Manager};
pub use spec::{ClusterIdentity, LoadBalancerSpec, ManagerKind};
