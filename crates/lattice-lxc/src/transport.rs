//! Remote API surface consumed by the lifecycle engine
//!
//! Provides a trait-based abstraction over the host REST API, allowing tests
//! to substitute a mock or an in-memory host while production code talks to a
//! real server over HTTPS or a local unix socket.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use lattice_common::Error;

use crate::api::{
    ImageMetadata, Instance, InstanceExecPost, InstanceFile, InstanceFileArgs, InstanceState,
    InstanceStatePut, InstancesPost, Network, NetworkLoadBalancer, NetworkLoadBalancerPut,
    NetworkLoadBalancersPost, Operation, Server,
};

/// Result of a mutating call
///
/// The host answers mutating calls either synchronously or with a handle to
/// a long-running operation that must be awaited.
#[derive(Clone, Debug)]
pub enum OperationHandle {
    /// The call completed synchronously
    Completed,
    /// The call started a long-running operation
    Pending(Operation),
}

/// Trait abstracting the host REST API
///
/// Every call is a live round trip: implementations keep no cache besides
/// connection state. Errors reported by the server are `Error::Api` with the
/// HTTP status, so callers can classify "not found" and "already exists"
/// without inspecting messages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LxcApi: Send + Sync {
    /// Fetch server information (`GET /1.0`)
    async fn get_server(&self) -> Result<Server, Error>;

    /// Return a copy of this API scoped to a cluster member or `@group`
    fn use_target(&self, target: &str) -> Arc<dyn LxcApi>;

    /// Fetch the runtime state of an instance
    async fn get_instance_state(&self, name: &str) -> Result<InstanceState, Error>;

    /// Fetch an instance including its runtime state
    async fn get_instance_full(&self, name: &str) -> Result<Instance, Error>;

    /// List all instances of the project including their runtime state
    async fn list_instances_full(&self) -> Result<Vec<Instance>, Error>;

    /// Create an instance
    async fn create_instance(&self, request: &InstancesPost) -> Result<OperationHandle, Error>;

    /// Change the state of an instance (start, stop)
    async fn update_instance_state(
        &self,
        name: &str,
        state: &InstanceStatePut,
    ) -> Result<OperationHandle, Error>;

    /// Delete an instance
    async fn delete_instance(&self, name: &str) -> Result<OperationHandle, Error>;

    /// Run a command inside an instance
    async fn exec_instance(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> Result<OperationHandle, Error>;

    /// Download a log file by its API path (e.g. recorded exec output)
    async fn get_log_file(&self, path: &str) -> Result<Vec<u8>, Error>;

    /// Read a file from an instance
    async fn get_instance_file(&self, name: &str, path: &str) -> Result<InstanceFile, Error>;

    /// Create or update a file, symlink or directory in an instance
    async fn create_instance_file(
        &self,
        name: &str,
        path: &str,
        args: &InstanceFileArgs,
    ) -> Result<(), Error>;

    /// Fetch the instance metadata
    async fn get_instance_metadata(&self, name: &str) -> Result<ImageMetadata, Error>;

    /// Replace the instance metadata
    async fn update_instance_metadata(
        &self,
        name: &str,
        metadata: &ImageMetadata,
    ) -> Result<(), Error>;

    /// Upload a template file into the instance templates directory
    async fn create_instance_template_file(
        &self,
        name: &str,
        template_name: &str,
        content: &str,
    ) -> Result<(), Error>;

    /// List operations of the project
    async fn list_operations(&self) -> Result<Vec<Operation>, Error>;

    /// Fetch an operation by id
    async fn get_operation(&self, id: &str) -> Result<Operation, Error>;

    /// Fetch a network
    async fn get_network(&self, name: &str) -> Result<Network, Error>;

    /// Fetch a network load balancer
    async fn get_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<NetworkLoadBalancer, Error>;

    /// Create a network load balancer
    async fn create_network_load_balancer(
        &self,
        network: &str,
        request: &NetworkLoadBalancersPost,
    ) -> Result<(), Error>;

    /// Replace the writable fields of a network load balancer
    async fn update_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
        put: &NetworkLoadBalancerPut,
    ) -> Result<(), Error>;

    /// Delete a network load balancer
    async fn delete_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<(), Error>;

    /// Fetch the runtime state (backend health) of a network load balancer
    async fn get_network_load_balancer_state(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<Value, Error>;
}
