//! Wire types for the Incus / LXD REST API
//!
//! Only the fields the lifecycle engine and load balancer managers read or
//! write are modelled. Unknown fields are ignored on decode; objects that are
//! read, modified and written back (instance metadata) keep them in `extra`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operation status code: the operation is still running
pub const STATUS_RUNNING: i64 = 103;
/// Operation status code: the operation completed successfully
pub const STATUS_SUCCESS: i64 = 200;
/// Operation status code: the operation failed
pub const STATUS_FAILURE: i64 = 400;
/// Operation status code: the operation was cancelled
pub const STATUS_CANCELLED: i64 = 401;

/// Response envelope returned by every JSON endpoint
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResponseEnvelope {
    /// One of "sync", "async" or "error"
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Status code of a sync response
    #[serde(default)]
    pub status_code: i64,
    /// HTTP status of an error response
    #[serde(default)]
    pub error_code: i64,
    /// Error message of an error response
    #[serde(default)]
    pub error: String,
    /// Operation URL of an async response
    #[serde(default)]
    pub operation: String,
    /// Response payload
    #[serde(default)]
    pub metadata: Value,
}

/// Server information returned by `GET /1.0`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Server {
    /// API extensions supported by the server
    #[serde(default)]
    pub api_extensions: Vec<String>,
    /// Server environment
    #[serde(default)]
    pub environment: ServerEnvironment,
}

/// Environment section of the server information
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerEnvironment {
    /// Server implementation ("incus" or "lxd")
    #[serde(default)]
    pub server: String,
    /// Server version
    #[serde(default)]
    pub server_version: String,
    /// Instance drivers, separated by " | " (e.g. "lxc | qemu")
    #[serde(default)]
    pub driver: String,
    /// Supported architectures
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Whether the server is a cluster member
    #[serde(default)]
    pub server_clustered: bool,
}

/// Image source of an instance create request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSource {
    /// Source type, always "image" for launches
    #[serde(rename = "type")]
    pub source_type: String,
    /// Remote protocol ("simplestreams", "oci", "incus", "lxd")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    /// Remote server URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// Image alias
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    /// Image fingerprint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
}

/// Request body of `POST /1.0/instances`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstancesPost {
    /// Instance name
    pub name: String,
    /// Image source
    pub source: InstanceSource,
    /// "container" or "virtual-machine"
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub instance_kind: String,
    /// Size flavor (e.g. "c2-m4")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    /// Instance config
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Instance devices
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    /// Instance profiles
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// An instance, as returned by recursive list and full get
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Instance {
    /// Instance name
    pub name: String,
    /// Instance status ("Running", "Stopped", ...)
    #[serde(default)]
    pub status: String,
    /// "container" or "virtual-machine"
    #[serde(rename = "type", default)]
    pub instance_kind: String,
    /// Cluster member hosting the instance
    #[serde(default)]
    pub location: String,
    /// Instance config, including `user.*` labels
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Instance devices
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    /// Instance profiles
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Runtime state, only present in recursive responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceState>,
}

/// Runtime state of an instance
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceState {
    /// Instance status ("Running", "Stopped", ...)
    #[serde(default)]
    pub status: String,
    /// Instance status code
    #[serde(default)]
    pub status_code: i64,
    /// PID of the instance init process, 0 when stopped
    #[serde(default)]
    pub pid: i64,
    /// Network interfaces by name
    #[serde(default)]
    pub network: Option<BTreeMap<String, InstanceNetwork>>,
}

/// State of one network interface
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceNetwork {
    /// Addresses assigned to the interface
    #[serde(default)]
    pub addresses: Vec<InstanceNetworkAddress>,
    /// Interface state ("up", "down")
    #[serde(default)]
    pub state: String,
    /// Interface type ("broadcast", "loopback", ...)
    #[serde(rename = "type", default)]
    pub interface_type: String,
}

/// One address of a network interface
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InstanceNetworkAddress {
    /// "inet" or "inet6"
    #[serde(default)]
    pub family: String,
    /// IP address
    #[serde(default)]
    pub address: String,
    /// Prefix length
    #[serde(default)]
    pub netmask: String,
    /// "global", "link" or "local"
    #[serde(default)]
    pub scope: String,
}

/// Request body of `PUT /1.0/instances/{name}/state`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatePut {
    /// "start", "stop", "restart", "freeze" or "unfreeze"
    pub action: String,
    /// Timeout in seconds, -1 for none
    pub timeout: i64,
    /// Force the state change
    pub force: bool,
    /// Stateful stop/start
    pub stateful: bool,
}

impl InstanceStatePut {
    /// Start action
    pub fn start() -> Self {
        Self {
            action: "start".to_string(),
            timeout: -1,
            ..Default::default()
        }
    }

    /// Forced stop action
    pub fn force_stop() -> Self {
        Self {
            action: "stop".to_string(),
            timeout: -1,
            force: true,
            ..Default::default()
        }
    }
}

/// Request body of `POST /1.0/instances/{name}/exec`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceExecPost {
    /// Command and arguments
    pub command: Vec<String>,
    /// Extra environment variables
    pub environment: BTreeMap<String, String>,
    /// Wait for websocket connections before running
    pub wait_for_websocket: bool,
    /// Record stdout/stderr to log files on the server
    pub record_output: bool,
    /// Allocate a terminal
    pub interactive: bool,
}

impl InstanceExecPost {
    /// Non-interactive exec that records its output on the server
    pub fn recorded(command: Vec<String>) -> Self {
        Self {
            command,
            record_output: true,
            ..Default::default()
        }
    }
}

/// Type of an instance file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Regular file
    #[default]
    File,
    /// Symbolic link, content is the link target
    Symlink,
    /// Directory
    Directory,
}

impl FileType {
    /// Wire value of the file type header
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Symlink => "symlink",
            FileType::Directory => "directory",
        }
    }

    /// Parse the wire value of the file type header
    pub fn parse(value: &str) -> Self {
        match value {
            "symlink" => FileType::Symlink,
            "directory" => FileType::Directory,
            _ => FileType::File,
        }
    }
}

/// Write mode of an instance file upload
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Replace existing content
    #[default]
    Overwrite,
    /// Append to existing content
    Append,
}

impl WriteMode {
    /// Wire value of the write mode header
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Overwrite => "overwrite",
            WriteMode::Append => "append",
        }
    }
}

/// Arguments of an instance file upload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceFileArgs {
    /// File content (link target for symlinks, empty for directories)
    pub content: Vec<u8>,
    /// Owner uid
    pub uid: i64,
    /// Owner gid
    pub gid: i64,
    /// Permission bits
    pub mode: u32,
    /// File type
    pub file_type: FileType,
    /// Write mode
    pub write_mode: WriteMode,
}

/// An instance file, as read from the server
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceFile {
    /// File content
    pub content: Vec<u8>,
    /// Owner uid
    pub uid: i64,
    /// Owner gid
    pub gid: i64,
    /// Permission bits
    pub mode: u32,
    /// File type
    pub file_type: FileType,
}

/// Instance metadata (`metadata.yaml` of the instance)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Templates applied by the server, keyed by target path
    #[serde(default)]
    pub templates: BTreeMap<String, ImageMetadataTemplate>,
    /// Fields not modelled here, written back unchanged
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One template entry of the instance metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadataTemplate {
    /// Triggers ("create", "copy", "start")
    #[serde(default)]
    pub when: Vec<String>,
    /// Only apply when the target file does not exist yet
    #[serde(default)]
    pub create_only: bool,
    /// Template file name under the instance templates directory
    #[serde(default)]
    pub template: String,
    /// Template properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// A long-running operation
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Operation {
    /// Operation UUID
    pub id: String,
    /// "task", "websocket" or "token"
    #[serde(default)]
    pub class: String,
    /// Human readable description (e.g. "Creating instance")
    #[serde(default)]
    pub description: String,
    /// Status ("Running", "Success", "Failure", ...)
    #[serde(default)]
    pub status: String,
    /// Status code, see `STATUS_*`
    #[serde(default)]
    pub status_code: i64,
    /// Affected resources by kind (e.g. "instances": ["/1.0/instances/c1"])
    #[serde(default)]
    pub resources: BTreeMap<String, Vec<String>>,
    /// Operation specific payload
    #[serde(default)]
    pub metadata: Option<Value>,
    /// Failure message
    #[serde(default)]
    pub err: String,
}

impl Operation {
    /// Whether the operation reached a final state
    pub fn is_final(&self) -> bool {
        matches!(
            self.status_code,
            STATUS_SUCCESS | STATUS_FAILURE | STATUS_CANCELLED
        )
    }
}

/// A network, as returned by `GET /1.0/networks/{name}`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Network {
    /// Network name
    pub name: String,
    /// Network description
    #[serde(default)]
    pub description: String,
    /// Network type ("bridge", "ovn", ...)
    #[serde(rename = "type", default)]
    pub network_type: String,
    /// Whether the network is managed by the server
    #[serde(default)]
    pub managed: bool,
    /// Network status
    #[serde(default)]
    pub status: String,
    /// Network config
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// One backend of a network load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLoadBalancerBackend {
    /// Backend name
    pub name: String,
    /// Backend description
    #[serde(default)]
    pub description: String,
    /// Target port(s)
    #[serde(default)]
    pub target_port: String,
    /// Target address
    pub target_address: String,
}

/// One listen port of a network load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLoadBalancerPort {
    /// Port description
    #[serde(default)]
    pub description: String,
    /// "tcp" or "udp"
    pub protocol: String,
    /// Listen port(s)
    pub listen_port: String,
    /// Backends receiving traffic for this port
    #[serde(default)]
    pub target_backend: Vec<String>,
}

/// Writable fields of a network load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLoadBalancerPut {
    /// Description
    #[serde(default)]
    pub description: String,
    /// Config, including `user.*` labels and health check settings
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Backends
    #[serde(default)]
    pub backends: Vec<NetworkLoadBalancerBackend>,
    /// Listen ports
    #[serde(default)]
    pub ports: Vec<NetworkLoadBalancerPort>,
}

/// Request body of `POST /1.0/networks/{network}/load-balancers`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLoadBalancersPost {
    /// Listen address
    pub listen_address: String,
    /// Initial writable fields
    #[serde(flatten)]
    pub put: NetworkLoadBalancerPut,
}

/// A network load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLoadBalancer {
    /// Listen address
    pub listen_address: String,
    /// Writable fields
    #[serde(flatten)]
    pub put: NetworkLoadBalancerPut,
    /// Cluster member hosting the load balancer
    #[serde(default)]
    pub location: String,
}
