//! In-memory fake host for scenario tests
//!
//! `FakeServer` implements [`LxcApi`] over shared in-memory state. Mutating
//! calls complete immediately through successful operations, starting an
//! instance assigns it an address, and every call is counted so tests can
//! assert that a retried call performed no redundant work.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use lattice_common::{Error, Result};

use crate::api::{
    FileType, ImageMetadata, Instance, InstanceExecPost, InstanceFile, InstanceFileArgs,
    InstanceNetwork, InstanceNetworkAddress, InstanceSource, InstanceState, InstanceStatePut,
    InstancesPost, Network, NetworkLoadBalancer, NetworkLoadBalancerPut,
    NetworkLoadBalancersPost, Operation, Server, ServerEnvironment, WriteMode, STATUS_SUCCESS,
};
use crate::transport::{LxcApi, OperationHandle};

/// Extensions advertised by default
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "instance_oci",
    "instance_oci_entrypoint",
    "network_load_balancer",
    "network_load_balancer_health_check",
    "container_disk_tmpfs",
];

#[derive(Clone, Debug, Default)]
struct FakeInstance {
    instance: Instance,
    source: InstanceSource,
    pid: i64,
    address: Option<String>,
    files: BTreeMap<String, InstanceFile>,
    metadata: ImageMetadata,
    template_files: BTreeMap<String, String>,
    commands: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
struct FakeState {
    server: Server,
    instances: BTreeMap<String, FakeInstance>,
    image_files: BTreeMap<String, InstanceFile>,
    operations: BTreeMap<String, Operation>,
    logs: BTreeMap<String, Vec<u8>>,
    networks: BTreeMap<String, Network>,
    load_balancers: BTreeMap<(String, String), NetworkLoadBalancer>,
    calls: BTreeMap<String, usize>,
    targets: Vec<String>,
    next_id: u64,
}

impl FakeState {
    fn count(&mut self, call: &str) {
        *self.calls.entry(call.to_string()).or_default() += 1;
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn finished(&mut self, description: &str, metadata: Option<Value>) -> OperationHandle {
        let id = format!("op-{}", self.next_id());
        let op = Operation {
            id: id.clone(),
            class: "task".to_string(),
            description: description.to_string(),
            status: "Success".to_string(),
            status_code: STATUS_SUCCESS,
            metadata,
            ..Default::default()
        };
        self.operations.insert(id, op.clone());
        OperationHandle::Pending(op)
    }

    fn instance_mut(&mut self, call: &str, name: &str) -> Result<&mut FakeInstance> {
        self.instances
            .get_mut(name)
            .ok_or_else(|| Error::api(call, 404, "Instance not found"))
    }
}

fn state_of(fake: &FakeInstance) -> InstanceState {
    let mut network = BTreeMap::from([(
        "lo".to_string(),
        InstanceNetwork {
            addresses: vec![InstanceNetworkAddress {
                family: "inet".to_string(),
                address: "127.0.0.1".to_string(),
                netmask: "8".to_string(),
                scope: "local".to_string(),
            }],
            state: "up".to_string(),
            interface_type: "loopback".to_string(),
        },
    )]);
    if let (true, Some(address)) = (fake.pid != 0, &fake.address) {
        network.insert(
            "eth0".to_string(),
            InstanceNetwork {
                addresses: vec![InstanceNetworkAddress {
                    family: (if address.contains(':') { "inet6" } else { "inet" }).to_string(),
                    address: address.clone(),
                    netmask: "24".to_string(),
                    scope: "global".to_string(),
                }],
                state: "up".to_string(),
                interface_type: "broadcast".to_string(),
            },
        );
    }
    InstanceState {
        status: fake.instance.status.clone(),
        status_code: if fake.pid != 0 { 103 } else { 102 },
        pid: fake.pid,
        network: Some(network),
    }
}

fn full_of(fake: &FakeInstance) -> Instance {
    Instance {
        state: Some(state_of(fake)),
        ..fake.instance.clone()
    }
}

/// In-memory Incus / LXD server
#[derive(Clone, Debug, Default)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    /// Standalone Incus server with every extension the engine uses
    pub fn new() -> Self {
        let fake = Self::default();
        fake.lock().server = Server {
            api_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            environment: ServerEnvironment {
                server: "incus".to_string(),
                server_version: "6.0.0".to_string(),
                driver: "lxc | qemu".to_string(),
                architectures: vec!["x86_64".to_string()],
                server_clustered: false,
            },
        };
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report the given server implementation ("incus", "lxd", ...)
    pub fn with_server_name(self, server: &str) -> Self {
        self.lock().server.environment.server = server.to_string();
        self
    }

    /// Replace the advertised extensions
    pub fn with_extensions(self, extensions: &[&str]) -> Self {
        self.lock().server.api_extensions = extensions.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Report the server as a cluster member
    pub fn with_clustered(self, clustered: bool) -> Self {
        self.lock().server.environment.server_clustered = clustered;
        self
    }

    /// Seed every newly created instance with this file
    pub fn with_image_file(self, path: &str, content: impl AsRef<[u8]>, mode: u32) -> Self {
        self.lock().image_files.insert(
            path.to_string(),
            InstanceFile {
                content: content.as_ref().to_vec(),
                uid: 0,
                gid: 0,
                mode,
                file_type: FileType::File,
            },
        );
        self
    }

    /// Add a managed network
    pub fn add_network(&self, name: &str, network_type: &str) {
        self.lock().networks.insert(
            name.to_string(),
            Network {
                name: name.to_string(),
                network_type: network_type.to_string(),
                managed: true,
                status: "Created".to_string(),
                ..Default::default()
            },
        );
    }

    /// Add a pre-existing network load balancer
    pub fn add_load_balancer(&self, network: &str, lb: NetworkLoadBalancer) {
        self.lock()
            .load_balancers
            .insert((network.to_string(), lb.listen_address.clone()), lb);
    }

    /// Add a running instance with the given config and address
    pub fn add_running_instance(&self, name: &str, config: &[(&str, &str)], address: &str) {
        let mut state = self.lock();
        let pid = 1000 + state.next_id() as i64;
        state.instances.insert(
            name.to_string(),
            FakeInstance {
                instance: Instance {
                    name: name.to_string(),
                    status: "Running".to_string(),
                    instance_kind: "container".to_string(),
                    config: config
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    ..Default::default()
                },
                pid,
                address: Some(address.to_string()),
                ..Default::default()
            },
        );
    }

    /// Remove an instance out of band
    pub fn remove_instance(&self, name: &str) {
        self.lock().instances.remove(name);
    }

    /// Number of instances
    pub fn instance_count(&self) -> usize {
        self.lock().instances.len()
    }

    /// Instance with its runtime state
    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.lock().instances.get(name).map(full_of)
    }

    /// Image source an instance was created from
    pub fn instance_source(&self, name: &str) -> Option<InstanceSource> {
        self.lock().instances.get(name).map(|i| i.source.clone())
    }

    /// File inside an instance
    pub fn file(&self, name: &str, path: &str) -> Option<InstanceFile> {
        self.lock()
            .instances
            .get(name)
            .and_then(|i| i.files.get(path).cloned())
    }

    /// Metadata of an instance
    pub fn metadata(&self, name: &str) -> Option<ImageMetadata> {
        self.lock().instances.get(name).map(|i| i.metadata.clone())
    }

    /// Uploaded template file of an instance
    pub fn template_file(&self, name: &str, template: &str) -> Option<String> {
        self.lock()
            .instances
            .get(name)
            .and_then(|i| i.template_files.get(template).cloned())
    }

    /// Commands executed inside an instance
    pub fn commands(&self, name: &str) -> Vec<Vec<String>> {
        self.lock()
            .instances
            .get(name)
            .map(|i| i.commands.clone())
            .unwrap_or_default()
    }

    /// Network load balancer at a listen address
    pub fn load_balancer(&self, network: &str, listen_address: &str) -> Option<NetworkLoadBalancer> {
        self.lock()
            .load_balancers
            .get(&(network.to_string(), listen_address.to_string()))
            .cloned()
    }

    /// Number of calls made to an API method (e.g. "create_instance")
    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Targets passed to `use_target`
    pub fn targets(&self) -> Vec<String> {
        self.lock().targets.clone()
    }
}

#[async_trait]
impl LxcApi for FakeServer {
    async fn get_server(&self) -> Result<Server> {
        let mut state = self.lock();
        state.count("get_server");
        Ok(state.server.clone())
    }

    fn use_target(&self, target: &str) -> Arc<dyn LxcApi> {
        let mut state = self.lock();
        state.count("use_target");
        state.targets.push(target.to_string());
        Arc::new(self.clone())
    }

    async fn get_instance_state(&self, name: &str) -> Result<InstanceState> {
        let mut state = self.lock();
        state.count("get_instance_state");
        state.instance_mut("GetInstanceState", name).map(|i| state_of(i))
    }

    async fn get_instance_full(&self, name: &str) -> Result<Instance> {
        let mut state = self.lock();
        state.count("get_instance_full");
        state.instance_mut("GetInstanceFull", name).map(|i| full_of(i))
    }

    async fn list_instances_full(&self) -> Result<Vec<Instance>> {
        let mut state = self.lock();
        state.count("list_instances_full");
        Ok(state.instances.values().map(full_of).collect())
    }

    async fn create_instance(&self, request: &InstancesPost) -> Result<OperationHandle> {
        let mut state = self.lock();
        state.count("create_instance");
        if state.instances.contains_key(&request.name) {
            return Err(Error::api("CreateInstance", 409, "Instance already exists"));
        }
        let files = state.image_files.clone();
        state.instances.insert(
            request.name.clone(),
            FakeInstance {
                instance: Instance {
                    name: request.name.clone(),
                    status: "Stopped".to_string(),
                    instance_kind: request.instance_kind.clone(),
                    config: request.config.clone(),
                    devices: request.devices.clone(),
                    profiles: request.profiles.clone(),
                    ..Default::default()
                },
                source: request.source.clone(),
                files,
                ..Default::default()
            },
        );
        Ok(state.finished("Creating instance", None))
    }

    async fn update_instance_state(
        &self,
        name: &str,
        put: &InstanceStatePut,
    ) -> Result<OperationHandle> {
        let mut state = self.lock();
        state.count("update_instance_state");
        let id = state.next_id();
        let instance = state.instance_mut("UpdateInstanceState", name)?;
        match put.action.as_str() {
            "start" => {
                instance.instance.status = "Running".to_string();
                instance.pid = 1000 + id as i64;
                if instance.address.is_none() {
                    instance.address = Some(format!("10.0.{}.{}", id / 250, id % 250 + 2));
                }
            }
            "stop" => {
                instance.instance.status = "Stopped".to_string();
                instance.pid = 0;
            }
            other => {
                return Err(Error::api(
                    "UpdateInstanceState",
                    400,
                    format!("Unknown action {:?}", other),
                ))
            }
        }
        Ok(state.finished("Updating instance state", None))
    }

    async fn delete_instance(&self, name: &str) -> Result<OperationHandle> {
        let mut state = self.lock();
        state.count("delete_instance");
        let instance = state.instance_mut("DeleteInstance", name)?;
        if instance.pid != 0 {
            return Err(Error::api(
                "DeleteInstance",
                400,
                "Instance is running",
            ));
        }
        state.instances.remove(name);
        Ok(state.finished("Deleting instance", None))
    }

    async fn exec_instance(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> Result<OperationHandle> {
        let mut state = self.lock();
        state.count("exec_instance");
        let id = state.next_id();
        let instance = state.instance_mut("ExecInstance", name)?;
        instance.commands.push(request.command.clone());

        let stdout = match request.command.as_slice() {
            [cmd, path] if cmd == "cat" => instance
                .files
                .get(path)
                .map(|f| f.content.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let stdout_path = format!("/1.0/instances/{}/logs/exec-output/exec_{}.stdout", name, id);
        let stderr_path = format!("/1.0/instances/{}/logs/exec-output/exec_{}.stderr", name, id);
        state.logs.insert(stdout_path.clone(), stdout);
        state.logs.insert(stderr_path.clone(), Vec::new());

        Ok(state.finished(
            "Executing command",
            Some(json!({
                "return": 0,
                "output": {"1": stdout_path, "2": stderr_path},
            })),
        ))
    }

    async fn get_log_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.count("get_log_file");
        state
            .logs
            .get(path)
            .cloned()
            .ok_or_else(|| Error::api("GetInstanceLogfile", 404, "Log file not found"))
    }

    async fn get_instance_file(&self, name: &str, path: &str) -> Result<InstanceFile> {
        let mut state = self.lock();
        state.count("get_instance_file");
        state
            .instance_mut("GetInstanceFile", name)?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::api("GetInstanceFile", 404, "File not found"))
    }

    async fn create_instance_file(
        &self,
        name: &str,
        path: &str,
        args: &InstanceFileArgs,
    ) -> Result<()> {
        let mut state = self.lock();
        state.count("create_instance_file");
        let instance = state.instance_mut("CreateInstanceFile", name)?;
        let file = instance.files.entry(path.to_string()).or_default();
        match args.write_mode {
            WriteMode::Overwrite => file.content = args.content.clone(),
            WriteMode::Append => file.content.extend_from_slice(&args.content),
        }
        file.uid = args.uid;
        file.gid = args.gid;
        file.mode = args.mode;
        file.file_type = args.file_type;
        Ok(())
    }

    async fn get_instance_metadata(&self, name: &str) -> Result<ImageMetadata> {
        let mut state = self.lock();
        state.count("get_instance_metadata");
        state
            .instance_mut("GetInstanceMetadata", name)
            .map(|i| i.metadata.clone())
    }

    async fn update_instance_metadata(&self, name: &str, metadata: &ImageMetadata) -> Result<()> {
        let mut state = self.lock();
        state.count("update_instance_metadata");
        state.instance_mut("UpdateInstanceMetadata", name)?.metadata = metadata.clone();
        Ok(())
    }

    async fn create_instance_template_file(
        &self,
        name: &str,
        template_name: &str,
        content: &str,
    ) -> Result<()> {
        let mut state = self.lock();
        state.count("create_instance_template_file");
        state
            .instance_mut("CreateInstanceTemplateFile", name)?
            .template_files
            .insert(template_name.to_string(), content.to_string());
        Ok(())
    }

    async fn list_operations(&self) -> Result<Vec<Operation>> {
        let mut state = self.lock();
        state.count("list_operations");
        Ok(state.operations.values().cloned().collect())
    }

    async fn get_operation(&self, id: &str) -> Result<Operation> {
        let mut state = self.lock();
        state.count("get_operation");
        state
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| Error::api("GetOperation", 404, "Operation not found"))
    }

    async fn get_network(&self, name: &str) -> Result<Network> {
        let mut state = self.lock();
        state.count("get_network");
        state
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| Error::api("GetNetwork", 404, "Network not found"))
    }

    async fn get_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<NetworkLoadBalancer> {
        let mut state = self.lock();
        state.count("get_network_load_balancer");
        state
            .load_balancers
            .get(&(network.to_string(), listen_address.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::api("GetNetworkLoadBalancer", 404, "Network load balancer not found")
            })
    }

    async fn create_network_load_balancer(
        &self,
        network: &str,
        request: &NetworkLoadBalancersPost,
    ) -> Result<()> {
        let mut state = self.lock();
        state.count("create_network_load_balancer");
        let key = (network.to_string(), request.listen_address.clone());
        if state.load_balancers.contains_key(&key) {
            return Err(Error::api(
                "CreateNetworkLoadBalancer",
                409,
                "A load balancer for that listen address already exists",
            ));
        }
        state.load_balancers.insert(
            key,
            NetworkLoadBalancer {
                listen_address: request.listen_address.clone(),
                put: request.put.clone(),
                location: String::new(),
            },
        );
        Ok(())
    }

    async fn update_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
        put: &NetworkLoadBalancerPut,
    ) -> Result<()> {
        let mut state = self.lock();
        state.count("update_network_load_balancer");
        let lb = state
            .load_balancers
            .get_mut(&(network.to_string(), listen_address.to_string()))
            .ok_or_else(|| {
                Error::api("UpdateNetworkLoadBalancer", 404, "Network load balancer not found")
            })?;
        lb.put = put.clone();
        Ok(())
    }

    async fn delete_network_load_balancer(&self, network: &str, listen_address: &str) -> Result<()> {
        let mut state = self.lock();
        state.count("delete_network_load_balancer");
        state
            .load_balancers
            .remove(&(network.to_string(), listen_address.to_string()))
            .map(|_| ())
            .ok_or_else(|| {
                Error::api("DeleteNetworkLoadBalancer", 404, "Network load balancer not found")
            })
    }

    async fn get_network_load_balancer_state(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<Value> {
        let mut state = self.lock();
        state.count("get_network_load_balancer_state");
        let lb = state
            .load_balancers
            .get(&(network.to_string(), listen_address.to_string()))
            .ok_or_else(|| {
                Error::api("GetNetworkLoadBalancerState", 404, "Network load balancer not found")
            })?;
        let health: BTreeMap<&str, Value> = lb
            .put
            .backends
            .iter()
            .map(|b| (b.name.as_str(), json!({"address": b.target_address, "ports": []})))
            .collect();
        Ok(json!({ "backend_health": health }))
    }
}
