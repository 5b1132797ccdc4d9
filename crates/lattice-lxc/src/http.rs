//! `LxcApi` over HTTP
//!
//! Talks to the host REST API over a local unix socket (`unix://`) or over
//! mutual TLS (`https://`). For TLS, a pinned server certificate is the only
//! certificate accepted, whatever the URL host; `insecure-skip-verify`
//! disables verification.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace};

use lattice_common::{Error, Result};

use crate::api::{
    FileType, ImageMetadata, Instance, InstanceExecPost, InstanceFile, InstanceFileArgs,
    InstanceState, InstanceStatePut, InstancesPost, Network, NetworkLoadBalancer,
    NetworkLoadBalancerPut, NetworkLoadBalancersPost, Operation, ResponseEnvelope, Server,
};
use crate::config::{find_default_unix_socket, Configuration};
use crate::tls::pinned_client_config;
use crate::transport::{LxcApi, OperationHandle};

/// Host used in request URLs when connected over a unix socket
const UNIX_SOCKET_BASE_URL: &str = "http://unix.socket";

/// File header prefixes; Incus reads `X-Incus-*`, LXD reads `X-LXD-*`
const FILE_HEADER_PREFIXES: &[&str] = &["X-Incus", "X-LXD"];

const OCTET_STREAM: &str = "application/octet-stream";

/// HTTP implementation of [`LxcApi`]
#[derive(Clone)]
pub struct HttpLxcClient {
    http: reqwest::Client,
    base_url: String,
    project: Option<String>,
    target: Option<String>,
}

impl std::fmt::Debug for HttpLxcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLxcClient")
            .field("base_url", &self.base_url)
            .field("project", &self.project)
            .field("target", &self.target)
            .finish()
    }
}

impl HttpLxcClient {
    /// Build a client for the configured endpoint
    ///
    /// Fails with a validation error when the URL scheme is neither
    /// `unix://` nor `https://` or when certificates cannot be parsed.
    pub fn new(config: &Configuration) -> Result<Self> {
        let (http, base_url) = if let Some(socket) = config.server_url.strip_prefix("unix://") {
            let socket = if socket.is_empty() {
                find_default_unix_socket()?
            } else {
                PathBuf::from(socket)
            };
            debug!(socket = %socket.display(), "Connecting over unix socket");
            let http = reqwest::Client::builder()
                .unix_socket(socket)
                .build()
                .map_err(|e| Error::transport("build unix socket client", e.to_string()))?;
            (http, UNIX_SOCKET_BASE_URL.to_string())
        } else if config.server_url.starts_with("https://") {
            debug!(
                server = %config.server_url,
                insecure_skip_verify = config.insecure_skip_verify,
                pinned_server_crt = !config.server_crt.is_empty(),
                "Connecting over HTTPS"
            );
            (
                https_client(config)?,
                config.server_url.trim_end_matches('/').to_string(),
            )
        } else {
            return Err(Error::validation_for_field(
                "server",
                format!("server {:?} is not unix:// or https://", config.server_url),
            ));
        };

        Ok(Self {
            http,
            base_url,
            project: Some(config.project.clone()).filter(|p| !p.is_empty()),
            target: None,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(project) = &self.project {
            builder = builder.query(&[("project", project)]);
        }
        builder
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response> {
        trace!(operation, "Sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| Error::transport(operation, e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(operation, e.to_string()))?;
        Err(error_from_body(operation, status, &body))
    }

    async fn envelope(&self, operation: &str, builder: RequestBuilder) -> Result<ResponseEnvelope> {
        let response = self.send(operation, builder).await?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(operation, e.to_string()))?;
        let envelope: ResponseEnvelope = serde_json::from_slice(&body)
            .map_err(|e| Error::serialization_for_kind(operation, e.to_string()))?;
        if envelope.kind == "error" {
            return Err(error_from_envelope(operation, status, &envelope));
        }
        Ok(envelope)
    }

    async fn get_json<T: DeserializeOwned>(&self, operation: &str, builder: RequestBuilder) -> Result<T> {
        let envelope = self.envelope(operation, builder).await?;
        serde_json::from_value(envelope.metadata)
            .map_err(|e| Error::serialization_for_kind(operation, e.to_string()))
    }

    async fn sync(&self, operation: &str, builder: RequestBuilder) -> Result<()> {
        self.envelope(operation, builder).await.map(|_| ())
    }

    async fn mutate(&self, operation: &str, builder: RequestBuilder) -> Result<OperationHandle> {
        let envelope = self.envelope(operation, builder).await?;
        if envelope.kind != "async" {
            return Ok(OperationHandle::Completed);
        }
        let op: Operation = serde_json::from_value(envelope.metadata)
            .map_err(|e| Error::serialization_for_kind(operation, e.to_string()))?;
        debug!(operation, id = %op.id, "Started operation");
        Ok(OperationHandle::Pending(op))
    }
}

fn https_client(config: &Configuration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if !config.insecure_skip_verify && !config.server_crt.is_empty() {
        let tls = pinned_client_config(&config.server_crt, &config.client_crt, &config.client_key)?;
        return builder
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|e| Error::transport("build https client", e.to_string()));
    }

    if config.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if !config.client_crt.is_empty() || !config.client_key.is_empty() {
        let pem = format!("{}\n{}", config.client_crt.trim_end(), config.client_key.trim_end());
        let identity = reqwest::Identity::from_pem(pem.as_bytes())
            .map_err(|e| Error::validation_for_field("client-crt", format!("invalid client certificate or key: {}", e)))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| Error::transport("build https client", e.to_string()))
}

fn error_from_body(operation: &str, status: u16, body: &[u8]) -> Error {
    match serde_json::from_slice::<ResponseEnvelope>(body) {
        Ok(envelope) if !envelope.error.is_empty() => {
            error_from_envelope(operation, status, &envelope)
        }
        _ => Error::api(operation, status, String::from_utf8_lossy(body).trim().to_string()),
    }
}

fn error_from_envelope(operation: &str, status: u16, envelope: &ResponseEnvelope) -> Error {
    let code = u16::try_from(envelope.error_code)
        .ok()
        .filter(|c| *c != 0)
        .unwrap_or(status);
    Error::api(operation, code, envelope.error.clone())
}

fn file_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    FILE_HEADER_PREFIXES.iter().find_map(|prefix| {
        headers
            .get(format!("{}-{}", prefix, name))
            .and_then(|v| v.to_str().ok())
    })
}

fn with_file_headers(mut builder: RequestBuilder, args: &InstanceFileArgs) -> RequestBuilder {
    for prefix in FILE_HEADER_PREFIXES {
        builder = builder
            .header(format!("{}-Uid", prefix), args.uid.to_string())
            .header(format!("{}-Gid", prefix), args.gid.to_string())
            .header(format!("{}-Mode", prefix), format!("{:04o}", args.mode))
            .header(format!("{}-Type", prefix), args.file_type.as_str())
            .header(format!("{}-Write", prefix), args.write_mode.as_str());
    }
    builder
}

fn lb_path(network: &str, listen_address: &str) -> String {
    format!("/1.0/networks/{}/load-balancers/{}", network, listen_address)
}

#[async_trait]
impl LxcApi for HttpLxcClient {
    async fn get_server(&self) -> Result<Server> {
        self.get_json("GetServer", self.request(Method::GET, "/1.0"))
            .await
    }

    fn use_target(&self, target: &str) -> Arc<dyn LxcApi> {
        Arc::new(Self {
            target: Some(target.to_string()).filter(|t| !t.is_empty()),
            ..self.clone()
        })
    }

    async fn get_instance_state(&self, name: &str) -> Result<InstanceState> {
        let path = format!("/1.0/instances/{}/state", name);
        self.get_json("GetInstanceState", self.request(Method::GET, &path))
            .await
    }

    async fn get_instance_full(&self, name: &str) -> Result<Instance> {
        let path = format!("/1.0/instances/{}", name);
        self.get_json(
            "GetInstanceFull",
            self.request(Method::GET, &path).query(&[("recursion", "1")]),
        )
        .await
    }

    async fn list_instances_full(&self) -> Result<Vec<Instance>> {
        self.get_json(
            "GetInstancesFull",
            self.request(Method::GET, "/1.0/instances")
                .query(&[("recursion", "2")]),
        )
        .await
    }

    async fn create_instance(&self, request: &InstancesPost) -> Result<OperationHandle> {
        let mut builder = self.request(Method::POST, "/1.0/instances").json(request);
        if let Some(target) = &self.target {
            builder = builder.query(&[("target", target)]);
        }
        self.mutate("CreateInstance", builder).await
    }

    async fn update_instance_state(
        &self,
        name: &str,
        state: &InstanceStatePut,
    ) -> Result<OperationHandle> {
        let path = format!("/1.0/instances/{}/state", name);
        self.mutate(
            "UpdateInstanceState",
            self.request(Method::PUT, &path).json(state),
        )
        .await
    }

    async fn delete_instance(&self, name: &str) -> Result<OperationHandle> {
        let path = format!("/1.0/instances/{}", name);
        self.mutate("DeleteInstance", self.request(Method::DELETE, &path))
            .await
    }

    async fn exec_instance(
        &self,
        name: &str,
        request: &InstanceExecPost,
    ) -> Result<OperationHandle> {
        let path = format!("/1.0/instances/{}/exec", name);
        self.mutate("ExecInstance", self.request(Method::POST, &path).json(request))
            .await
    }

    async fn get_log_file(&self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .send("GetInstanceLogfile", self.request(Method::GET, path))
            .await?;
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::transport("GetInstanceLogfile", e.to_string()))
    }

    async fn get_instance_file(&self, name: &str, path: &str) -> Result<InstanceFile> {
        let url = format!("/1.0/instances/{}/files", name);
        let response = self
            .send(
                "GetInstanceFile",
                self.request(Method::GET, &url).query(&[("path", path)]),
            )
            .await?;

        let headers = response.headers().clone();
        let parse_id = |name: &str| {
            file_header(&headers, name)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let uid = parse_id("Uid");
        let gid = parse_id("Gid");
        let mode = file_header(&headers, "Mode")
            .and_then(|v| u32::from_str_radix(v, 8).ok())
            .unwrap_or(0o644);
        let file_type = file_header(&headers, "Type")
            .map(FileType::parse)
            .unwrap_or_default();

        let content = response
            .bytes()
            .await
            .map_err(|e| Error::transport("GetInstanceFile", e.to_string()))?
            .to_vec();

        Ok(InstanceFile {
            content,
            uid,
            gid,
            mode,
            file_type,
        })
    }

    async fn create_instance_file(
        &self,
        name: &str,
        path: &str,
        args: &InstanceFileArgs,
    ) -> Result<()> {
        let url = format!("/1.0/instances/{}/files", name);
        let builder = self
            .request(Method::POST, &url)
            .query(&[("path", path)])
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(args.content.clone());
        self.sync("CreateInstanceFile", with_file_headers(builder, args))
            .await
    }

    async fn get_instance_metadata(&self, name: &str) -> Result<ImageMetadata> {
        let path = format!("/1.0/instances/{}/metadata", name);
        self.get_json("GetInstanceMetadata", self.request(Method::GET, &path))
            .await
    }

    async fn update_instance_metadata(&self, name: &str, metadata: &ImageMetadata) -> Result<()> {
        let path = format!("/1.0/instances/{}/metadata", name);
        self.sync(
            "UpdateInstanceMetadata",
            self.request(Method::PUT, &path).json(metadata),
        )
        .await
    }

    async fn create_instance_template_file(
        &self,
        name: &str,
        template_name: &str,
        content: &str,
    ) -> Result<()> {
        let path = format!("/1.0/instances/{}/metadata/templates", name);
        self.sync(
            "CreateInstanceTemplateFile",
            self.request(Method::POST, &path)
                .query(&[("path", template_name)])
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(content.to_string()),
        )
        .await
    }

    async fn list_operations(&self) -> Result<Vec<Operation>> {
        let by_status: BTreeMap<String, Vec<Operation>> = self
            .get_json(
                "GetOperations",
                self.request(Method::GET, "/1.0/operations")
                    .query(&[("recursion", "1")]),
            )
            .await?;
        Ok(by_status.into_values().flatten().collect())
    }

    async fn get_operation(&self, id: &str) -> Result<Operation> {
        let path = format!("/1.0/operations/{}", id);
        self.get_json("GetOperation", self.request(Method::GET, &path))
            .await
    }

    async fn get_network(&self, name: &str) -> Result<Network> {
        let path = format!("/1.0/networks/{}", name);
        self.get_json("GetNetwork", self.request(Method::GET, &path))
            .await
    }

    async fn get_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<NetworkLoadBalancer> {
        self.get_json(
            "GetNetworkLoadBalancer",
            self.request(Method::GET, &lb_path(network, listen_address)),
        )
        .await
    }

    async fn create_network_load_balancer(
        &self,
        network: &str,
        request: &NetworkLoadBalancersPost,
    ) -> Result<()> {
        let path = format!("/1.0/networks/{}/load-balancers", network);
        self.sync(
            "CreateNetworkLoadBalancer",
            self.request(Method::POST, &path).json(request),
        )
        .await
    }

    async fn update_network_load_balancer(
        &self,
        network: &str,
        listen_address: &str,
        put: &NetworkLoadBalancerPut,
    ) -> Result<()> {
        self.sync(
            "UpdateNetworkLoadBalancer",
            self.request(Method::PUT, &lb_path(network, listen_address))
                .json(put),
        )
        .await
    }

    async fn delete_network_load_balancer(&self, network: &str, listen_address: &str) -> Result<()> {
        self.sync(
            "DeleteNetworkLoadBalancer",
            self.request(Method::DELETE, &lb_path(network, listen_address)),
        )
        .await
    }

    async fn get_network_load_balancer_state(
        &self,
        network: &str,
        listen_address: &str,
    ) -> Result<Value> {
        let path = format!("{}/state", lb_path(network, listen_address));
        self.get_json(
            "GetNetworkLoadBalancerState",
            self.request(Method::GET, &path),
        )
        .await
    }
}
