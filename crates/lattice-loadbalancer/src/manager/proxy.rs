//! haproxy running in a dedicated instance

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use lattice_common::{Result, ResultExt, ROLE_LOAD_BALANCER};
use lattice_lxc::api::InstanceFileArgs;
use lattice_lxc::image::{DEFAULT_SIMPLESTREAMS_SERVER, DOCKER_HUB_SERVER};
use lattice_lxc::operation::with_deadline;
use lattice_lxc::{Client, Image, LaunchSpec};

use super::Manager;
use crate::backend::discover_backends;
use crate::haproxy::render_haproxy_config;
use crate::inspect::{add_command_output, add_info_for, InspectReport};
use crate::spec::{ClusterIdentity, LoadBalancerMachineSpec, ManagerKind};

/// cloud-init payload installing haproxy on first boot
const INSTALL_HAPROXY_USER_DATA: &str = "#cloud-config\npackages:\n- haproxy\n";

/// Permission bits of the rendered haproxy.cfg
const HAPROXY_CONFIG_MODE: u32 = 0o440;

/// How haproxy gets into the instance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyFlavor {
    /// Plain Ubuntu instance, haproxy installed from the package archive
    Native,
    /// Pre-built OCI image running haproxy as pid 1
    Packaged,
}

impl ProxyFlavor {
    /// Path of haproxy.cfg inside the instance
    pub fn config_path(&self) -> &'static str {
        match self {
            ProxyFlavor::Native => "/etc/haproxy/haproxy.cfg",
            ProxyFlavor::Packaged => "/usr/local/etc/haproxy/haproxy.cfg",
        }
    }

    /// Command making haproxy pick up a new configuration
    pub fn reload_command(&self) -> &'static [&'static str] {
        match self {
            ProxyFlavor::Native => &["systemctl", "reload", "haproxy.service"],
            ProxyFlavor::Packaged => &["kill", "--signal", "SIGUSR2", "1"],
        }
    }

    /// Image used when the instance spec does not override it
    pub fn default_image(&self) -> Image {
        match self {
            ProxyFlavor::Native => Image::simplestreams(DEFAULT_SIMPLESTREAMS_SERVER, "ubuntu/24.04"),
            ProxyFlavor::Packaged => {
                Image::oci(DOCKER_HUB_SERVER, "kindest/haproxy:v20230606-42a2262b")
            }
        }
    }

    fn launch_spec(&self) -> LaunchSpec {
        let spec = LaunchSpec::new().with_image(self.default_image());
        match self {
            ProxyFlavor::Native => {
                spec.with_config([("cloud-init.user-data", INSTALL_HAPROXY_USER_DATA)])
            }
            ProxyFlavor::Packaged => spec,
        }
    }

    fn kind(&self) -> ManagerKind {
        match self {
            ProxyFlavor::Native => ManagerKind::NativeProxy,
            ProxyFlavor::Packaged => ManagerKind::PackagedProxy,
        }
    }
}

/// Load balancer backed by an haproxy instance
pub struct ProxyInstanceManager {
    flavor: ProxyFlavor,
    client: Client,
    identity: ClusterIdentity,
    name: String,
    spec: LoadBalancerMachineSpec,
    custom_template: Option<String>,
}

impl ProxyInstanceManager {
    /// Manager for the load balancer instance of `identity`
    pub fn new(
        flavor: ProxyFlavor,
        client: Client,
        identity: ClusterIdentity,
        spec: LoadBalancerMachineSpec,
        custom_template: Option<String>,
    ) -> Self {
        Self {
            flavor,
            client,
            name: identity.load_balancer_instance_name(),
            identity,
            spec,
            custom_template,
        }
    }

    /// Name of the load balancer instance
    pub fn instance_name(&self) -> &str {
        &self.name
    }

    async fn push_config(&self, cancel: &CancellationToken) -> Result<()> {
        let view = discover_backends(&self.client, &self.identity)
            .await
            .context("failed to build load balancer configuration")?;
        let config = render_haproxy_config(&view, self.custom_template.as_deref())
            .context("failed to render load balancer config")?;

        let path = self.flavor.config_path();
        let api = self.client.api();
        let up_to_date = matches!(
            api.get_instance_file(&self.name, path).await,
            Ok(current) if current.content == config.as_bytes()
        );

        if up_to_date {
            debug!(path, "haproxy config is up to date");
        } else {
            debug!(
                path,
                servers = ?view.backend_servers.keys().collect::<Vec<_>>(),
                "Writing haproxy config"
            );
            api.create_instance_file(
                &self.name,
                path,
                &InstanceFileArgs {
                    content: config.into_bytes(),
                    mode: HAPROXY_CONFIG_MODE,
                    ..Default::default()
                },
            )
            .await
            .context("failed to write haproxy config")?;
        }

        // the running daemon may predate the file, so reload regardless
        debug!("Reloading haproxy");
        self.client
            .run_command(cancel, &self.name, self.flavor.reload_command())
            .await
            .context("failed to reload haproxy")?;
        Ok(())
    }
}

#[async_trait]
impl Manager for ProxyInstanceManager {
    fn kind(&self) -> ManagerKind {
        self.flavor.kind()
    }

    #[instrument(skip_all, fields(loadbalancer.instance = %self.name))]
    async fn create(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        if self.flavor == ProxyFlavor::Packaged {
            self.client
                .supports_instance_oci()
                .context("server does not support OCI containers")?;
        }

        let spec = self
            .flavor
            .launch_spec()
            .with_profiles(self.spec.profiles.iter().cloned())
            .with_flavor(self.spec.flavor.clone())
            .with_config(self.identity.labels_with_role(ROLE_LOAD_BALANCER))
            .with_image(self.spec.image.to_image());

        info!("Launching load balancer instance");
        self.client
            .with_target(&self.spec.target)
            .launch_instance(cancel, &self.name, spec)
            .await
            .context("failed to create load balancer instance")
    }

    #[instrument(skip_all, fields(loadbalancer.instance = %self.name))]
    async fn delete(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Deleting load balancer instance");
        self.client
            .delete_instance(cancel, &self.name)
            .await
            .context("failed to delete load balancer instance")
    }

    #[instrument(skip_all, fields(loadbalancer.instance = %self.name))]
    async fn reconfigure(&self, cancel: &CancellationToken) -> Result<()> {
        with_deadline(
            cancel,
            "ReconfigureLoadBalancer",
            self.client.timeouts().reconfigure,
            self.push_config(cancel),
        )
        .await
    }

    fn control_plane_instance_templates(
        &self,
        _control_plane_initialized: bool,
    ) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn inspect(&self, cancel: &CancellationToken) -> InspectReport {
        let mut report = InspectReport::new();
        add_info_for(
            &mut report,
            "Instance",
            self.client.api().get_instance_full(&self.name).await,
        );

        match self.flavor {
            ProxyFlavor::Native => {
                let path = self.flavor.config_path();
                let commands: [(&str, &[&str]); 6] = [
                    ("ip-a.txt", &["ip", "a"]),
                    ("ip-r.txt", &["ip", "r"]),
                    ("ss-plnt.txt", &["ss", "-plnt"]),
                    (
                        "haproxy.service",
                        &["systemctl", "status", "--no-pager", "-l", "haproxy.service"],
                    ),
                    ("haproxy.log", &["journalctl", "--no-pager", "-u", "haproxy.service"]),
                    ("haproxy.cfg", &["cat", path]),
                ];
                for (name, command) in commands {
                    add_command_output(&mut report, &self.client, cancel, &self.name, name, command)
                        .await;
                }
            }
            ProxyFlavor::Packaged => {
                let config = match self
                    .client
                    .api()
                    .get_instance_file(&self.name, self.flavor.config_path())
                    .await
                {
                    Ok(file) => String::from_utf8_lossy(&file.content).into_owned(),
                    Err(e) => format!("failed to GetInstanceFile: {}", e),
                };
                report.insert("haproxy.cfg".to_string(), config);
            }
        }
        report
    }
}
