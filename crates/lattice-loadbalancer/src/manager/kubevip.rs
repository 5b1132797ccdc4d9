//! kube-vip static pod injected into control plane instances

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lattice_common::template::TemplateEngine;
use lattice_common::{Error, Result, DEFAULT_API_SERVER_PORT};

use super::Manager;
use crate::inspect::InspectReport;
use crate::spec::{ClusterIdentity, LoadBalancerKubeVip, ManagerKind};

/// kube-vip image used when none is configured
pub const DEFAULT_KUBE_VIP_IMAGE: &str = "ghcr.io/kube-vip/kube-vip:v0.6.4";

/// Static pod manifest path used when none is configured
pub const DEFAULT_KUBE_VIP_MANIFEST_PATH: &str = "/etc/kubernetes/manifests/kube-vip.yaml";

/// Kubeconfig of the first control plane instance, before RBAC for admin.conf exists
const BOOTSTRAP_KUBECONFIG_PATH: &str = "/etc/kubernetes/super-admin.conf";

/// Kubeconfig of control plane instances joining an initialized control plane
const KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

const KUBE_VIP_MANIFEST_TEMPLATE: &str = r#"apiVersion: v1
kind: Pod
metadata:
  name: kube-vip
  namespace: kube-system
spec:
  containers:
  - name: kube-vip
    image: {{ image }}
    imagePullPolicy: IfNotPresent
    args:
    - manager
    env:
    - name: vip_arp
      value: "true"
    - name: port
      value: "{{ port }}"
    {% if interface %}
    - name: vip_interface
      value: {{ interface }}
    {% endif %}
    - name: vip_cidr
      value: "{{ cidr }}"
    - name: cp_enable
      value: "true"
    - name: cp_namespace
      value: kube-system
    - name: vip_ddns
      value: "false"
    - name: vip_leaderelection
      value: "true"
    - name: vip_leaseduration
      value: "5"
    - name: vip_renewdeadline
      value: "3"
    - name: vip_retryperiod
      value: "1"
    - name: address
      value: "{{ address }}"
    securityContext:
      capabilities:
        add:
        - NET_ADMIN
        - NET_RAW
    volumeMounts:
    - mountPath: /etc/kubernetes/admin.conf
      name: kubeconfig
  hostAliases:
  - hostnames:
    - kubernetes
    ip: 127.0.0.1
  hostNetwork: true
  volumes:
  - hostPath:
      path: {{ kubeconfig_path }}
    name: kubeconfig
"#;

#[derive(Serialize)]
struct ManifestContext<'a> {
    image: &'a str,
    interface: &'a str,
    address: &'a str,
    cidr: u8,
    port: u16,
    kubeconfig_path: &'a str,
}

/// Virtual IP announced by kube-vip from the control plane instances
///
/// Nothing is provisioned on the host; the VIP must be reachable on the
/// instances' network.
pub struct KubeVipManager {
    identity: ClusterIdentity,
    address: String,
    spec: LoadBalancerKubeVip,
}

impl KubeVipManager {
    /// Manager announcing `address` as the control plane endpoint
    pub fn new(identity: ClusterIdentity, address: impl Into<String>, spec: &LoadBalancerKubeVip) -> Self {
        Self {
            identity,
            address: address.into(),
            spec: spec.clone(),
        }
    }

    fn render_manifest(&self, control_plane_initialized: bool) -> Result<String> {
        let ip: IpAddr = self.address.parse().map_err(|_| {
            Error::validation_for_field(
                "controlPlaneEndpoint.host",
                format!("kube-vip requires an IP address, got {:?}", self.address),
            )
        })?;

        let kubeconfig_path = match (self.spec.kubeconfig_path.as_str(), control_plane_initialized) {
            ("", false) => BOOTSTRAP_KUBECONFIG_PATH,
            ("", true) => KUBECONFIG_PATH,
            (path, _) => path,
        };
        let image = match self.spec.image.as_str() {
            "" => DEFAULT_KUBE_VIP_IMAGE,
            image => image,
        };

        let ctx = ManifestContext {
            image,
            interface: &self.spec.interface,
            address: &self.address,
            cidr: if ip.is_ipv6() { 128 } else { 32 },
            port: DEFAULT_API_SERVER_PORT,
            kubeconfig_path,
        };
        Ok(TemplateEngine::new().render(KUBE_VIP_MANIFEST_TEMPLATE, &ctx)?)
    }
}

#[async_trait]
impl Manager for KubeVipManager {
    fn kind(&self) -> ManagerKind {
        ManagerKind::KubeVip
    }

    async fn create(&self, _cancel: &CancellationToken) -> Result<Vec<String>> {
        debug!(cluster = %self.identity, address = %self.address, "VIP is announced by kube-vip");
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
        control_plane_initialized: bool,
    ) -> Result<BTreeMap<String, String>> {
        let path = match self.spec.manifest_path.as_str() {
            "" => DEFAULT_KUBE_VIP_MANIFEST_PATH,
            path => path,
        };
        Ok(BTreeMap::from([(
            path.to_string(),
            self.render_manifest(control_plane_initialized)?,
        )]))
    }

    async fn inspect(&self, _cancel: &CancellationToken) -> InspectReport {
        InspectReport::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(address: &str, spec: LoadBalancerKubeVip) -> KubeVipManager {
        KubeVipManager::new(ClusterIdentity::new("c1", "default"), address, &spec)
    }

    #[test]
    fn test_bootstrap_node_uses_super_admin_kubeconfig() {
        let manager = manager("10.1.0.10", LoadBalancerKubeVip::default());

        let first = manager.control_plane_instance_templates(false).expect("render");
        let manifest = &first[DEFAULT_KUBE_VIP_MANIFEST_PATH];
        assert!(manifest.contains("path: /etc/kubernetes/super-admin.conf\n"));
        assert!(manifest.contains("image: ghcr.io/kube-vip/kube-vip:v0.6.4\n"));
        assert!(manifest.contains("value: \"10.1.0.10\"\n"));
        assert!(manifest.contains("value: \"32\"\n"));
        assert!(!manifest.contains("vip_interface"));

        let joined = manager.control_plane_instance_templates(true).expect("render");
        assert!(joined[DEFAULT_KUBE_VIP_MANIFEST_PATH].contains("path: /etc/kubernetes/admin.conf\n"));
    }

    #[test]
    fn test_overrides() {
        let manager = manager(
            "fd42::10",
            LoadBalancerKubeVip {
                image: "registry:5000/kube-vip:v1".to_string(),
                interface: "eth1".to_string(),
                kubeconfig_path: "/etc/k0s/admin.conf".to_string(),
                manifest_path: "/etc/k0s/manifests/kube-vip.yaml".to_string(),
            },
        );
        let templates = manager.control_plane_instance_templates(false).expect("render");
        let manifest = &templates["/etc/k0s/manifests/kube-vip.yaml"];
        assert!(manifest.contains("- name: vip_interface\n      value: eth1\n"));
        assert!(manifest.contains("path: /etc/k0s/admin.conf\n"));
        assert!(manifest.contains("image: registry:5000/kube-vip:v1\n"));
        assert!(manifest.contains("value: \"128\"\n"));
    }

    #[test]
    fn test_vip_must_be_an_address() {
        let err = manager("cp.example.com", LoadBalancerKubeVip::default())
            .control_plane_instance_templates(false)
            .expect_err("hostname");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_lifecycle_is_static() {
        let manager = manager("10.1.0.10", LoadBalancerKubeVip::default());
        let cancel = CancellationToken::new();
        assert_eq!(manager.create(&cancel).await.expect("create"), vec!["10.1.0.10"]);
        manager.reconfigure(&cancel).await.expect("reconfigure");
        manager.delete(&cancel).await.expect("delete");
        assert!(manager.inspect(&cancel).await.is_empty());
    }
}
