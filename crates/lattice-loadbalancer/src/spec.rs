//! Declarative load balancer strategy
//!
//! A [`LoadBalancerSpec`] names exactly one strategy. Field names follow the
//! cluster resource's JSON schema (`lxc`, `oci`, `ovn`, `kubeVIP`, `external`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use lattice_common::{
    Error, Result, CLUSTER_NAMESPACE_KEY, CLUSTER_NAME_KEY, CLUSTER_ROLE_KEY,
};
use lattice_lxc::Image;

/// Load balancer configuration of a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Ubuntu instance with haproxy installed from the package archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lxc: Option<LoadBalancerInstance>,
    /// OCI instance running a pre-built haproxy image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<LoadBalancerInstance>,
    /// Network load balancer on an OVN network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn: Option<LoadBalancerOvn>,
    /// kube-vip static pod on every control plane instance
    #[serde(rename = "kubeVIP", default, skip_serializing_if = "Option::is_none")]
    pub kube_vip: Option<LoadBalancerKubeVip>,
    /// Endpoint managed outside of the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<LoadBalancerExternal>,
}

/// Strategy selected by a [`LoadBalancerSpec`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagerKind {
    /// haproxy installed in a plain instance
    NativeProxy,
    /// haproxy from a pre-built OCI image
    PackagedProxy,
    /// Host network load balancer
    NetworkLoadBalancer,
    /// kube-vip static pod injection
    KubeVip,
    /// Nothing is managed
    External,
}

impl ManagerKind {
    /// Field name of the strategy
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagerKind::NativeProxy => "lxc",
            ManagerKind::PackagedProxy => "oci",
            ManagerKind::NetworkLoadBalancer => "ovn",
            ManagerKind::KubeVip => "kubeVIP",
            ManagerKind::External => "external",
        }
    }
}

impl fmt::Display for ManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LoadBalancerSpec {
    /// The selected strategy
    ///
    /// No strategy selects [`ManagerKind::External`]. More than one is a
    /// terminal validation error.
    pub fn kind(&self) -> Result<ManagerKind> {
        let set: Vec<ManagerKind> = [
            (self.lxc.is_some(), ManagerKind::NativeProxy),
            (self.oci.is_some(), ManagerKind::PackagedProxy),
            (self.ovn.is_some(), ManagerKind::NetworkLoadBalancer),
            (self.kube_vip.is_some(), ManagerKind::KubeVip),
            (self.external.is_some(), ManagerKind::External),
        ]
        .into_iter()
        .filter_map(|(is_set, kind)| is_set.then_some(kind))
        .collect();

        match set.as_slice() {
            [] => Ok(ManagerKind::External),
            [kind] => Ok(*kind),
            kinds => Err(Error::validation_for_field(
                "loadBalancer",
                format!(
                    "exactly one load balancer type must be set, found {}",
                    kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
                ),
            )),
        }
    }
}

/// Proxy instance strategy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerInstance {
    /// Load balancer instance configuration
    #[serde(default)]
    pub instance_spec: LoadBalancerMachineSpec,
    /// Replacement for the built-in haproxy.cfg template
    #[serde(
        rename = "customHAProxyConfigTemplate",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub custom_haproxy_config_template: String,
}

/// Configuration of the load balancer instance
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerMachineSpec {
    /// Instance size (e.g. "t3.micro", "c2-m4")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flavor: String,
    /// Profiles attached to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    /// Image override; the strategy's default image is used when unset
    #[serde(default)]
    pub image: MachineImageSource,
    /// Cluster member (`name`) or cluster group (`@name`) to place the instance on
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
}

/// Image reference as written in the cluster resource
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineImageSource {
    /// Image alias
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Image fingerprint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    /// Remote server URL
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// Remote protocol ("simplestreams" or "oci")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl MachineImageSource {
    /// Concrete image reference
    pub fn to_image(&self) -> Image {
        Image {
            protocol: self.protocol.clone(),
            server: self.server.clone(),
            alias: self.name.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Network load balancer strategy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerOvn {
    /// Network to create the load balancer on
    #[serde(default)]
    pub network_name: String,
}

/// External strategy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerExternal {}

/// kube-vip strategy
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerKubeVip {
    /// kube-vip image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Interface to configure the VIP on; the default interface when unset
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interface: String,
    /// Host kubeconfig used by kube-vip
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubeconfig_path: String,
    /// Host path of the static pod manifest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub manifest_path: String,
}

/// Name and namespace of the cluster owning a load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ClusterIdentity {
    /// Cluster name
    pub name: String,
    /// Cluster namespace
    pub namespace: String,
}

impl ClusterIdentity {
    /// New identity
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Name of the load balancer instance
    ///
    /// `<cluster>-<first 5 hex chars of sha256(namespace)>-lb`, which keeps
    /// names of equally named clusters in different namespaces apart while
    /// staying within the 63 character instance name limit.
    pub fn load_balancer_instance_name(&self) -> String {
        use aws_lc_rs::digest;
        let hash = digest::digest(&digest::SHA256, self.namespace.as_bytes());
        let hex: String = hash.as_ref()[..3]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        format!("{}-{}-lb", self.name, &hex[..5])
    }

    /// Name and namespace labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CLUSTER_NAME_KEY.to_string(), self.name.clone()),
            (CLUSTER_NAMESPACE_KEY.to_string(), self.namespace.clone()),
        ])
    }

    /// Name, namespace and role labels
    pub fn labels_with_role(&self, role: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert(CLUSTER_ROLE_KEY.to_string(), role.to_string());
        labels
    }

    /// Whether `config` carries this cluster's name and namespace labels
    pub fn owns(&self, config: &BTreeMap<String, String>) -> bool {
        config.get(CLUSTER_NAME_KEY) == Some(&self.name)
            && config.get(CLUSTER_NAMESPACE_KEY) == Some(&self.namespace)
    }
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
