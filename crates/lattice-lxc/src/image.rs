//! Image resolution
//!
//! An [`ImageFamily`] names what should be launched; resolving it against the
//! server implementation yields a concrete [`Image`] (protocol, server, alias
//! or fingerprint). Resolution is pure: nothing is fetched.

use std::fmt;

use serde::{Deserialize, Serialize};

use lattice_common::{Error, Result};

use crate::api::InstanceSource;
use crate::client::ServerName;

/// Simplestreams image protocol
pub const PROTOCOL_SIMPLESTREAMS: &str = "simplestreams";
/// OCI registry image protocol
pub const PROTOCOL_OCI: &str = "oci";

/// Public simplestreams server of linuxcontainers.org
pub const DEFAULT_SIMPLESTREAMS_SERVER: &str = "https://images.linuxcontainers.org";
/// Simplestreams server hosting pre-built cluster node images
pub const CAPI_IMAGES_SERVER: &str = "https://images.linuxcontainers.org/capi";
/// Docker Hub, as an OCI image server
pub const DOCKER_HUB_SERVER: &str = "https://docker.io";

/// A concrete image reference
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Image {
    /// Remote protocol, empty for images local to the server
    #[serde(default)]
    pub protocol: String,
    /// Remote server URL, empty for images local to the server
    #[serde(default)]
    pub server: String,
    /// Image alias
    #[serde(default)]
    pub alias: String,
    /// Image fingerprint
    #[serde(default)]
    pub fingerprint: String,
}

impl Image {
    /// Image from a simplestreams server
    pub fn simplestreams(server: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_SIMPLESTREAMS.to_string(),
            server: server.into(),
            alias: alias.into(),
            fingerprint: String::new(),
        }
    }

    /// Image from an OCI registry
    pub fn oci(server: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_OCI.to_string(),
            server: server.into(),
            alias: alias.into(),
            fingerprint: String::new(),
        }
    }

    /// Whether neither an alias nor a fingerprint is set
    pub fn is_empty(&self) -> bool {
        self.alias.is_empty() && self.fingerprint.is_empty()
    }

    /// Drop the tag of an OCI reference that also carries a digest
    ///
    /// `IMG[:TAG]@sha256:HASH` becomes `IMG@sha256:HASH`. A port in the
    /// registry part of the alias is kept.
    pub fn without_redundant_tag(mut self) -> Self {
        if self.protocol != PROTOCOL_OCI {
            return self;
        }
        if let Some((name, digest)) = self.alias.split_once('@') {
            let repository_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
            let name = match name[repository_start..].find(':') {
                Some(i) => &name[..repository_start + i],
                None => name,
            };
            self.alias = format!("{}@{}", name, digest);
        }
        self
    }

    /// Instance source of a create request
    pub fn instance_source(&self) -> InstanceSource {
        InstanceSource {
            source_type: "image".to_string(),
            protocol: self.protocol.clone(),
            server: self.server.clone(),
            alias: self.alias.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.alias.is_empty() {
            &self.fingerprint
        } else {
            &self.alias
        };
        if self.server.is_empty() {
            write!(f, "{}", name)
        } else {
            write!(f, "{}:{} ({})", self.server, name, self.protocol)
        }
    }
}

/// What image to launch, before resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageFamily {
    /// A concrete image, used as is
    Literal(Image),
    /// A pre-built image from the cluster node image catalog (e.g. "kubeadm/v1.33.0")
    Release(String),
    /// The kindest/node OCI image of a Kubernetes version (e.g. "v1.33.0")
    KindestNode(String),
}

impl From<Image> for ImageFamily {
    fn from(image: Image) -> Self {
        ImageFamily::Literal(image)
    }
}

impl ImageFamily {
    /// Resolve to a concrete image for the given server implementation
    pub fn resolve(&self, server: ServerName) -> Result<Image> {
        match self {
            ImageFamily::Literal(image) if image.is_empty() => {
                Err(Error::validation("image has neither an alias nor a fingerprint"))
            }
            ImageFamily::Literal(image) => Ok(image.clone()),
            ImageFamily::Release(alias) => Ok(Image::simplestreams(CAPI_IMAGES_SERVER, alias.as_str())),
            ImageFamily::KindestNode(version) => Ok(match server {
                // Only Incus can launch OCI images directly
                ServerName::Incus => {
                    Image::oci(DOCKER_HUB_SERVER, format!("kindest/node:{}", version))
                }
                _ => Image::simplestreams(CAPI_IMAGES_SERVER, format!("kindest/{}", version)),
            }),
        }
    }
}
