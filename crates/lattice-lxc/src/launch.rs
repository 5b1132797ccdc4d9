//! Launch specification
//!
//! A [`LaunchSpec`] accumulates the desired shape of an instance. Builder
//! calls consume and return the spec, so a base spec can be cloned and
//! extended per instance without aliasing. Map-typed fields merge with
//! last-write-wins on colliding keys; profiles and file actions append.
//!
//! [`LaunchSpec::complete`] validates the spec against the instance kind,
//! resolves the image and produces the immutable [`CompletedLaunchSpec`] used
//! for the create request.

use std::collections::BTreeMap;
use std::fmt;

use memchr::memmem;
use serde::{Deserialize, Serialize};

use lattice_common::{Error, Result};

use crate::api::{FileType, InstanceFileArgs, InstancesPost, WriteMode};
use crate::client::ServerName;
use crate::image::{Image, ImageFamily};

/// Device name of the bind-mounted server socket
pub const UNIX_SOCKET_DEVICE: &str = "00-unix-socket";
/// Path of the server socket inside the instance
pub const UNIX_SOCKET_INSTANCE_PATH: &str = "/run-unix.socket";

/// Host path of the server socket for a server implementation
pub fn default_unix_socket_path(server: ServerName) -> Result<&'static str> {
    match server {
        ServerName::Incus => Ok("/var/lib/incus/unix.socket"),
        ServerName::Lxd => Ok("/var/snap/lxd/common/lxd/unix.socket"),
        ServerName::Unknown => Err(Error::unsupported(format!(
            "unknown default unix socket path for server {:?}",
            server.as_str()
        ))),
    }
}

/// Container or virtual machine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    /// System or application container
    #[default]
    Container,
    /// Virtual machine
    VirtualMachine,
}

impl InstanceKind {
    /// Wire value of the instance type
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Container => "container",
            InstanceKind::VirtualMachine => "virtual-machine",
        }
    }
}

/// A file operation performed right after the instance is created
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileAction {
    /// Create or overwrite a file
    CreateFile {
        /// Path inside the instance
        path: String,
        /// File content
        contents: String,
    },
    /// Append text to a file
    AppendToFile {
        /// Path inside the instance
        path: String,
        /// Text to append
        contents: String,
    },
    /// Create a symlink
    Symlink {
        /// Path of the link inside the instance
        path: String,
        /// Link target
        target: String,
    },
    /// Create a directory
    Directory {
        /// Path inside the instance
        path: String,
    },
}

impl FileAction {
    /// Path inside the instance
    pub fn path(&self) -> &str {
        match self {
            FileAction::CreateFile { path, .. }
            | FileAction::AppendToFile { path, .. }
            | FileAction::Symlink { path, .. }
            | FileAction::Directory { path } => path,
        }
    }

    /// Upload arguments for the file API
    pub fn args(&self) -> InstanceFileArgs {
        match self {
            FileAction::CreateFile { contents, .. } => InstanceFileArgs {
                content: contents.clone().into_bytes(),
                mode: 0o644,
                ..Default::default()
            },
            FileAction::AppendToFile { contents, .. } => InstanceFileArgs {
                content: contents.clone().into_bytes(),
                mode: 0o644,
                write_mode: WriteMode::Append,
                ..Default::default()
            },
            FileAction::Symlink { target, .. } => InstanceFileArgs {
                content: target.clone().into_bytes(),
                mode: 0o777,
                file_type: FileType::Symlink,
                ..Default::default()
            },
            FileAction::Directory { .. } => InstanceFileArgs {
                mode: 0o755,
                file_type: FileType::Directory,
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileAction::CreateFile { path, .. } => write!(f, "create file {}", path),
            FileAction::AppendToFile { path, .. } => write!(f, "append to file {}", path),
            FileAction::Symlink { path, target } => {
                write!(f, "create symlink {} -> {}", path, target)
            }
            FileAction::Directory { path } => write!(f, "create directory {}", path),
        }
    }
}

/// Files provisioned between create and the first start
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceFiles {
    /// Create-time templates by path
    pub instance_templates: BTreeMap<String, String>,
    /// File actions in registration order
    pub file_actions: Vec<FileAction>,
    /// Text replacements by path
    pub replacements: BTreeMap<String, BTreeMap<String, String>>,
}

/// Desired shape of an instance, not yet created
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    instance_templates: BTreeMap<String, String>,
    file_actions: Vec<FileAction>,
    replacements: BTreeMap<String, BTreeMap<String, String>>,
    devices: BTreeMap<String, BTreeMap<String, String>>,
    config: BTreeMap<String, String>,
    profiles: Vec<String>,
    image: Option<ImageFamily>,
    flavor: String,
    instance_kind: InstanceKind,
    unix_socket: bool,
}

impl LaunchSpec {
    /// Empty spec
    pub fn new() -> Self {
        Self::default()
    }

    /// Files rendered by the server's template engine when the instance is
    /// created, keyed by path. Supported by every instance kind.
    pub fn with_instance_templates<I, K, V>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.instance_templates
            .extend(templates.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Files written after the instance is created. Containers only.
    pub fn with_create_files<I, K, V>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.file_actions
            .extend(files.into_iter().map(|(path, contents)| FileAction::CreateFile {
                path: path.into(),
                contents: contents.into(),
            }));
        self
    }

    /// Text appended to existing files after the instance is created. Containers only.
    pub fn with_append_to_files<I, K, V>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.file_actions
            .extend(files.into_iter().map(|(path, contents)| FileAction::AppendToFile {
                path: path.into(),
                contents: contents.into(),
            }));
        self
    }

    /// Symlinks (path to target) created after the instance is created. Containers only.
    pub fn with_symlinks<I, K, V>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.file_actions
            .extend(links.into_iter().map(|(path, target)| FileAction::Symlink {
                path: path.into(),
                target: target.into(),
            }));
        self
    }

    /// Directories created after the instance is created. Containers only.
    pub fn with_directories<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.file_actions
            .extend(paths.into_iter().map(|path| FileAction::Directory { path: path.into() }));
        self
    }

    /// In-place text replacements (path to old-to-new map). The rules must
    /// be idempotent. Containers only.
    pub fn with_replacements<I, K>(mut self, replacements: I) -> Self
    where
        I: IntoIterator<Item = (K, BTreeMap<String, String>)>,
        K: Into<String>,
    {
        self.replacements
            .extend(replacements.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Instance devices
    pub fn with_devices<I, K>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = (K, BTreeMap<String, String>)>,
        K: Into<String>,
    {
        self.devices
            .extend(devices.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// Instance config
    pub fn with_config<I, K, V>(mut self, config: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.config
            .extend(config.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Instance profiles, appended in order
    pub fn with_profiles<I, P>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.profiles.extend(profiles.into_iter().map(Into::into));
        self
    }

    /// Instance image
    ///
    /// No-op for a literal image with neither alias nor fingerprint, so an
    /// unset user override keeps the default image.
    pub fn with_image(mut self, image: impl Into<ImageFamily>) -> Self {
        let image = image.into();
        if !matches!(&image, ImageFamily::Literal(i) if i.is_empty()) {
            self.image = Some(image);
        }
        self
    }

    /// Size flavor (e.g. "c2-m4", "t3.micro")
    pub fn with_flavor(mut self, flavor: impl Into<String>) -> Self {
        self.flavor = flavor.into();
        self
    }

    /// Container or virtual machine
    pub fn with_instance_kind(mut self, kind: InstanceKind) -> Self {
        self.instance_kind = kind;
        self
    }

    /// Bind-mount the server's control socket at `/run-unix.socket`. Containers only.
    pub fn with_unix_socket(mut self, enabled: bool) -> Self {
        self.unix_socket = enabled;
        self
    }

    /// Requested instance kind
    pub fn instance_kind(&self) -> InstanceKind {
        self.instance_kind
    }

    /// Validate, resolve the image and freeze the spec
    ///
    /// Fails with a terminal error when the instance kind does not support a
    /// requested feature, when no image is set, or when the server socket
    /// path is unknown for this server.
    pub fn complete(self, server: ServerName) -> Result<CompletedLaunchSpec> {
        if self.instance_kind == InstanceKind::VirtualMachine {
            if self.unix_socket {
                return Err(Error::validation(
                    "mounting unix socket not supported for virtual-machine instances",
                ));
            }
            if !self.file_actions.is_empty() {
                let ops: Vec<String> = self.file_actions.iter().map(|a| a.to_string()).collect();
                return Err(Error::validation(format!(
                    "operations not supported for virtual-machine instances: {:?}",
                    ops
                )));
            }
            if !self.replacements.is_empty() {
                let paths: Vec<&String> = self.replacements.keys().collect();
                return Err(Error::validation(format!(
                    "replacements not supported for virtual-machine instances: {:?}",
                    paths
                )));
            }
        }

        let family = self
            .image
            .as_ref()
            .ok_or_else(|| Error::validation("cannot launch instance without image"))?;
        let image = family.resolve(server)?.without_redundant_tag();

        let mut devices = self.devices;
        if self.unix_socket {
            let source = default_unix_socket_path(server)?;
            devices.insert(
                UNIX_SOCKET_DEVICE.to_string(),
                BTreeMap::from([
                    ("type".to_string(), "disk".to_string()),
                    ("source".to_string(), source.to_string()),
                    ("path".to_string(), UNIX_SOCKET_INSTANCE_PATH.to_string()),
                    ("shift".to_string(), "true".to_string()),
                ]),
            );
        }

        Ok(CompletedLaunchSpec {
            image,
            instance_kind: self.instance_kind,
            flavor: self.flavor,
            config: self.config,
            devices,
            profiles: self.profiles,
            files: InstanceFiles {
                instance_templates: self.instance_templates,
                file_actions: self.file_actions,
                replacements: self.replacements,
            },
        })
    }

    /// File provisioning part of the spec, without validating it
    pub fn into_files(self) -> InstanceFiles {
        InstanceFiles {
            instance_templates: self.instance_templates,
            file_actions: self.file_actions,
            replacements: self.replacements,
        }
    }
}

/// A validated spec with a resolved image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedLaunchSpec {
    /// Resolved image
    pub image: Image,
    /// Container or virtual machine
    pub instance_kind: InstanceKind,
    /// Size flavor
    pub flavor: String,
    /// Instance config
    pub config: BTreeMap<String, String>,
    /// Instance devices
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    /// Instance profiles
    pub profiles: Vec<String>,
    /// Files provisioned after create
    pub files: InstanceFiles,
}

impl CompletedLaunchSpec {
    /// Create request for an instance with the given name
    pub fn to_request(&self, name: &str) -> InstancesPost {
        InstancesPost {
            name: name.to_string(),
            source: self.image.instance_source(),
            instance_kind: self.instance_kind.as_str().to_string(),
            instance_type: self.flavor.clone(),
            config: self.config.clone(),
            devices: self.devices.clone(),
            profiles: self.profiles.clone(),
        }
    }
}

/// Apply replacement rules to raw file content
///
/// Matching is done on bytes, so content that is not UTF-8 passes through
/// untouched. Empty patterns are ignored. Returns `None` when the content
/// already reflects every rule.
pub fn apply_replacements(contents: &[u8], rules: &BTreeMap<String, String>) -> Option<Vec<u8>> {
    let replaced = rules
        .iter()
        .filter(|(old, _)| !old.is_empty())
        .fold(contents.to_vec(), |acc, (old, new)| {
            replace_all(&acc, old.as_bytes(), new.as_bytes())
        });
    (replaced != contents).then_some(replaced)
}

fn replace_all(haystack: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut last = 0;
    for start in memmem::find_iter(haystack, old) {
        out.extend_from_slice(&haystack[last..start]);
        out.extend_from_slice(new);
        last = start + old.len();
    }
    out.extend_from_slice(&haystack[last..]);
    out
}
