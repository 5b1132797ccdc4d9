//! Connection credentials and operation deadlines
//!
//! `Configuration` is the credential input of the engine. It can be built
//! directly, decoded from key/value secret data, or loaded from the local
//! `incus` / `lxc` CLI configuration. `Timeouts` holds the per-category
//! deadlines of the lifecycle engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use lattice_common::{Error, Result};

/// Secret data key for the server URL
pub const SECRET_SERVER: &str = "server";
/// Secret data key for the project
pub const SECRET_PROJECT: &str = "project";
/// Secret data key for the client certificate
pub const SECRET_CLIENT_CRT: &str = "client-crt";
/// Secret data key for the client key
pub const SECRET_CLIENT_KEY: &str = "client-key";
/// Secret data key for the pinned server certificate
pub const SECRET_SERVER_CRT: &str = "server-crt";
/// Secret data key for the insecure-skip-verify flag
pub const SECRET_INSECURE_SKIP_VERIFY: &str = "insecure-skip-verify";

/// Well-known local unix socket paths, in detection order
const DEFAULT_UNIX_SOCKET_PATHS: &[&str] = &[
    "/var/lib/incus/unix.socket",
    "/run/incus/unix.socket",
    "/var/snap/lxd/common/lxd/unix.socket",
    "/run-unix.socket",
];

/// Well-known CLI config files, relative to `$HOME`
const DEFAULT_CONFIG_FILES: &[&str] = &[
    ".config/incus/config.yml",
    "snap/lxd/common/config/config.yml",
];

/// Credentials for connecting to an Incus or LXD server
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Configuration {
    /// Server URL, either `https://` or `unix://` (an empty socket path auto-detects)
    #[serde(rename = "server", default)]
    pub server_url: String,
    /// Client certificate PEM, only used for `https://`
    #[serde(default)]
    pub client_crt: String,
    /// Client key PEM, only used for `https://`
    #[serde(default)]
    pub client_key: String,
    /// Pinned server certificate PEM
    #[serde(default)]
    pub server_crt: String,
    /// Skip server certificate verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// Project name, empty for the default project
    #[serde(default)]
    pub project: String,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("server_url", &self.server_url)
            .field("client_crt", &redacted(&self.client_crt))
            .field("client_key", &redacted(&self.client_key))
            .field("server_crt", &redacted(&self.server_crt))
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("project", &self.project)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl Configuration {
    /// Decode credentials from key/value secret data
    ///
    /// Missing keys read as empty; an unparsable `insecure-skip-verify`
    /// reads as `false`.
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Self {
        let get = |key: &str| {
            data.get(key)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default()
        };
        Self {
            server_url: get(SECRET_SERVER),
            project: get(SECRET_PROJECT),
            client_crt: get(SECRET_CLIENT_CRT),
            client_key: get(SECRET_CLIENT_KEY),
            server_crt: get(SECRET_SERVER_CRT),
            insecure_skip_verify: get(SECRET_INSECURE_SKIP_VERIFY)
                .trim()
                .parse()
                .unwrap_or(false),
        }
    }

    /// Encode credentials as key/value secret data
    pub fn to_secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            (SECRET_SERVER.to_string(), self.server_url.clone().into_bytes()),
            (SECRET_PROJECT.to_string(), self.project.clone().into_bytes()),
            (SECRET_CLIENT_CRT.to_string(), self.client_crt.clone().into_bytes()),
            (SECRET_CLIENT_KEY.to_string(), self.client_key.clone().into_bytes()),
            (SECRET_SERVER_CRT.to_string(), self.server_crt.clone().into_bytes()),
            (
                SECRET_INSECURE_SKIP_VERIFY.to_string(),
                self.insecure_skip_verify.to_string().into_bytes(),
            ),
        ])
    }

    /// Load credentials from the local CLI configuration
    ///
    /// Tries `config_file`, or the well-known locations when it is `None`.
    /// `remote` overrides the config's default remote. Local (`unix://`)
    /// remotes need no certificates. Returns the configuration and the path
    /// of the file it was loaded from; when every candidate fails, the
    /// reasons are joined into a single validation error.
    pub fn from_local(
        config_file: Option<&Path>,
        remote: Option<&str>,
        require_https: bool,
    ) -> Result<(Self, PathBuf)> {
        let candidates = match config_file {
            Some(path) => vec![path.to_path_buf()],
            None => default_config_files(),
        };
        if candidates.is_empty() {
            return Err(Error::validation(
                "no local client configuration found in well-known locations",
            ));
        }

        let mut errors = Vec::new();
        for path in candidates {
            match load_remote(&path, remote, require_https) {
                Ok(config) => {
                    debug!(path = %path.display(), server = %config.server_url, "Loaded local client configuration");
                    return Ok((config, path));
                }
                Err(e) => errors.push(format!(
                    "failed to load credentials from {:?}: {}",
                    path.display().to_string(),
                    e
                )),
            }
        }
        Err(Error::validation(errors.join("; ")))
    }
}

/// Local CLI `config.yml`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CliConfig {
    #[serde(default)]
    default_remote: String,
    #[serde(default)]
    remotes: BTreeMap<String, CliRemote>,
}

#[derive(Debug, Default, Deserialize)]
struct CliRemote {
    #[serde(default)]
    addr: String,
    #[serde(default)]
    project: String,
}

fn default_config_files() -> Vec<PathBuf> {
    let Some(home) = std::env::var_os("HOME") else {
        return Vec::new();
    };
    let home = PathBuf::from(home);
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|rel| home.join(rel))
        .filter(|path| path.exists())
        .collect()
}

fn read_to_string(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::validation(format!("cannot read {} {:?}: {}", what, path, e)))
}

fn load_remote(path: &Path, remote: Option<&str>, require_https: bool) -> Result<Configuration> {
    let raw = read_to_string(path, "config file")?;
    let config: CliConfig = serde_yaml::from_str(&raw)
        .map_err(|e| Error::serialization_for_kind("config.yml", e.to_string()))?;

    let remote_name = remote
        .filter(|r| !r.is_empty())
        .unwrap_or(&config.default_remote);
    let entry = config
        .remotes
        .get(remote_name)
        .ok_or_else(|| Error::validation(format!("remote {:?} not found", remote_name)))?;

    if require_https && !entry.addr.starts_with("https://") {
        return Err(Error::validation(format!(
            "remote address {:?} must use HTTPS",
            entry.addr
        )));
    }

    if entry.addr.starts_with("unix://") || entry.addr.starts_with("http://") {
        return Ok(Configuration {
            server_url: entry.addr.clone(),
            project: entry.project.clone(),
            ..Default::default()
        });
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let client_crt_path = dir.join("client.crt");
    let client_key_path = dir.join("client.key");
    if !client_crt_path.exists() || !client_key_path.exists() {
        return Err(Error::validation("no client certificate"));
    }

    Ok(Configuration {
        server_url: entry.addr.clone(),
        server_crt: read_to_string(
            &dir.join("servercerts").join(format!("{}.crt", remote_name)),
            "server certificate",
        )?,
        client_crt: read_to_string(&client_crt_path, "client certificate")?,
        client_key: read_to_string(&client_key_path, "client key")?,
        project: entry.project.clone(),
        insecure_skip_verify: false,
    })
}

/// Find the first existing, writable local unix socket
pub fn find_default_unix_socket() -> Result<PathBuf> {
    find_unix_socket_in(DEFAULT_UNIX_SOCKET_PATHS)
}

fn find_unix_socket_in(paths: &[&str]) -> Result<PathBuf> {
    let mut errors = Vec::new();
    for path in paths {
        match std::fs::metadata(path) {
            Err(e) => errors.push(format!("failed to stat {:?}: {}", path, e)),
            Ok(meta) if meta.permissions().readonly() => {
                errors.push(format!("{:?} is not writable", path))
            }
            Ok(_) => return Ok(PathBuf::from(path)),
        }
    }
    Err(Error::validation(format!(
        "failed to detect default local unix socket path: {}",
        errors.join("; ")
    )))
}

/// Default deadline for creating an instance
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(300);
/// Default deadline for starting an instance and discovering its address
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(180);
/// Default deadline for stopping an instance
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(120);
/// Default deadline for deleting an instance
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(180);
/// Default deadline for one load balancer reconfiguration
pub const DEFAULT_RECONFIGURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-category deadlines of the lifecycle engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline of `launch_instance`
    pub create: Duration,
    /// Deadline of `start_instance` and `await_address`
    pub start: Duration,
    /// Deadline of `stop_instance`
    pub stop: Duration,
    /// Deadline of `delete_instance`
    pub delete: Duration,
    /// Deadline of one load balancer `reconfigure`
    pub reconfigure: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            create: DEFAULT_CREATE_TIMEOUT,
            start: DEFAULT_START_TIMEOUT,
            stop: DEFAULT_STOP_TIMEOUT,
            delete: DEFAULT_DELETE_TIMEOUT,
            reconfigure: DEFAULT_RECONFIGURE_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Defaults, overridden by `LATTICE_LXC_<CATEGORY>_TIMEOUT_SECS`
    ///
    /// Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |category: &str, default: Duration| {
            let key = format!("LATTICE_LXC_{}_TIMEOUT_SECS", category);
            lookup(&key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let defaults = Self::default();
        Self {
            create: read("CREATE", defaults.create),
            start: read("START", defaults.start),
            stop: read("STOP", defaults.stop),
            delete: read("DELETE", defaults.delete),
            reconfigure: read("RECONFIGURE", defaults.reconfigure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "lattice-lxc-config-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(dir.join("servercerts")).expect("temp dir should be created");
        dir
    }

    #[test]
    fn test_secret_data_round_trip() {
        let config = Configuration {
            server_url: "https://10.0.0.49:8443".to_string(),
            client_crt: "CRT".to_string(),
            client_key: "KEY".to_string(),
            server_crt: "SERVER".to_string(),
            insecure_skip_verify: true,
            project: "default".to_string(),
        };
        let data = config.to_secret_data();
        assert_eq!(data[SECRET_INSECURE_SKIP_VERIFY], b"true");
        assert_eq!(Configuration::from_secret_data(&data), config);
    }

    #[test]
    fn test_secret_data_invalid_bool_reads_false() {
        let data = BTreeMap::from([
            (SECRET_SERVER.to_string(), b"unix://".to_vec()),
            (SECRET_INSECURE_SKIP_VERIFY.to_string(), b"maybe".to_vec()),
        ]);
        let config = Configuration::from_secret_data(&data);
        assert_eq!(config.server_url, "unix://");
        assert!(!config.insecure_skip_verify);
        assert!(config.project.is_empty());
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config = Configuration {
            client_key: "very-secret".to_string(),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_from_local_https_remote() {
        let dir = temp_dir("https");
        std::fs::write(
            dir.join("config.yml"),
            "default-remote: prod\nremotes:\n  prod:\n    addr: https://10.0.0.2:8443\n    project: capi\n",
        )
        .expect("write config");
        std::fs::write(dir.join("servercerts/prod.crt"), "SERVER").expect("write server crt");
        std::fs::write(dir.join("client.crt"), "CRT").expect("write client crt");
        std::fs::write(dir.join("client.key"), "KEY").expect("write client key");

        let (config, path) = Configuration::from_local(Some(&dir.join("config.yml")), None, true)
            .expect("https remote should load");
        assert_eq!(path, dir.join("config.yml"));
        assert_eq!(config.server_url, "https://10.0.0.2:8443");
        assert_eq!(config.project, "capi");
        assert_eq!(config.server_crt, "SERVER");
        assert_eq!(config.client_crt, "CRT");
        assert_eq!(config.client_key, "KEY");
    }

    #[test]
    fn test_from_local_unix_remote_needs_no_certificates() {
        let dir = temp_dir("unix");
        std::fs::write(
            dir.join("config.yml"),
            "default-remote: local\nremotes:\n  local:\n    addr: unix://\n",
        )
        .expect("write config");

        let (config, _) = Configuration::from_local(Some(&dir.join("config.yml")), None, false)
            .expect("unix remote should load");
        assert_eq!(config.server_url, "unix://");

        let err = Configuration::from_local(Some(&dir.join("config.yml")), None, true)
            .expect_err("unix remote must be rejected when HTTPS is required");
        assert!(err.to_string().contains("must use HTTPS"));
    }

    #[test]
    fn test_from_local_missing_remote() {
        let dir = temp_dir("missing");
        std::fs::write(dir.join("config.yml"), "default-remote: local\nremotes: {}\n")
            .expect("write config");

        let err = Configuration::from_local(Some(&dir.join("config.yml")), Some("other"), false)
            .expect_err("unknown remote should fail");
        assert!(err.is_terminal());
        assert!(err.to_string().contains("\"other\" not found"));
    }

    #[test]
    fn test_find_unix_socket_reports_every_candidate() {
        let err = find_unix_socket_in(&["/nonexistent/a.socket", "/nonexistent/b.socket"])
            .expect_err("no candidate exists");
        let msg = err.to_string();
        assert!(msg.contains("a.socket"));
        assert!(msg.contains("b.socket"));
    }

    #[test]
    fn test_timeouts_from_env_overrides() {
        let timeouts = Timeouts::from_lookup(|key| match key {
            "LATTICE_LXC_CREATE_TIMEOUT_SECS" => Some("600".to_string()),
            "LATTICE_LXC_STOP_TIMEOUT_SECS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(timeouts.create, Duration::from_secs(600));
        assert_eq!(timeouts.stop, DEFAULT_STOP_TIMEOUT);
        assert_eq!(timeouts.reconfigure, DEFAULT_RECONFIGURE_TIMEOUT);
    }

    #[test]
    fn test_reconfigure_is_the_shortest_deadline() {
        let t = Timeouts::default();
        assert!(t.reconfigure < t.stop);
        assert!(t.stop < t.start);
        assert!(t.start < t.create);
    }
}
