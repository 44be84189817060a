//! Configuration descriptors and their finalised specs
//!
//! Descriptors mirror the TOML file. `finalize` fills defaults and
//! validates, producing the specs endpoints and services are built from.
//! Logging settings can be overridden by environment variables (TUBES_*).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TubesError};
use crate::hostkey::{default_known_hosts, HostKeyPolicy};
use crate::reconnect::ReconnectPolicy;
use crate::stream::HostPort;

/// Environment variable prefix
const ENV_PREFIX: &str = "TUBES";

const DEFAULT_BIND: &str = "127.0.0.1";
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_HTTP_BRIDGE_PORT: u16 = 3128;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

fn expand_path(path: &str) -> Result<PathBuf> {
    shellexpand::full(path)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| TubesError::config(format!("Cannot expand path {}: {}", path, e)))
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TubesConfig {
    pub log: LogConfig,
    pub ssh: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = TubesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(TubesError::config(format!("Unknown log format: {}", other))),
        }
    }
}

/// One `[[ssh]]` block
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub connect_on_start: bool,
    #[serde(default)]
    pub auth: Vec<AuthConfig>,
    #[serde(default)]
    pub host_key: HostKeyConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
    #[serde(default)]
    pub socks5: Vec<Socks5Config>,
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Agent,
    Key {
        path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    Password {
        password: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostKeyConfig {
    pub policy: HostKeyPolicyKind,
    pub fingerprint: Option<String>,
    pub known_hosts: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicyKind {
    #[default]
    AcceptNew,
    Strict,
    Fingerprint,
    Insecure,
}

/// One `[[ssh.tunnels]]` block
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub local_bind: Option<String>,
    #[serde(alias = "port")]
    pub local_port: u16,
    #[serde(default)]
    pub remote_bind: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub disabled: bool,
}

/// One `[[ssh.socks5]]` block
#[derive(Debug, Clone, Deserialize)]
pub struct Socks5Config {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub local_bind: Option<String>,
    #[serde(alias = "port")]
    pub local_port: u16,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub resolve_locally: bool,
    #[serde(default)]
    pub http_bridge: Option<HttpBridgeSetting>,
}

/// `http_bridge = 8888`, `"host:port"`, `"8888"` or `true`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HttpBridgeSetting {
    Enabled(bool),
    Port(u16),
    Address(String),
}

impl HttpBridgeSetting {
    /// Resolve to a bind address, or `None` when switched off
    pub fn address(&self) -> Result<Option<String>> {
        match self {
            Self::Enabled(false) => Ok(None),
            Self::Enabled(true) => Ok(Some(format!("{}:{}", DEFAULT_BIND, DEFAULT_HTTP_BRIDGE_PORT))),
            Self::Port(port) => Ok(Some(format!("{}:{}", DEFAULT_BIND, port))),
            Self::Address(addr) => {
                let addr = addr.trim();
                if let Ok(port) = addr.parse::<u16>() {
                    return Ok(Some(format!("{}:{}", DEFAULT_BIND, port)));
                }
                match HostPort::parse(addr) {
                    Some(hp) => Ok(Some(hp.to_string())),
                    None => Err(TubesError::config(format!(
                        "Invalid http_bridge address: {}",
                        addr
                    ))),
                }
            }
        }
    }
}

/// Authentication method, in the order it will be tried
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Agent,
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "Agent"),
            Self::Key { path, .. } => write!(f, "Key({})", path.display()),
            Self::Password(_) => write!(f, "Password(***)"),
        }
    }
}

/// Resolved endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub name: String,
    pub user: String,
    pub hostname: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub connect_on_start: bool,
    pub auth: Vec<AuthMethod>,
    pub host_key: HostKeyPolicy,
    pub reconnect: ReconnectPolicy,
    pub tunnels: Vec<TunnelSpec>,
    pub socks5: Vec<Socks5Spec>,
}

impl EndpointSpec {
    /// A spec with defaults for everything but the address
    pub fn new(user: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        let user = user.into();
        let hostname = hostname.into();
        Self {
            name: endpoint_name(&user, &hostname, Some(port)),
            user,
            hostname,
            port,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            connect_on_start: false,
            auth: vec![AuthMethod::Agent],
            host_key: HostKeyPolicy::AcceptNew {
                known_hosts: default_known_hosts(),
            },
            reconnect: ReconnectPolicy::default(),
            tunnels: Vec::new(),
            socks5: Vec::new(),
        }
    }
}

/// Resolved tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub name: String,
    pub local_bind: String,
    pub local_port: u16,
    pub remote_bind: String,
    pub remote_port: u16,
    pub disabled: bool,
}

impl TunnelSpec {
    /// Tunnel `local_port` to the same port on the remote loopback
    pub fn new(local_port: u16) -> Self {
        TunnelConfig {
            name: None,
            local_bind: None,
            local_port,
            remote_bind: None,
            remote_port: None,
            disabled: false,
        }
        .finalize()
    }

    pub fn local(&self) -> String {
        HostPort::new(&self.local_bind, self.local_port).to_string()
    }

    pub fn remote(&self) -> HostPort {
        HostPort::new(&self.remote_bind, self.remote_port)
    }
}

/// Resolved SOCKS5 bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Spec {
    pub name: String,
    pub local_bind: String,
    pub local_port: u16,
    pub disabled: bool,
    pub resolve_locally: bool,
    /// Bind address of the HTTP bridge chained to this SOCKS5 server
    pub http_bridge: Option<String>,
}

impl Socks5Spec {
    pub fn new(local_port: u16) -> Self {
        Self {
            name: format!("SOCKS5 {}", local_port),
            local_bind: DEFAULT_BIND.to_string(),
            local_port,
            disabled: false,
            resolve_locally: false,
            http_bridge: None,
        }
    }

    pub fn local(&self) -> String {
        HostPort::new(&self.local_bind, self.local_port).to_string()
    }
}

fn endpoint_name(user: &str, hostname: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{}@{}:{}", user, hostname, port),
        None => format!("{}@{}", user, hostname),
    }
}

impl TubesConfig {
    /// `<config dir>/tubes.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tubes.toml")
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TubesError::config(e.to_string()))
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TubesError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Environment variables override the file (TUBES_LOG_LEVEL, TUBES_LOG_FORMAT)
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(level) = get_env("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(format) = get_env("LOG_FORMAT") {
            self.log.format = format.parse()?;
        }
        Ok(())
    }

    pub fn finalize(&self) -> Result<Vec<EndpointSpec>> {
        let specs = self
            .ssh
            .iter()
            .map(EndpointConfig::finalize)
            .collect::<Result<Vec<_>>>()?;

        let mut names = std::collections::HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.as_str()) {
                return Err(TubesError::config(format!(
                    "Duplicate endpoint name: {}",
                    spec.name
                )));
            }
        }
        Ok(specs)
    }
}

impl EndpointConfig {
    pub fn finalize(&self) -> Result<EndpointSpec> {
        let hostname = self.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err(TubesError::config("Endpoint hostname must not be empty"));
        }

        let user = self.user.clone().unwrap_or_else(whoami::username);
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| endpoint_name(&user, &hostname, self.port));

        let auth = if self.auth.is_empty() {
            vec![AuthMethod::Agent]
        } else {
            self.auth
                .iter()
                .map(|a| match a {
                    AuthConfig::Agent => Ok(AuthMethod::Agent),
                    AuthConfig::Key { path, passphrase } => Ok(AuthMethod::Key {
                        path: expand_path(path)?,
                        passphrase: passphrase.clone(),
                    }),
                    AuthConfig::Password { password } => Ok(AuthMethod::Password(password.clone())),
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(EndpointSpec {
            host_key: self.host_key.finalize()?,
            name,
            user,
            hostname,
            port: self.port.unwrap_or(DEFAULT_SSH_PORT),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            connect_on_start: self.connect_on_start,
            auth,
            reconnect: self.reconnect,
            tunnels: self.tunnels.iter().map(TunnelConfig::finalize).collect(),
            socks5: self
                .socks5
                .iter()
                .map(Socks5Config::finalize)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

impl HostKeyConfig {
    pub fn finalize(&self) -> Result<HostKeyPolicy> {
        let known_hosts = match &self.known_hosts {
            Some(path) => expand_path(path)?,
            None => default_known_hosts(),
        };
        Ok(match self.policy {
            HostKeyPolicyKind::AcceptNew => HostKeyPolicy::AcceptNew { known_hosts },
            HostKeyPolicyKind::Strict => HostKeyPolicy::Strict { known_hosts },
            HostKeyPolicyKind::Insecure => HostKeyPolicy::Insecure,
            HostKeyPolicyKind::Fingerprint => {
                let fingerprint = self.fingerprint.clone().ok_or_else(|| {
                    TubesError::config("host_key.policy = \"fingerprint\" requires host_key.fingerprint")
                })?;
                HostKeyPolicy::Fingerprint(fingerprint)
            }
        })
    }
}

impl TunnelConfig {
    /// Fill default bind addresses; the remote port defaults to the local one
    pub fn finalize(&self) -> TunnelSpec {
        let local_bind = self
            .local_bind
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let remote_bind = self
            .remote_bind
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let remote_port = self.remote_port.unwrap_or(self.local_port);
        let name = self.name.clone().unwrap_or_else(|| {
            format!(
                "{} -> {}",
                HostPort::new(&local_bind, self.local_port),
                HostPort::new(&remote_bind, remote_port)
            )
        });

        TunnelSpec {
            name,
            local_bind,
            local_port: self.local_port,
            remote_bind,
            remote_port,
            disabled: self.disabled,
        }
    }
}

impl Socks5Config {
    pub fn finalize(&self) -> Result<Socks5Spec> {
        let http_bridge = match &self.http_bridge {
            Some(setting) => setting.address()?,
            None => None,
        };
        Ok(Socks5Spec {
            name: self
                .name
                .clone()
                .unwrap_or_else(|| format!("SOCKS5 {}", self.local_port)),
            local_bind: self
                .local_bind
                .clone()
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
            local_port: self.local_port,
            disabled: self.disabled,
            resolve_locally: self.resolve_locally,
            http_bridge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[log]
level = "debug"

[[ssh]]
user = "me"
hostname = "bastion.example.com"
auth = [{ type = "key", path = "/keys/id_ed25519" }, { type = "password", password = "hunter2" }]
host_key = { policy = "fingerprint", fingerprint = "SHA256:abc" }
reconnect = { max_attempts = 5 }

  [[ssh.tunnels]]
  name = "web"
  port = 8080
  remote_port = 80

  [[ssh.tunnels]]
  local_port = 5432
  remote_bind = "db.internal"
  disabled = true

  [[ssh.socks5]]
  local_port = 1080
  http_bridge = 8888
"#;

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "TUBES");
    }

    #[test]
    fn test_default_config() {
        let config = TubesConfig::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, LogFormat::Text);
        assert!(config.ssh.is_empty());
        assert!(config.finalize().unwrap().is_empty());
    }

    #[test]
    fn test_sample_finalizes_with_defaults() {
        let config = TubesConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.log.level, "debug");

        let specs = config.finalize().unwrap();
        assert_eq!(specs.len(), 1);
        let ep = &specs[0];
        assert_eq!(ep.name, "me@bastion.example.com");
        assert_eq!(ep.port, 22);
        assert_eq!(ep.connect_timeout, Duration::from_secs(15));
        assert_eq!(ep.reconnect.max_attempts, 5);
        assert_eq!(ep.host_key, HostKeyPolicy::Fingerprint("SHA256:abc".into()));
        assert_eq!(
            ep.auth,
            vec![
                AuthMethod::Key {
                    path: PathBuf::from("/keys/id_ed25519"),
                    passphrase: None
                },
                AuthMethod::Password("hunter2".into()),
            ]
        );

        let web = &ep.tunnels[0];
        assert_eq!(web.name, "web");
        assert_eq!(web.local(), "127.0.0.1:8080");
        assert_eq!(web.remote(), HostPort::new("127.0.0.1", 80));
        assert!(!web.disabled);

        let db = &ep.tunnels[1];
        assert_eq!(db.remote(), HostPort::new("db.internal", 5432));
        assert_eq!(db.name, "127.0.0.1:5432 -> db.internal:5432");
        assert!(db.disabled);

        let socks = &ep.socks5[0];
        assert_eq!(socks.name, "SOCKS5 1080");
        assert_eq!(socks.local(), "127.0.0.1:1080");
        assert!(!socks.resolve_locally);
        assert_eq!(socks.http_bridge.as_deref(), Some("127.0.0.1:8888"));
    }

    #[test]
    fn test_endpoint_name_includes_explicit_port() {
        let config = TubesConfig::from_toml_str(
            "[[ssh]]\nuser = \"u\"\nhostname = \"h\"\nport = 2222\n",
        )
        .unwrap();
        let specs = config.finalize().unwrap();
        assert_eq!(specs[0].name, "u@h:2222");
        assert_eq!(specs[0].auth, vec![AuthMethod::Agent]);
    }

    #[test]
    fn test_http_bridge_forms() {
        let cases = [
            (HttpBridgeSetting::Port(9000), Some("127.0.0.1:9000")),
            (HttpBridgeSetting::Address("9001".into()), Some("127.0.0.1:9001")),
            (HttpBridgeSetting::Address("0.0.0.0:9002".into()), Some("0.0.0.0:9002")),
            (HttpBridgeSetting::Enabled(true), Some("127.0.0.1:3128")),
            (HttpBridgeSetting::Enabled(false), None),
        ];
        for (setting, expected) in cases {
            assert_eq!(setting.address().unwrap().as_deref(), expected);
        }
        assert!(HttpBridgeSetting::Address("nope".into()).address().is_err());
    }

    #[test]
    fn test_invalid_configs_are_errors() {
        assert!(TubesConfig::from_toml_str("[[ssh]]\nhostname = \"  \"\n")
            .unwrap()
            .finalize()
            .is_err());
        assert!(TubesConfig::from_toml_str("[[ssh]]\nhostname = \"h\"\nauth = [{ type = \"magic\" }]\n").is_err());
        assert!(TubesConfig::from_toml_str(
            "[[ssh]]\nhostname = \"h\"\nhost_key = { policy = \"fingerprint\" }\n"
        )
        .unwrap()
        .finalize()
        .is_err());
        assert!(TubesConfig::from_toml_str(
            "[[ssh]]\nname = \"a\"\nhostname = \"h\"\n[[ssh]]\nname = \"a\"\nhostname = \"i\"\n"
        )
        .unwrap()
        .finalize()
        .is_err());
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TubesConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
