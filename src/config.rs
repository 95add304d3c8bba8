//! Process configuration.
//!
//! Both binaries build one [`Config`] at startup, either from `PIPETUN_*`
//! environment variables or from a TOML file, and hand it around as an
//! `Arc<Config>`. Nothing reads configuration from global state after that.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layer::{READ_BUFFER_SIZE, STREAM_KEY_SIZE};
use crate::DEFAULT_MAX_FRAME_LEN;

/// Prefix shared by every recognized environment variable.
pub const ENV_PREFIX: &str = "PIPETUN_";

/// Smallest frame cap: one full socket read tagged with its stream key.
///
/// Endpoint reads are forwarded as single frames, so a smaller cap would
/// make peers reject each other's ordinary traffic.
pub const MIN_FRAME_LEN: usize = READ_BUFFER_SIZE + STREAM_KEY_SIZE;

/// Runtime configuration shared by client and server.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// Local SOCKS5 listen host (client)
    pub client_host: String,
    /// Local SOCKS5 listen port (client)
    pub client_port: u16,
    /// Number of pooled physical connections (client)
    pub client_connection: usize,
    /// Tunnel server host
    pub server_host: String,
    /// Tunnel server port
    pub server_port: u16,
    /// Listen backlog for both listeners
    pub backlog: u32,
    /// Shared user name
    pub username: String,
    /// Shared password
    pub password: String,
    /// Idle timeout for physical and logical connections
    pub timeout: Duration,
    /// Largest accepted frame payload
    pub max_frame_len: usize,
}

impl Config {
    /// Load from the process environment and then remove the variables.
    ///
    /// Call this before any other thread is started: removing variables
    /// races with concurrent reads of the environment.
    pub fn from_env() -> Result<Self> {
        let vars: Vec<(String, String)> = std::env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect();

        let config = Self::from_vars(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        for (key, _) in &vars {
            std::env::remove_var(key);
        }
        tracing::debug!("scrubbed {} configuration variables from the environment", vars.len());

        config
    }

    /// Build from `(name, value)` pairs using the `PIPETUN_*` names.
    ///
    /// Unknown names are ignored, missing names fall back to defaults.
    pub fn from_vars<'a, I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut file = ConfigFile::default();

        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "CLIENT_HOST" => file.client_host = value.to_string(),
                "CLIENT_PORT" => file.client_port = parse_var(key, value)?,
                "CLIENT_CONNECTION" => file.client_connection = parse_var(key, value)?,
                "SERVER_HOST" => file.server_host = value.to_string(),
                "SERVER_PORT" => file.server_port = parse_var(key, value)?,
                "BACKLOG" => file.backlog = parse_var(key, value)?,
                "USERNAME" => file.username = value.to_string(),
                "PASSWORD" => file.password = value.to_string(),
                "TIMEOUT" => file.timeout_secs = parse_var(key, value)?,
                "MAX_FRAME_LEN" => file.max_frame_len = parse_var(key, value)?,
                other => tracing::debug!("ignoring unknown variable {}{}", ENV_PREFIX, other),
            }
        }

        let config = file.to_config();
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let file: ConfigFile = toml::from_str(&content)
            .map_err(|e| Error::config(format!("cannot parse {}: {}", path.display(), e)))?;

        let config = file.to_config();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.client_host.is_empty() {
            return Err(Error::config("client_host cannot be empty"));
        }
        if self.server_host.is_empty() {
            return Err(Error::config("server_host cannot be empty"));
        }
        if self.client_connection == 0 {
            return Err(Error::config("client_connection must be at least 1"));
        }
        if self.username.is_empty() {
            return Err(Error::config("username cannot be empty"));
        }
        if self.password.is_empty() {
            return Err(Error::config("password cannot be empty"));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("timeout must be positive"));
        }
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(Error::config(format!(
                "max_frame_len must be at least {}",
                MIN_FRAME_LEN
            )));
        }
        Ok(())
    }

    /// `host:port` of the local SOCKS5 listener.
    pub fn client_addr(&self) -> String {
        format!("{}:{}", self.client_host, self.client_port)
    }

    /// `host:port` of the tunnel server.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        ConfigFile::default().to_config()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_host", &self.client_host)
            .field("client_port", &self.client_port)
            .field("client_connection", &self.client_connection)
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("backlog", &self.backlog)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("invalid value {:?} for {}: {}", value, key, e)))
}

/// Configuration file format for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Local SOCKS5 listen host
    pub client_host: String,
    /// Local SOCKS5 listen port
    pub client_port: u16,
    /// Number of pooled physical connections
    pub client_connection: usize,
    /// Tunnel server host
    pub server_host: String,
    /// Tunnel server port
    pub server_port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Shared user name
    pub username: String,
    /// Shared password
    pub password: String,
    /// Idle timeout in seconds
    pub timeout_secs: u64,
    /// Largest accepted frame payload in bytes
    pub max_frame_len: usize,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            client_host: "127.0.0.1".into(),
            client_port: 2022,
            client_connection: 1,
            server_host: "127.0.0.1".into(),
            server_port: 2222,
            backlog: 16,
            username: "default-username".into(),
            password: "default-password".into(),
            timeout_secs: 180,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ConfigFile {
    /// Convert into the runtime form.
    pub fn to_config(&self) -> Config {
        Config {
            client_host: self.client_host.clone(),
            client_port: self.client_port,
            client_connection: self.client_connection,
            server_host: self.server_host.clone(),
            server_port: self.server_port,
            backlog: self.backlog,
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_frame_len: self.max_frame_len,
        }
    }

    /// Convert from the runtime form.
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_host: config.client_host.clone(),
            client_port: config.client_port,
            client_connection: config.client_connection,
            server_host: config.server_host.clone(),
            server_port: config.server_port,
            backlog: config.backlog,
            username: config.username.clone(),
            password: config.password.clone(),
            timeout_secs: config.timeout.as_secs(),
            max_frame_len: config.max_frame_len,
        }
    }
}
