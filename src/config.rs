//! Runtime configuration
//! Command-line rules, the optional JSON file, and startup validation

use crate::registry::PrefixRegistry;
use crate::tls::{self, TlsConfigError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Accepted values for the log level setting
pub const LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// Configuration errors; all of them abort startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid proxy config format: {0} (expected: prefix[=target_domain]:use_https:insecure)")]
    InvalidRule(String),

    #[error("invalid {field} value: {value} (must be true or false)")]
    InvalidBool { field: &'static str, value: String },

    #[error("invalid proxy prefix: {0:?} (must be a single non-empty path segment)")]
    InvalidPrefix(String),

    #[error("invalid log level: {0}, must be one of: debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("both ssl cert file and ssl key file must be provided for HTTPS")]
    IncompleteTls,

    #[error("certificate file not found: {0}")]
    CertNotFound(PathBuf),

    #[error("key file not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("failed to load certificate pair: {0}")]
    Credentials(#[from] TlsConfigError),

    #[error("static directory not found: {0}")]
    StaticDirNotFound(PathBuf),

    #[error("static path is not a directory: {0}")]
    StaticNotDirectory(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One proxy rule as written on the command line.
///
/// `prefix:use_https:insecure` borrows the domain from the prefix;
/// `prefix=target_domain:use_https:insecure` names it explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    pub prefix: String,
    pub target_domain: String,
    pub use_https: bool,
    pub insecure: bool,
}

impl FromStr for ProxyRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split from the right so prefixes and domains can carry ports
        let mut parts = s.rsplitn(3, ':');
        let (insecure, use_https, head) = match (parts.next(), parts.next(), parts.next()) {
            (Some(insecure), Some(use_https), Some(head)) => (insecure, use_https, head),
            _ => return Err(ConfigError::InvalidRule(s.to_string())),
        };

        let (prefix, target_domain) = match head.split_once('=') {
            Some((prefix, domain)) => (prefix.trim(), domain.trim()),
            None => (head.trim(), ""),
        };

        if prefix.is_empty() || prefix.contains('/') {
            return Err(ConfigError::InvalidPrefix(prefix.to_string()));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            target_domain: target_domain.to_string(),
            use_https: parse_bool("use_https", use_https)?,
            insecure: parse_bool("insecure", insecure)?,
        })
    }
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ConfigError::InvalidBool {
            field,
            value: other.to_string(),
        }),
    }
}

/// Parse a comma-separated list of proxy rules, skipping empty entries
pub fn parse_proxy_rules(s: &str) -> Result<Vec<ProxyRule>, ConfigError> {
    s.split(',')
        .map(str::trim)
        .filter(|rule| !rule.is_empty())
        .map(ProxyRule::from_str)
        .collect()
}

/// Proxy entry in the JSON config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileProxyConfig {
    pub target_domain: String,
    pub use_https: bool,
    pub insecure: bool,
}

/// JSON config file; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub static_dir: Option<PathBuf>,
    /// Keyed by path prefix
    pub proxy_configs: BTreeMap<String, FileProxyConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Process-wide configuration, owner of the prefix registry
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address, `:8080` or `host:port`
    pub host: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub log_level: String,
    pub static_dir: PathBuf,
    /// Limit for connecting to an origin and receiving its response head
    pub upstream_timeout: Duration,
    /// Time in-flight connections get to finish on shutdown
    pub shutdown_grace: Duration,
    /// Limit for an inbound TLS handshake to complete
    pub handshake_timeout: Duration,
    /// Keep-alive connections with no request for this long are closed
    pub idle_timeout: Duration,
    pub registry: PrefixRegistry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: ":8080".to_string(),
            cert_file: None,
            key_file: None,
            log_level: "info".to_string(),
            static_dir: PathBuf::from("./static"),
            upstream_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            registry: PrefixRegistry::new(),
        }
    }
}

impl Config {
    /// Overlay values from a config file
    pub fn apply_file(&mut self, file: FileConfig) {
        if let Some(host) = file.host {
            self.host = host;
        }
        if file.cert_file.is_some() {
            self.cert_file = file.cert_file;
        }
        if file.key_file.is_some() {
            self.key_file = file.key_file;
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if let Some(dir) = file.static_dir {
            self.static_dir = dir;
        }
        for (prefix, proxy) in file.proxy_configs {
            self.add_proxy_config(prefix, proxy.target_domain, proxy.use_https, proxy.insecure);
        }
    }

    /// Register a proxy target; a later call for the same prefix wins
    pub fn add_proxy_config(
        &mut self,
        path_prefix: impl Into<String>,
        target_domain: impl Into<String>,
        use_https: bool,
        insecure: bool,
    ) {
        self.registry
            .insert(path_prefix, target_domain, use_https, insecure);
    }

    pub fn add_proxy_rule(&mut self, rule: ProxyRule) {
        self.add_proxy_config(rule.prefix, rule.target_domain, rule.use_https, rule.insecure);
    }

    /// Check everything that must hold before the listener starts
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        match (&self.cert_file, &self.key_file) {
            (None, None) => {}
            (Some(cert), Some(key)) => {
                if !cert.exists() {
                    return Err(ConfigError::CertNotFound(cert.clone()));
                }
                if !key.exists() {
                    return Err(ConfigError::KeyNotFound(key.clone()));
                }
                tls::load_server_tls_config(cert, key)?;
            }
            _ => return Err(ConfigError::IncompleteTls),
        }

        for target in self.registry.iter() {
            if target.prefix.is_empty() || target.prefix.contains('/') {
                return Err(ConfigError::InvalidPrefix(target.prefix.clone()));
            }
        }

        let static_dir = std::fs::canonicalize(&self.static_dir)
            .map_err(|_| ConfigError::StaticDirNotFound(self.static_dir.clone()))?;
        if !static_dir.is_dir() {
            return Err(ConfigError::StaticNotDirectory(static_dir));
        }
        self.static_dir = static_dir;

        Ok(())
    }

    pub fn is_https(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }

    /// Bind address with an empty host expanded to all interfaces
    pub fn bind_addr(&self) -> String {
        if self.host.starts_with(':') {
            format!("0.0.0.0{}", self.host)
        } else {
            self.host.clone()
        }
    }
}
