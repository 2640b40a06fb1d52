//! Serve - Main entry point
//!
//! An HTTP/HTTPS server combining a static file tree with path-prefix reverse proxying

use anyhow::{Context, Result};
use clap::Parser;
use serve::config::{parse_proxy_rules, LOG_LEVELS};
use serve::{Config, FileConfig, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PROXY_HELP: &str = "\
Reverse proxy rules, comma separated. Repeatable.

  prefix:use_https:insecure
      The prefix is also the target domain and is stripped from the path.
      /www.example.com/api/users?id=1 -> http(s)://www.example.com/api/users?id=1

  prefix=target_domain:use_https:insecure
      Requests under /prefix go to target_domain with the path unchanged.
      /api/users?id=1 -> http(s)://target_domain/api/users?id=1

use_https and insecure are true or false; insecure skips certificate
verification and only applies when use_https is true.";

/// Serve - HTTP/HTTPS server with static files and reverse proxying
#[derive(Parser, Debug)]
#[command(name = "serve")]
#[command(author = "Serve Contributors")]
#[command(version)]
#[command(about = "HTTP/HTTPS server with static file serving and path-prefix reverse proxying")]
struct Args {
    /// Listen address (e.g. :8080)
    #[arg(long, env = "SERVE_HOST")]
    host: Option<String>,

    /// SSL certificate file (enables HTTPS)
    #[arg(long, env = "SERVE_SSL_CERT_FILE")]
    ssl_cert_file: Option<PathBuf>,

    /// SSL private key file (enables HTTPS)
    #[arg(long, env = "SERVE_SSL_KEY_FILE")]
    ssl_key_file: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, env = "SERVE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Static file directory
    #[arg(long, env = "SERVE_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Reverse proxy rules (prefix[=target_domain]:use_https:insecure)
    #[arg(long, env = "SERVE_PROXY", long_help = PROXY_HELP)]
    proxy: Vec<String>,

    /// JSON configuration file; command-line values take precedence
    #[arg(long, env = "SERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to wait for an origin to connect and answer
    #[arg(long, env = "SERVE_UPSTREAM_TIMEOUT", default_value_t = 30)]
    upstream_timeout: u64,

    /// Seconds in-flight connections get to finish on shutdown
    #[arg(long, env = "SERVE_SHUTDOWN_GRACE", default_value_t = 10)]
    shutdown_grace: u64,
}

impl Args {
    /// Merge defaults, the config file and the command line
    fn into_config(self) -> Result<Config> {
        let mut config = Config::default();

        if let Some(path) = &self.config {
            config.apply_file(FileConfig::load(path)?);
        }

        if let Some(host) = self.host {
            config.host = host;
        }
        if self.ssl_cert_file.is_some() {
            config.cert_file = self.ssl_cert_file;
        }
        if self.ssl_key_file.is_some() {
            config.key_file = self.ssl_key_file;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(dir) = self.static_dir {
            config.static_dir = dir;
        }
        config.upstream_timeout = Duration::from_secs(self.upstream_timeout);
        config.shutdown_grace = Duration::from_secs(self.shutdown_grace);

        for rules in &self.proxy {
            for rule in parse_proxy_rules(rules).context("Failed to parse proxy configs")? {
                config.add_proxy_rule(rule);
            }
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Args::parse().into_config()?;

    // Initialize logging
    let level = if LOG_LEVELS.contains(&config.log_level.as_str()) {
        config.log_level.clone()
    } else {
        "info".to_string()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .compact()
        .init();

    config.validate().context("Invalid configuration")?;

    let server = Arc::new(ProxyServer::new(&config)?);

    info!("Starting serve v{}", env!("CARGO_PKG_VERSION"));
    info!("Listen address: {}", server.addr());
    if config.is_https() {
        info!("HTTPS mode enabled");
    } else {
        info!("HTTP mode enabled");
    }
    info!("Static directory: {}", config.static_dir.display());
    if config.registry.is_empty() {
        info!("No proxy configurations, serving static files only");
    } else {
        info!("Proxy configurations: {}", config.registry.len());
    }

    server.run(shutdown_signal()).await?;

    info!("Server exited gracefully");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
