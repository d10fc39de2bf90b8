use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::listener::ListenOptions;

/// Proxy configuration, loaded from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Listener
    pub host: String,
    pub port: u16,

    // Certificate authority
    pub ca_store_dir: Option<PathBuf>,
    pub intercept_tls: bool,

    // Upstream
    pub connect_timeout_seconds: u64,
    /// Extra PEM roots trusted for upstream TLS, on top of the Mozilla bundle
    pub upstream_ca_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 0,
            ca_store_dir: None,
            intercept_tls: true,
            connect_timeout_seconds: 30,
            upstream_ca_file: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("PROXY_HOST").unwrap_or(defaults.host);
        let port = match lookup("PROXY_PORT") {
            Some(value) => value.parse().context("Invalid PROXY_PORT")?,
            None => defaults.port,
        };

        let ca_store_dir = lookup("PROXY_CA_DIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        let intercept_tls = match lookup("PROXY_INTERCEPT_TLS") {
            Some(value) => parse_bool(&value).context("Invalid PROXY_INTERCEPT_TLS")?,
            None => defaults.intercept_tls,
        };

        let connect_timeout_seconds = match lookup("PROXY_CONNECT_TIMEOUT_SECONDS") {
            Some(value) => value
                .parse()
                .context("Invalid PROXY_CONNECT_TIMEOUT_SECONDS")?,
            None => defaults.connect_timeout_seconds,
        };
        if connect_timeout_seconds == 0 {
            anyhow::bail!("PROXY_CONNECT_TIMEOUT_SECONDS must be greater than zero");
        }
        let upstream_ca_file = lookup("PROXY_UPSTREAM_CA_FILE")
            .filter(|file| !file.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            host,
            port,
            ca_store_dir,
            intercept_tls,
            connect_timeout_seconds,
            upstream_ca_file,
        })
    }

    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            hostname: self.host.clone(),
            port: self.port,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {:?}", other),
    }
}
