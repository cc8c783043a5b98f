//! Proxy configuration.
//!
//! Loaded once at start-up: an optional YAML file named by `CORSGATE_CONFIG`,
//! then environment variable overrides. The result is immutable and handed
//! to the proxy by reference.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Environment variable naming the YAML config file.
pub const CONFIG_PATH_VAR: &str = "CORSGATE_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the server binds to (`LISTEN`)
    pub listen_addr: String,

    /// Path of the forwarding endpoint (`PROXY_ENDPOINT`)
    pub endpoint: String,

    /// Hostnames requests may be forwarded to (`ALLOWED_HOSTS`, comma separated)
    pub allowed_hosts: Vec<String>,

    /// Upstream TCP connect timeout (`CONNECT_TIMEOUT_MS`)
    pub connect_timeout_ms: u64,

    /// Bound on the whole upstream exchange (`UPSTREAM_TIMEOUT_MS`)
    pub upstream_timeout_ms: u64,

    /// Largest accepted inbound body in bytes (`MAX_REQUEST_BODY`)
    pub max_request_body: usize,

    /// Largest upstream body buffered for relay (`MAX_RESPONSE_BODY`)
    pub max_response_body: usize,

    /// Static host to socket address overrides, bypassing DNS.
    pub resolve: HashMap<String, SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            endpoint: "/p".to_string(),
            allowed_hosts: vec![
                "api.openai.com".to_string(),
                "api.anthropic.com".to_string(),
                "generativelanguage.googleapis.com".to_string(),
            ],
            connect_timeout_ms: 10_000,
            upstream_timeout_ms: 30_000,
            max_request_body: 16 * 1024 * 1024,
            max_response_body: 32 * 1024 * 1024,
            resolve: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration using `lookup` in place of `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = match lookup(CONFIG_PATH_VAR) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                Self::from_yaml(&text).with_context(|| format!("parsing config file {path}"))?
            }
            None => Self::default(),
        };

        if let Some(v) = lookup("LISTEN") {
            cfg.listen_addr = v;
        }
        if let Some(v) = lookup("PROXY_ENDPOINT") {
            cfg.endpoint = v;
        }
        if let Some(v) = lookup("ALLOWED_HOSTS") {
            cfg.allowed_hosts = v
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout_ms = v.parse().context("CONNECT_TIMEOUT_MS")?;
        }
        if let Some(v) = lookup("UPSTREAM_TIMEOUT_MS") {
            cfg.upstream_timeout_ms = v.parse().context("UPSTREAM_TIMEOUT_MS")?;
        }
        if let Some(v) = lookup("MAX_REQUEST_BODY") {
            cfg.max_request_body = v.parse().context("MAX_REQUEST_BODY")?;
        }
        if let Some(v) = lookup("MAX_RESPONSE_BODY") {
            cfg.max_response_body = v.parse().context("MAX_RESPONSE_BODY")?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a YAML document. Missing fields take their defaults.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allowed_hosts.iter().all(|h| h.trim().is_empty()) {
            bail!("allowed_hosts is empty; the proxy would reject every request");
        }
        if !self.endpoint.starts_with('/') {
            bail!("endpoint must start with '/', got {:?}", self.endpoint);
        }
        if self.connect_timeout_ms == 0 || self.upstream_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        if self.max_request_body == 0 || self.max_response_body == 0 {
            bail!("body limits must be greater than zero");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}
