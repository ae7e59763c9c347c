//! JSON configuration: listener addresses, strategy, upstream and bootstrap
//! sets, blacklist and connection limits. Validation happens at load time so
//! a bad file kills the process before any socket is bound.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::upstream::{Proto, TransportOptions, Upstream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Wait for every upstream and merge all valid answers.
    Fullest,
    /// Exit as soon as the primary/freedom split is decided.
    Fastest,
    /// First successful response wins; used by the bootstrap path.
    AnyResult,
}

impl Strategy {
    pub fn from_config(value: u8) -> anyhow::Result<Self> {
        match value {
            1 => Ok(Strategy::Fullest),
            2 => Ok(Strategy::Fastest),
            3 => Ok(Strategy::AnyResult),
            other => anyhow::bail!(
                "unknown strategy {other}, expected 1 (fullest), 2 (fastest) or 3 (any-result)"
            ),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Fullest => "fullest",
            Strategy::Fastest => "fastest",
            Strategy::AnyResult => "any-result",
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct DohServerConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Deserialize)]
pub struct Config {
    pub serve_addr: String,
    #[serde(default = "default_web_addr")]
    pub web_addr: String,
    #[serde(default = "default_strategy")]
    pub strategy: u8,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub socks_proxy: Option<String>,
    #[serde(default)]
    pub built_in_cache: bool,
    #[serde(default)]
    pub bootstrap: Vec<Upstream>,
    #[serde(default)]
    pub upstreams: Vec<Upstream>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub doh_server: Option<DohServerConfig>,
    #[serde(default = "default_max_active")]
    pub max_active_connections: usize,
    #[serde(default = "default_max_idle")]
    pub max_idle_connections: usize,
    #[serde(default = "default_stats_save_interval")]
    pub stats_save_interval: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub profiling: bool,
}

fn default_web_addr() -> String {
    "0.0.0.0:8854".to_string()
}

fn default_strategy() -> u8 {
    2
}

fn default_timeout() -> u64 {
    2
}

fn default_max_active() -> usize {
    50
}

fn default_max_idle() -> usize {
    20
}

fn default_stats_save_interval() -> u64 {
    5
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::parse(&body)
    }

    pub fn parse(body: &str) -> anyhow::Result<Self> {
        let mut config: Config = serde_json::from_str(body).context("parse config json")?;
        config.init()?;
        Ok(config)
    }

    fn init(&mut self) -> anyhow::Result<()> {
        Strategy::from_config(self.strategy)?;
        if self.serve_addr.is_empty() {
            anyhow::bail!("serve_addr is required");
        }
        if self.upstreams.is_empty() {
            anyhow::bail!("at least one upstream is required");
        }

        for upstream in &mut self.bootstrap {
            upstream.init()?;
            if upstream.host().parse::<IpAddr>().is_err() {
                anyhow::bail!("bootstrap servers must be literal IPs: {}", upstream.address);
            }
            match upstream.proto() {
                Proto::Udp | Proto::Tcp => {}
                _ => anyhow::bail!(
                    "bootstrap servers must be plain udp/tcp endpoints: {}",
                    upstream.address
                ),
            }
        }

        let socks_configured = self.socks_proxy.is_some();
        for upstream in &mut self.upstreams {
            upstream.init()?;
            upstream.validate(socks_configured)?;
        }
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::from_config(self.strategy).expect("strategy validated at load")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: self.timeout(),
            socks_proxy: self.socks_proxy.clone(),
            max_active: self.max_active_connections,
            max_idle: self.max_idle_connections,
        }
    }
}
