use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::CounterError;
use crate::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub lock: LockConfig,
    pub counter: CounterConfig,
    pub tracking: TrackingConfig,
    pub resources: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    File,
    Lease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub strategy: LockStrategy,
    pub lock_dir: PathBuf,
    pub file_poll_interval_ms: u64,
    pub lease_poll_interval_ms: u64,
    pub wait_timeout_ms: u64,
    /// 0 表示无限等待
    pub lease_wait_timeout_ms: Option<u64>,
    pub lease_expiry_secs: u64,
    pub backoff: BackoffKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    /// 每个请求都计数，包括 304
    EveryRequest,
    /// 只统计完整下发的请求
    FullDelivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    pub policy: CountPolicy,
    pub store: StoreKind,
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub extensions: Vec<String>,
    pub route_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEntry {
    pub id: String,
    pub path: PathBuf,
    pub mime_type: Option<String>,
    pub slug: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: LockStrategy::File,
            lock_dir: std::env::temp_dir(),
            file_poll_interval_ms: 250,
            lease_poll_interval_ms: 100,
            wait_timeout_ms: 5000,
            lease_wait_timeout_ms: Some(5000),
            lease_expiry_secs: 30,
            backoff: BackoffKind::Fixed,
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            policy: CountPolicy::EveryRequest,
            store: StoreKind::Sled,
            db_path: "./data/counter.db".into(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            extensions: "zip,rar,7z,dmg,tgz,tar.gz,exe,deb,rpm"
                .split(',')
                .map(String::from)
                .collect(),
            route_prefix: "download-file".to_string(),
        }
    }
}

impl LockConfig {
    pub fn file_poll_interval(&self) -> Duration {
        Duration::from_millis(self.file_poll_interval_ms)
    }

    pub fn lease_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease_poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn lease_wait_timeout(&self) -> Option<Duration> {
        match self.lease_wait_timeout_ms {
            Some(0) | None => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        }
    }

    pub fn lease_expiry(&self) -> Duration {
        Duration::from_secs(self.lease_expiry_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // 首先尝试从环境变量加载
        if let Ok(config_path) = std::env::var("CONFIG_PATH") {
            return Self::from_file(&config_path);
        }

        // 否则使用默认配置
        Ok(Self::default())
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| CounterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock.file_poll_interval_ms == 0 || self.lock.lease_poll_interval_ms == 0 {
            return Err(CounterError::Config("poll intervals must be non-zero".into()));
        }

        let mut seen = HashSet::new();
        for entry in &self.resources {
            if entry.id.trim().is_empty() {
                return Err(CounterError::Config(format!(
                    "resource {:?} has an empty id",
                    entry.path
                )));
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(CounterError::Config(format!(
                    "duplicate resource id: {}",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<std::net::SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| CounterError::Config(e.to_string()))
    }
}
