use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use engine::EngineConfig;
use migrate::AmbiguousPolicy;
use read_cache::CacheConfig;
use serde::Deserialize;

/// `<config_dir>/chronik/config.toml`. Every key is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub root: Option<PathBuf>,
    pub engine: Option<String>,
    pub lock_timeout: Option<String>,
    pub cache_capacity: Option<usize>,
    pub cache_ttl: Option<String>,
    pub keep_backups: Option<bool>,
    pub max_tools: Option<usize>,
    pub ambiguous_policy: Option<String>,
}

fn parse_duration(key: &str, raw: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(raw).with_context(|| format!("invalid {key}: {raw:?}"))
}

impl Config {
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("chronik").join("config.toml")
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map_or_else(Self::default_path, Path::to_path_buf);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file at {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file at {}", config_path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chronik")
                .join("history")
        })
    }

    pub fn engine_name(&self) -> &str {
        self.engine.as_deref().unwrap_or("json")
    }

    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = EngineConfig::default();
        if let Some(raw) = &self.lock_timeout {
            config.lock_timeout = parse_duration("lock_timeout", raw)?;
        }
        let mut cache = CacheConfig::default();
        if let Some(capacity) = self.cache_capacity {
            cache.capacity = capacity;
        }
        if let Some(raw) = &self.cache_ttl {
            cache.ttl = parse_duration("cache_ttl", raw)?;
        }
        config.cache = cache;
        config.keep_backups = self.keep_backups.unwrap_or(false);
        if let Some(raw) = &self.ambiguous_policy {
            config.ambiguous = raw
                .parse::<AmbiguousPolicy>()
                .with_context(|| format!("invalid ambiguous_policy: {raw:?}"))?;
        }
        Ok(config)
    }
}
