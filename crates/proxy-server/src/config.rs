use crate::policy::{PolicyRule, PolicyTable, SitePolicy, DEFAULT_TIMEOUT};
use mari_cache::TtlCache;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Replaces the built-in site policies when present.
    #[serde(default)]
    pub policies: Option<Vec<PolicyConfig>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_rotation_probability")]
    pub user_agent_rotation_probability: f64,
    /// Fixed seed for user-agent rotation; random when absent.
    #[serde(default)]
    pub rotation_seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolicyConfig {
    pub host_contains: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
            policies: None,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    /// The policy table this config describes.
    pub fn policy_table(&self) -> PolicyTable {
        let default = SitePolicy::new(Duration::from_millis(self.fetch.default_timeout_ms));
        match &self.policies {
            None => PolicyTable::new(PolicyTable::builtin().rules().to_vec(), default),
            Some(entries) => {
                let rules = entries
                    .iter()
                    .map(|p| PolicyRule {
                        host_contains: p.host_contains.clone(),
                        policy: SitePolicy {
                            extra_headers: p
                                .extra_headers
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect(),
                            timeout: Duration::from_millis(p.timeout_ms),
                        },
                    })
                    .collect();
                PolicyTable::new(rules, default)
            }
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_redirects: default_max_redirects(),
            default_timeout_ms: default_timeout_ms(),
            user_agent_rotation_probability: default_rotation_probability(),
            rotation_seed: None,
        }
    }
}

/// Compare old and new config, apply what is safe to change live.
///
/// - TTL changed → applied to the running cache (entries kept)
/// - Anything else changed → WARN log, ignored until restart
pub fn diff_and_apply<V: Send + Sync>(old: &Config, new: &Config, cache: &TtlCache<V>) {
    if old.cache.ttl_seconds != new.cache.ttl_seconds {
        cache.set_ttl(new.ttl());
        tracing::info!(
            old = old.cache.ttl_seconds,
            new = new.cache.ttl_seconds,
            "config reloaded: TTL changed"
        );
    }

    if old.policies != new.policies || old.fetch != new.fetch {
        tracing::warn!("fetch or policy settings changed, ignoring. Restart to apply");
    }

    if old.server != new.server || old.cache.sweep_interval_seconds != new.cache.sweep_interval_seconds {
        tracing::warn!("server or sweep settings changed, ignoring. Restart to apply");
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_admin_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_ttl() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    120
}
fn default_max_redirects() -> usize {
    5
}
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_rotation_probability() -> f64 {
    0.3
}
