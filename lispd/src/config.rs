//! Configuration for the ambient daemon: reads a TOML file describing local
//! RLOC/EID placement and data-plane tuning, matching the
//! load-then-validate shape used throughout the stack's config loaders.

use crate::error::{DaemonError, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Top-level daemon configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// The RLOC this host encapsulates packets from.
    pub local_rloc: Ipv4Addr,
    /// EID prefixes considered "ours" -- packets sourced from one of these
    /// are candidates for encapsulation rather than native forwarding.
    pub local_eid_prefixes: Vec<String>,
    /// Proxy ETR used on a cache miss or negative map-cache entry.
    /// Default: none (packets are dropped instead of forwarded unencapsulated).
    #[serde(default)]
    pub proxy_etr: Option<Ipv4Addr>,
    /// LISP instance-id stamped on outgoing packets and Map-Requests.
    /// Default: 0 (the default instance).
    #[serde(default)]
    pub instance_id: u32,
    /// Map-cache entry tuning.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Application-level structured logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_nonces")]
    pub max_nonces: usize,
    #[serde(default = "default_negative_ttl_secs")]
    pub negative_ttl_secs: u64,
    #[serde(default = "default_retry_exhausted_ttl_secs")]
    pub retry_exhausted_ttl_secs: u64,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: u32,
    #[serde(default = "default_retry_cap_secs")]
    pub retry_cap_secs: u64,
    #[serde(default = "default_smr_inv_max_delay_secs")]
    pub smr_inv_max_delay_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_nonces: default_max_nonces(),
            negative_ttl_secs: default_negative_ttl_secs(),
            retry_exhausted_ttl_secs: default_retry_exhausted_ttl_secs(),
            retry_base_secs: default_retry_base_secs(),
            retry_factor: default_retry_factor(),
            retry_cap_secs: default_retry_cap_secs(),
            smr_inv_max_delay_secs: default_smr_inv_max_delay_secs(),
        }
    }
}

impl From<&CacheConfig> for lisp_core::EntryConfig {
    fn from(c: &CacheConfig) -> Self {
        lisp_core::EntryConfig {
            max_retries: c.max_retries,
            max_nonces: c.max_nonces,
            negative_ttl: std::time::Duration::from_secs(c.negative_ttl_secs),
            retry_exhausted_ttl: std::time::Duration::from_secs(c.retry_exhausted_ttl_secs),
            retry_base: std::time::Duration::from_secs(c.retry_base_secs),
            retry_factor: c.retry_factor,
            retry_cap: std::time::Duration::from_secs(c.retry_cap_secs),
            smr_inv_max_delay: std::time::Duration::from_secs(c.smr_inv_max_delay_secs),
        }
    }
}

fn default_max_retries() -> u32 {
    4
}
fn default_max_nonces() -> usize {
    3
}
fn default_negative_ttl_secs() -> u64 {
    60
}
fn default_retry_exhausted_ttl_secs() -> u64 {
    15
}
fn default_retry_base_secs() -> u64 {
    1
}
fn default_retry_factor() -> u32 {
    2
}
fn default_retry_cap_secs() -> u64 {
    30
}
fn default_smr_inv_max_delay_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let text = fs::read_to_string(path).map_err(|e| DaemonError::Config(format!("failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&text).map_err(|e| DaemonError::Config(format!("failed to parse config: {e}")))?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.local_eid_prefixes.is_empty() {
        return Err(DaemonError::Config("local_eid_prefixes must contain at least one prefix".into()));
    }
    for raw in &cfg.local_eid_prefixes {
        raw.parse::<IpNet>().map_err(|e| DaemonError::Config(format!("invalid local EID prefix {raw:?}: {e}")))?;
    }
    if cfg.cache.max_retries == 0 {
        return Err(DaemonError::Config("cache.max_retries must be at least 1".into()));
    }
    Ok(())
}

/// Parses the configured EID prefix strings into core [`lisp_core::IpPrefix`]
/// values, for building the initial local-EID snapshot.
pub fn parse_local_eid_prefixes(cfg: &Config) -> Result<Vec<lisp_core::IpPrefix>> {
    cfg.local_eid_prefixes
        .iter()
        .map(|raw| {
            let net: IpNet = raw.parse().map_err(|e| DaemonError::Config(format!("invalid prefix {raw:?}: {e}")))?;
            let prefix = match net {
                IpNet::V4(n) => lisp_core::IpPrefix::new(lisp_core::IpAddress::from(n.network()), n.prefix_len()),
                IpNet::V6(n) => lisp_core::IpPrefix::new(lisp_core::IpAddress::from(n.network()), n.prefix_len()),
            };
            prefix.map_err(DaemonError::Core)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_valid_config() {
        let file = write_temp_config(
            r#"
            local_rloc = "192.0.2.1"
            local_eid_prefixes = ["10.0.0.0/8"]
            "#,
        );
        let cfg = load_from_path(file.path()).unwrap();
        assert_eq!(cfg.local_rloc, "192.0.2.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(cfg.instance_id, 0);
        assert_eq!(cfg.cache.max_retries, 4);
    }

    #[test]
    fn rejects_empty_eid_prefixes() {
        let file = write_temp_config(
            r#"
            local_rloc = "192.0.2.1"
            local_eid_prefixes = []
            "#,
        );
        assert!(load_from_path(file.path()).is_err());
    }

    #[test]
    fn rejects_malformed_prefix() {
        let file = write_temp_config(
            r#"
            local_rloc = "192.0.2.1"
            local_eid_prefixes = ["not-a-prefix"]
            "#,
        );
        assert!(load_from_path(file.path()).is_err());
    }
}
