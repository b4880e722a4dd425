// jrpc-proxy - a caching reverse proxy for JSON-RPC 2.0
// Copyright (C) 2025 jrpc-proxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Proxy configuration surface
//!
//! The structure is plain serde, so any JSON-compatible format can feed it;
//! the shipped loader reads JSON. Duration fields accept human-readable
//! strings like `"10s"` or `"1h"`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Log level name used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Whether per-request access logging is enabled.
    pub access_log: bool,
    /// Management listener settings; parsed and validated, serving is a
    /// separate concern.
    pub manage: ManageConfig,
    /// Upstream server URLs; must not be empty.
    pub upstreams: Vec<String>,
    /// `host:port` the proxy listens on.
    pub listen: String,
    /// URL path of the JSON-RPC endpoint; must start with `/`.
    pub path: String,
    /// Absolute deadline for one upstream forward, retries included.
    #[serde(with = "humantime_serde")]
    pub upstream_request_timeout: Duration,
    /// Server read timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Server write timeout.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Server keep-alive idle timeout.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Global fallback TTL for cached error outcomes.
    #[serde(with = "humantime_serde")]
    pub err_for: Duration,
    /// Per-method cache policies.
    pub cache_configs: Vec<CacheConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            access_log: true,
            manage: ManageConfig::default(),
            upstreams: Vec::new(),
            listen: "127.0.0.1:8545".to_string(),
            path: "/".to_string(),
            upstream_request_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            err_for: Duration::ZERO,
            cache_configs: Vec::new(),
        }
    }
}

/// Management listener settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManageConfig {
    /// `host:port` of the management listener; may equal the main listener.
    pub listen: String,
    /// Management page path; must start with `/` when set.
    pub path: String,
    /// Metrics path; must start with `/` when set.
    pub metrics_path: String,
}

/// One cache policy: a sorted method list plus TTLs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Methods this policy applies to; sorted by [`CacheConfig::sort`] so
    /// lookups can binary-search.
    pub methods: Vec<String>,
    /// TTL for cached success results.
    #[serde(rename = "for", with = "humantime_serde")]
    pub ttl: Duration,
    /// TTL for cached error outcomes.
    #[serde(default, with = "humantime_serde")]
    pub err_for: Duration,
}

impl CacheConfig {
    /// Sorts the method list; required before [`CacheConfig::contains`].
    pub fn sort(&mut self) {
        self.methods.sort_unstable();
    }

    /// Binary search over the sorted method list.
    pub fn contains(&self, method: &str) -> bool {
        self.methods.binary_search_by(|m| m.as_str().cmp(method)).is_ok()
    }
}

fn valid_host_port(listen: &str) -> bool {
    let Some((host, port)) = listen.rsplit_once(':') else {
        return false;
    };
    !host.is_empty() && !port.is_empty() && port.parse::<u16>().is_ok()
}

impl Config {
    /// Loads a JSON config file and normalizes it.
    pub fn from_json_file(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("unable to read config {}: {e}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| eyre::eyre!("unable to parse config {}: {e}", path.display()))?;
        config.normalize();
        Ok(config)
    }

    /// Sorts every cache policy's method list. Must run after construction.
    pub fn normalize(&mut self) {
        for cc in &mut self.cache_configs {
            cc.sort();
        }
    }

    /// Finds the cache policy covering `method`, if any.
    pub fn search(&self, method: &str) -> Option<&CacheConfig> {
        self.cache_configs.iter().find(|cc| cc.contains(method))
    }

    /// Validates the addresses and paths.
    pub fn validate(&self) -> eyre::Result<()> {
        eyre::ensure!(
            valid_host_port(&self.listen),
            "config.listen address is not valid: {:?}",
            self.listen
        );
        eyre::ensure!(self.path.starts_with('/'), "config.path is not valid: {:?}", self.path);
        eyre::ensure!(
            self.manage.path.is_empty() || self.manage.path.starts_with('/'),
            "config.manage.path is not valid: {:?}",
            self.manage.path
        );
        eyre::ensure!(
            self.manage.metrics_path.is_empty() || self.manage.metrics_path.starts_with('/'),
            "config.manage.metricsPath is not valid: {:?}",
            self.manage.metrics_path
        );
        eyre::ensure!(!self.upstreams.is_empty(), "config.upstreams is empty");
        Ok(())
    }
}
