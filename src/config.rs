//! Configuration management for the edge-relay core

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listener addresses, e.g. "0.0.0.0:8080"
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Datagram control socket address (optional)
    #[serde(default)]
    pub control_listen: Option<String>,

    /// Maximum number of concurrent connections; beyond this the oldest
    /// idle connection is dropped
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Include full error chains in error response bodies
    #[serde(default)]
    pub verbose_response: bool,

    /// HTTP response cache size in bytes (0 disables)
    #[serde(default = "default_http_cache_size")]
    pub http_cache_size: usize,

    /// Filter cache size in bytes (0 disables)
    #[serde(default = "default_filter_cache_size")]
    pub filter_cache_size: usize,

    /// NFS cache size in bytes (0 disables)
    #[serde(default = "default_nfs_cache_size")]
    pub nfs_cache_size: usize,

    /// Translation cache size in entries (0 disables)
    #[serde(default = "default_translate_cache_size")]
    pub translate_cache_size: usize,

    /// Session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// File handler settings
    #[serde(default)]
    pub file: FileConfig,

    /// Cluster node id folded into generated session ids (optional)
    #[serde(default)]
    pub cluster_node: Option<u8>,

    /// Number of cluster nodes (required when cluster_node is set)
    #[serde(default)]
    pub cluster_size: Option<u8>,
}

/// Session manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Session cookie name
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Idle timeout in seconds
    #[serde(default = "default_session_idle")]
    pub idle_timeout: u64,

    /// Maximum number of sessions kept in memory
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Sidecar file sessions are saved to every 2 minutes (optional)
    #[serde(default)]
    pub save_path: Option<String>,
}

/// File handler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    /// Compatibility shim: honor the legacy inline-auth marker in HTML
    /// files under `legacy_inline_auth_prefix`
    #[serde(default)]
    pub legacy_inline_auth: bool,

    /// Path prefix the inline-auth shim applies to
    #[serde(default = "default_inline_auth_prefix")]
    pub legacy_inline_auth_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            idle_timeout: default_session_idle(),
            max_sessions: default_max_sessions(),
            save_path: None,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            legacy_inline_auth: false,
            legacy_inline_auth_prefix: default_inline_auth_prefix(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            control_listen: None,
            max_connections: default_max_connections(),
            verbose_response: false,
            http_cache_size: default_http_cache_size(),
            filter_cache_size: default_filter_cache_size(),
            nfs_cache_size: default_nfs_cache_size(),
            translate_cache_size: default_translate_cache_size(),
            session: SessionConfig::default(),
            file: FileConfig::default(),
            cluster_node: None,
            cluster_size: None,
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:8080".to_string()]
}

fn default_max_connections() -> usize {
    32768
}

fn default_http_cache_size() -> usize {
    512 * 1024 * 1024
}

fn default_filter_cache_size() -> usize {
    128 * 1024 * 1024
}

fn default_nfs_cache_size() -> usize {
    64 * 1024 * 1024
}

fn default_translate_cache_size() -> usize {
    131072
}

fn default_cookie_name() -> String {
    "beng_proxy_session".to_string()
}

fn default_session_idle() -> u64 {
    1200
}

fn default_max_sessions() -> usize {
    65536
}

fn default_inline_auth_prefix() -> String {
    "/var/www".to_string()
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;
        let config: RelayConfig = serde_yaml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Validation Rules
    /// - at least one listener
    /// - max_connections must be positive
    /// - cluster_node < cluster_size when both are set
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(RelayError::Config(
                "at least one listen address is required".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(RelayError::Config(
                "max_connections must be positive".to_string(),
            ));
        }

        match (self.cluster_node, self.cluster_size) {
            (Some(node), Some(size)) => {
                if size == 0 || node >= size {
                    return Err(RelayError::Config(format!(
                        "cluster_node ({}) must be less than cluster_size ({})",
                        node, size
                    )));
                }
            }
            (Some(_), None) => {
                return Err(RelayError::Config(
                    "cluster_node requires cluster_size".to_string(),
                ));
            }
            _ => {}
        }

        if self.session.idle_timeout == 0 {
            return Err(RelayError::Config(
                "session.idle_timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout)
    }
}
