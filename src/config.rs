//! Layered configuration: a TOML file overridden by an optional `--listen`
//! CLI flag, falling back to built-in defaults for anything unset.
//!
//! Grounded in `examples/original_source/internal/config/config.go`'s
//! viper-based `Config` struct and `setDefaults()`; expressed here as a
//! plain `serde`-deserialized struct read once at startup, matching the
//! "global state" design note in spec.md §9 (pass an explicit value
//! through the engine rather than a process-wide singleton).

use std::path::Path;

use serde::Deserialize;

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    1080
}
fn default_timeout() -> u64 {
    30
}
fn default_max_connections() -> usize {
    1000
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_flush_interval() -> u64 {
    30
}
fn default_batch_size() -> usize {
    1000
}
fn default_session_timeout() -> u64 {
    3600
}
fn default_db_path() -> String {
    "proxy.sqlite3".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout: u64,
    pub max_connections: usize,
    pub heartbeat_interval: u64,
    pub enable_ip_forwarding: bool,
    pub enable_http_inspection: bool,
    pub flush_interval: u64,
    pub batch_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_connections: default_max_connections(),
            heartbeat_interval: default_heartbeat_interval(),
            enable_ip_forwarding: false,
            enable_http_inspection: default_true(),
            flush_interval: default_flush_interval(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bypass password accepted for any active user. Empty disables the
    /// bypass. Deliberately defaults to empty rather than the original
    /// source's hard-coded bypass string (see DESIGN.md, Open Question).
    pub super_password: String,
    /// Unused in the core; token issuance is management-plane. Carried
    /// for configuration schema parity with the original.
    pub session_timeout: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            super_password: String::new(),
            session_timeout: default_session_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load from `path` if it exists, falling back to all-defaults when
    /// absent. A malformed file is an unrecoverable configuration error
    /// (spec.md §6: non-zero exit code).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::info!(
                "config file {} not found, using built-in defaults",
                path.display()
            );
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:1080");
        assert_eq!(cfg.proxy.timeout, 30);
        assert_eq!(cfg.proxy.max_connections, 1000);
        assert_eq!(cfg.proxy.heartbeat_interval, 5);
        assert!(cfg.proxy.enable_http_inspection);
        assert!(!cfg.proxy.enable_ip_forwarding);
        assert_eq!(cfg.auth.super_password, "");
        assert_eq!(cfg.auth.session_timeout, 3600);
    }

    #[test]
    fn parses_partial_toml_with_defaults_filled_in() {
        let raw = r#"
            [server]
            port = 2080

            [auth]
            super_password = "letmein"
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.server.port, 2080);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.auth.super_password, "letmein");
        assert_eq!(cfg.proxy.max_connections, 1000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:1080");
    }
}
