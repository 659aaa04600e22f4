//! Process configuration (ambient stack, per SPEC_FULL.md §2).
//!
//! Loaded from a TOML file with environment-variable overrides for the
//! handful of values spec.md's "Environment" section names.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

fn default_bind_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8443).into()
}

fn default_tls_cert_path() -> PathBuf {
    PathBuf::from("/etc/ssl/certs/server.crt")
}

fn default_tls_key_path() -> PathBuf {
    PathBuf::from("/etc/ssl/private/server-private.key")
}

fn default_schema_path() -> PathBuf {
    PathBuf::from("/etc/switchdb-restd/schema.json")
}

fn default_account_schema_path() -> PathBuf {
    PathBuf::from("/etc/switchdb-restd/account-schema.json")
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("/etc/switchdb-restd/plugins.d")
}

fn default_tick_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(with = "socket_addr_str")]
    pub bind_addr: SocketAddr,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    /// Generate a self-signed cert/key pair at the configured paths if
    /// missing, per spec.md §6 "Environment".
    pub create_ssl: bool,
    /// Redirect plain-HTTP requests to HTTPS (spec.md §4.8 step 2).
    pub force_https: bool,
    pub schema_path: PathBuf,
    pub account_schema_path: PathBuf,
    pub plugin_dir: PathBuf,
    pub connection_manager_tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            tls_cert_path: default_tls_cert_path(),
            tls_key_path: default_tls_key_path(),
            create_ssl: false,
            force_https: true,
            schema_path: default_schema_path(),
            account_schema_path: default_account_schema_path(),
            plugin_dir: default_plugin_dir(),
            connection_manager_tick_ms: default_tick_interval_ms(),
        }
    }
}

mod socket_addr_str {
    use std::net::SocketAddr;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Load from `path` (if it exists) and then apply environment overrides.
    /// Missing file is not an error: defaults plus environment are enough to
    /// boot in a container with everything supplied by env vars.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            _ => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SWITCHDB_RESTD_BIND_ADDR") {
            if let Ok(addr) = v.parse() {
                self.bind_addr = addr;
            }
        }
        if let Ok(v) = env::var("SWITCHDB_RESTD_TLS_CERT_PATH") {
            self.tls_cert_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SWITCHDB_RESTD_TLS_KEY_PATH") {
            self.tls_key_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SWITCHDB_RESTD_CREATE_SSL") {
            self.create_ssl = parse_bool_env(&v, self.create_ssl);
        }
        if let Ok(v) = env::var("SWITCHDB_RESTD_FORCE_HTTPS") {
            self.force_https = parse_bool_env(&v, self.force_https);
        }
        if let Ok(v) = env::var("SWITCHDB_RESTD_SCHEMA_PATH") {
            self.schema_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SWITCHDB_RESTD_ACCOUNT_SCHEMA_PATH") {
            self.account_schema_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SWITCHDB_RESTD_PLUGIN_DIR") {
            self.plugin_dir = PathBuf::from(v);
        }
    }
}

fn parse_bool_env(raw: &str, fallback: bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.force_https);
        assert!(!config.create_ssl);
        assert_eq!(config.connection_manager_tick_ms, 100);
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
            bind_addr = "127.0.0.1:9443"
            force_https = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.bind_addr.port(), 9443);
        assert!(!config.force_https);
    }
}
