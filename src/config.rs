use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

#[derive(Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    pub target: TargetConfig,
    pub tls: Option<TlsSettings>,
}

#[derive(Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_listen_ip")]
    pub ip: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: default_listen_ip(),
            port: default_listen_port(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

/// TLS settings for the upstream connection. Presence of this section enables
/// TLS; the CA bundle is read from `cacert.pem` inside `certs_dir`.
#[derive(Clone, Deserialize)]
pub struct TlsSettings {
    pub certs_dir: String,
    /// Server name used for certificate verification; defaults to the target host.
    #[serde(default)]
    pub server_name: Option<String>,
}

fn default_listen_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

pub fn load_config() -> Result<Config> {
    let content = fs::read_to_string("config.toml").context("Failed to read config.toml file")?;
    toml::from_str(&content).context("Failed to parse config.toml as valid TOML")
}
