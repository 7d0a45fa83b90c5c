use anyhow::{bail, Context};
use std::{env, net::SocketAddr, time::Duration};

pub const DEFAULT_INVERTER_HOST: &str = "192.168.1.139";
pub const DEFAULT_INVERTER_PORT: u16 = 6607;
// Some inverters only answer on unit id 1
pub const DEFAULT_SLAVE_ID: u8 = 0;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

/// Where the inverter lives and how long to wait for it
#[derive(Debug, Clone, PartialEq)]
pub struct InverterConfig {
    pub host: String,
    pub port: u16,
    pub slave_id: u8,
    pub timeout: Duration,
}

/// Process configuration, sourced from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub inverter: InverterConfig,
    pub listen_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, falling back to defaults for missing keys
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("INVERTER_HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INVERTER_HOST.to_string());
        let port = parse_or("INVERTER_PORT", lookup("INVERTER_PORT"), DEFAULT_INVERTER_PORT)?;
        if port == 0 {
            bail!("INVERTER_PORT must be between 1 and 65535");
        }
        let slave_id = parse_or("INVERTER_SLAVE_ID", lookup("INVERTER_SLAVE_ID"), DEFAULT_SLAVE_ID)?;
        let timeout_ms = parse_or(
            "INVERTER_TIMEOUT_MS",
            lookup("INVERTER_TIMEOUT_MS"),
            DEFAULT_TIMEOUT_MS,
        )?;
        if timeout_ms == 0 {
            bail!("INVERTER_TIMEOUT_MS must be >= 1");
        }
        let listen_addr = lookup("LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_addr
            .trim()
            .parse::<SocketAddr>()
            .with_context(|| format!("LISTEN_ADDR `{listen_addr}` is not a socket address"))?;

        Ok(Self {
            inverter: InverterConfig {
                host: host.trim().to_string(),
                port,
                slave_id,
                timeout: Duration::from_millis(timeout_ms),
            },
            listen_addr,
        })
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has invalid value `{raw}`")),
        _ => Ok(default),
    }
}
