use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name}={value:?} is not valid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub static_dir: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    /// Messages kept per conversation; unbounded when `None`.
    pub history_limit: Option<usize>,
    pub call_ring_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3000,
            static_dir: PathBuf::from("public"),
            tls_cert: PathBuf::from("ssl/certificate.pem"),
            tls_key: PathBuf::from("ssl/private.key"),
            history_limit: None,
            call_ring_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from any variable source; unset variables keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let history_limit = parse::<usize>(&lookup, "CHAT_HISTORY_LIMIT")?;
        if history_limit == Some(0) {
            return Err(ConfigError::Invalid {
                name: "CHAT_HISTORY_LIMIT",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Config {
            host: parse(&lookup, "CHAT_HOST")?.unwrap_or(defaults.host),
            port: parse(&lookup, "PORT")?.unwrap_or(defaults.port),
            static_dir: lookup("CHAT_STATIC_DIR").map_or(defaults.static_dir, PathBuf::from),
            tls_cert: lookup("CHAT_TLS_CERT").map_or(defaults.tls_cert, PathBuf::from),
            tls_key: lookup("CHAT_TLS_KEY").map_or(defaults.tls_key, PathBuf::from),
            history_limit,
            call_ring_timeout: parse(&lookup, "CALL_RING_TIMEOUT_SECS")?
                .map_or(defaults.call_ring_timeout, Duration::from_secs),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            }),
    }
}
