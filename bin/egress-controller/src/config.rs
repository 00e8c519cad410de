//! Controller configuration, read from the environment

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Northbound database endpoint(s), comma separated
    pub nb_address: String,
    pub nb_timeout: Duration,
    /// VPC of gateways that do not name one
    pub cluster_router: String,
    pub workers: u16,
    pub metrics_addr: SocketAddr,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub resync_interval: Duration,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let workers: u16 = parse(&lookup, "WORKERS", 4)?;
        if workers == 0 {
            return Err(invalid("WORKERS", "0", "at least one worker is required"));
        }

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            None | Some("") | Some("plain") => LogFormat::Plain,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(invalid("LOG_FORMAT", other, "expected plain or json")),
        };

        let nb_address = non_empty(&lookup, "OVN_NB_ADDR", "tcp:127.0.0.1:6641");
        if !nb_address
            .split(',')
            .all(|addr| addr.starts_with("tcp:") || addr.starts_with("unix:"))
        {
            return Err(invalid("OVN_NB_ADDR", &nb_address, "expected tcp:<host>:<port> or unix:<path>"));
        }

        Ok(Self {
            nb_address,
            nb_timeout: Duration::from_secs(parse(&lookup, "OVN_NB_TIMEOUT_SECS", 30)?),
            cluster_router: non_empty(&lookup, "CLUSTER_ROUTER", "ovn-cluster"),
            workers,
            metrics_addr: parse(&lookup, "METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            retry_base_delay: Duration::from_millis(parse(&lookup, "RETRY_BASE_DELAY_MS", 5)?),
            retry_max_delay: Duration::from_secs(parse(&lookup, "RETRY_MAX_DELAY_SECS", 1000)?),
            resync_interval: Duration::from_secs(parse(&lookup, "RESYNC_INTERVAL_SECS", 300)?),
            log_format,
        })
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: ToString,
{
    match lookup(key).filter(|value| !value.is_empty()) {
        Some(value) => value.parse().map_err(|e: T::Err| invalid(key, &value, e)),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Error {
    Error::InvalidConfig {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.nb_address, "tcp:127.0.0.1:6641");
        assert_eq!(config.nb_timeout, Duration::from_secs(30));
        assert_eq!(config.cluster_router, "ovn-cluster");
        assert_eq!(config.workers, 4);
        assert_eq!(config.metrics_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.retry_base_delay, Duration::from_millis(5));
        assert_eq!(config.retry_max_delay, Duration::from_secs(1000));
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.log_format, LogFormat::Plain);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("OVN_NB_ADDR", "tcp:10.0.0.1:6641,tcp:10.0.0.2:6641"),
            ("CLUSTER_ROUTER", "vpc-main"),
            ("WORKERS", "8"),
            ("METRICS_ADDR", "127.0.0.1:9090"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.nb_address, "tcp:10.0.0.1:6641,tcp:10.0.0.2:6641");
        assert_eq!(config.cluster_router, "vpc-main");
        assert_eq!(config.workers, 8);
        assert_eq!(config.metrics_addr.port(), 9090);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values() {
        for vars in [
            [("WORKERS", "many")],
            [("WORKERS", "0")],
            [("METRICS_ADDR", "localhost")],
            [("LOG_FORMAT", "yaml")],
            [("OVN_NB_ADDR", "ssl:10.0.0.1:6641")],
            [("RESYNC_INTERVAL_SECS", "-1")],
        ] {
            let err = config(&vars).unwrap_err();
            assert!(matches!(err, Error::InvalidConfig { .. }), "{:?} accepted", vars);
        }
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let config = config(&[("CLUSTER_ROUTER", ""), ("WORKERS", "")]).unwrap();
        assert_eq!(config.cluster_router, "ovn-cluster");
        assert_eq!(config.workers, 4);
    }
}
