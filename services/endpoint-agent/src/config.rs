//! Configuration for the endpoint agent.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Endpoint agent configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix of workload interface names; stripped to form chain suffixes.
    pub iface_prefix: String,

    /// Whether endpoint status is reported at all.
    pub report_endpoint_status: bool,

    /// Whether IPv6 endpoints are programmed.
    pub ipv6_enabled: bool,

    /// Maximum messages drained into one actor batch.
    pub max_batch_size: usize,

    /// Optional JSON snapshot of endpoints to apply at startup.
    pub endpoints_file: Option<PathBuf>,

    /// Use recording backends instead of touching the kernel.
    pub dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iface_prefix: "tap".to_string(),
            report_endpoint_status: true,
            ipv6_enabled: true,
            max_batch_size: 128,
            endpoints_file: None,
            dry_run: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let iface_prefix = lookup("WARDEN_IFACE_PREFIX").unwrap_or(defaults.iface_prefix);

        let report_endpoint_status = lookup("WARDEN_REPORT_ENDPOINT_STATUS")
            .map(|v| parse_bool(&v))
            .transpose()
            .context("WARDEN_REPORT_ENDPOINT_STATUS must be a boolean.")?
            .unwrap_or(defaults.report_endpoint_status);

        let ipv6_enabled = lookup("WARDEN_IPV6_ENABLED")
            .map(|v| parse_bool(&v))
            .transpose()
            .context("WARDEN_IPV6_ENABLED must be a boolean.")?
            .unwrap_or(defaults.ipv6_enabled);

        let max_batch_size: usize = lookup("WARDEN_MAX_BATCH_SIZE")
            .map(|v| v.parse())
            .transpose()
            .context("WARDEN_MAX_BATCH_SIZE must be a positive integer.")?
            .unwrap_or(defaults.max_batch_size)
            .max(1);

        let endpoints_file = lookup("WARDEN_ENDPOINTS_FILE").map(PathBuf::from);

        let dry_run = lookup("WARDEN_DRY_RUN")
            .map(|v| parse_bool(&v))
            .transpose()
            .context("WARDEN_DRY_RUN must be a boolean.")?
            .unwrap_or(defaults.dry_run);

        let log_level = lookup("WARDEN_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            iface_prefix,
            report_endpoint_status,
            ipv6_enabled,
            max_batch_size,
            endpoints_file,
            dry_run,
            log_level,
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.iface_prefix, "tap");
        assert!(config.report_endpoint_status);
        assert!(config.ipv6_enabled);
        assert_eq!(config.max_batch_size, 128);
        assert!(config.endpoints_file.is_none());
        assert!(!config.dry_run);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("WARDEN_IFACE_PREFIX", "cali"),
            ("WARDEN_REPORT_ENDPOINT_STATUS", "false"),
            ("WARDEN_IPV6_ENABLED", "0"),
            ("WARDEN_MAX_BATCH_SIZE", "0"),
            ("WARDEN_ENDPOINTS_FILE", "/etc/warden/endpoints.json"),
            ("WARDEN_DRY_RUN", "yes"),
        ]))
        .unwrap();

        assert_eq!(config.iface_prefix, "cali");
        assert!(!config.report_endpoint_status);
        assert!(!config.ipv6_enabled);
        assert_eq!(config.max_batch_size, 1);
        assert_eq!(
            config.endpoints_file,
            Some(PathBuf::from("/etc/warden/endpoints.json"))
        );
        assert!(config.dry_run);
    }

    #[test]
    fn test_invalid_bool() {
        let err = Config::from_lookup(lookup(&[("WARDEN_DRY_RUN", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("WARDEN_DRY_RUN"));
    }
}
