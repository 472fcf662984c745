use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tfinfra_actuator::TerraformerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch; all namespaces when unset
    pub watch_namespace: Option<String>,
    pub health_port: u16,
    pub max_concurrent_reconciles: u16,
    pub terraformer: TerraformerSettings,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = TerraformerSettings::default();

        let parse = |key: &str| -> Result<Option<u64>> { parse_var(&lookup, key) };
        let seconds = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse(key)?.map(Duration::from_secs).unwrap_or(default))
        };

        let terraformer = TerraformerSettings {
            image: lookup("TERRAFORMER_IMAGE")
                .filter(|image| !image.is_empty())
                .unwrap_or(defaults.image),
            backoff_limit: parse_var(&lookup, "TERRAFORMER_BACKOFF_LIMIT")?
                .unwrap_or(defaults.backoff_limit),
            active_deadline: seconds("TERRAFORMER_ACTIVE_DEADLINE_SECONDS", defaults.active_deadline)?,
            deadline_pod: seconds("TERRAFORMER_DEADLINE_POD_SECONDS", defaults.deadline_pod)?,
            deadline_job: seconds("TERRAFORMER_DEADLINE_JOB_SECONDS", defaults.deadline_job)?,
            deadline_cleaning: seconds("TERRAFORMER_DEADLINE_CLEANING_SECONDS", defaults.deadline_cleaning)?,
            poll_interval: defaults.poll_interval,
        };

        if terraformer.backoff_limit < 0 {
            anyhow::bail!("TERRAFORMER_BACKOFF_LIMIT must not be negative");
        }

        let max_concurrent_reconciles = parse_var(&lookup, "MAX_CONCURRENT_RECONCILES")?.unwrap_or(4);
        if max_concurrent_reconciles == 0 {
            anyhow::bail!("MAX_CONCURRENT_RECONCILES must be at least 1");
        }

        Ok(Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            health_port: parse_var(&lookup, "HEALTH_PORT")?.unwrap_or(8080),
            max_concurrent_reconciles,
            terraformer,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a valid number, got {:?}", key, value))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.max_concurrent_reconciles, 4);
        assert_eq!(config.terraformer, TerraformerSettings::default());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TERRAFORMER_IMAGE", "registry.local/terraformer:v2"),
            ("WATCH_NAMESPACE", "shoot--dev"),
            ("HEALTH_PORT", "9090"),
            ("MAX_CONCURRENT_RECONCILES", "8"),
            ("TERRAFORMER_BACKOFF_LIMIT", "2"),
            ("TERRAFORMER_ACTIVE_DEADLINE_SECONDS", "1200"),
            ("TERRAFORMER_DEADLINE_POD_SECONDS", "60"),
            ("TERRAFORMER_DEADLINE_JOB_SECONDS", "1800"),
            ("TERRAFORMER_DEADLINE_CLEANING_SECONDS", "120"),
        ])
        .unwrap();

        assert_eq!(config.watch_namespace.as_deref(), Some("shoot--dev"));
        assert_eq!(config.health_port, 9090);
        assert_eq!(config.max_concurrent_reconciles, 8);
        assert_eq!(config.terraformer.image, "registry.local/terraformer:v2");
        assert_eq!(config.terraformer.backoff_limit, 2);
        assert_eq!(config.terraformer.active_deadline, Duration::from_secs(1200));
        assert_eq!(config.terraformer.deadline_pod, Duration::from_secs(60));
        assert_eq!(config.terraformer.deadline_job, Duration::from_secs(1800));
        assert_eq!(config.terraformer.deadline_cleaning, Duration::from_secs(120));
    }

    #[test]
    fn test_empty_namespace_watches_all() {
        let config = load(&[("WATCH_NAMESPACE", "")]).unwrap();
        assert_eq!(config.watch_namespace, None);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = load(&[("TERRAFORMER_DEADLINE_JOB_SECONDS", "15m")]).unwrap_err();
        assert!(err.to_string().contains("TERRAFORMER_DEADLINE_JOB_SECONDS"));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        assert!(load(&[("MAX_CONCURRENT_RECONCILES", "0")]).is_err());
    }
}
