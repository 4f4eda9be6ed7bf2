//! Configuration loaded from environment variables.

use crate::error::AppError;
use reconcile_engine::ControllerConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_WORKERS: usize = 1;
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 120;

/// Runtime configuration of the Deployment Status Controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespace whose Deployments are watched (`WATCH_NAMESPACE`).
    pub namespace: String,
    /// Number of reconcile workers (`WORKERS`).
    pub workers: usize,
    /// Bound on the initial sync; `None` waits forever (`SYNC_TIMEOUT_SECS`, 0 = forever).
    pub sync_timeout: Option<Duration>,
    /// Consecutive initial list failures tolerated (`LIST_FAILURE_BUDGET`, unset = unbounded).
    pub list_failure_budget: Option<u32>,
    /// Periodic resync (`RESYNC_PERIOD_SECS`, unset or 0 = disabled).
    pub resync_period: Option<Duration>,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let namespace = lookup("WATCH_NAMESPACE")
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let workers = parse(&lookup, "WORKERS")?.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(AppError::InvalidConfig("WORKERS must be at least 1".to_string()));
        }

        let sync_timeout_secs = parse(&lookup, "SYNC_TIMEOUT_SECS")?.unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS);
        let resync_secs: Option<u64> = parse(&lookup, "RESYNC_PERIOD_SECS")?;

        Ok(Self {
            namespace,
            workers,
            sync_timeout: (sync_timeout_secs > 0).then(|| Duration::from_secs(sync_timeout_secs)),
            list_failure_budget: parse(&lookup, "LIST_FAILURE_BUDGET")?,
            resync_period: resync_secs.filter(|secs| *secs > 0).map(Duration::from_secs),
        })
    }

    /// Engine tunables derived from this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            sync_timeout: self.sync_timeout,
            list_failure_budget: self.list_failure_budget,
            resync_period: self.resync_period,
            ..ControllerConfig::default()
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>, AppError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| AppError::InvalidConfig(format!("{name}={raw:?}: {e}"))),
    }
}
