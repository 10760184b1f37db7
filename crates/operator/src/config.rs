use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::queue::{DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_MIN};

/// Source host reported when neither `HOSTNAME` nor the system hostname is known
pub const FALLBACK_HOST: &str = "hostname";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventSinkKind {
    #[serde(rename = "kubernetes")]
    Kubernetes,
    #[serde(rename = "stdout")]
    Stdout,
}

impl Default for EventSinkKind {
    fn default() -> Self {
        EventSinkKind::Kubernetes
    }
}

impl std::str::FromStr for EventSinkKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(EventSinkKind::Kubernetes),
            "stdout" => Ok(EventSinkKind::Stdout),
            other => Err(crate::Error::Config(format!(
                "unknown event sink '{}', expected 'kubernetes' or 'stdout'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub controller: ControllerConfig,
    pub queue: QueueConfig,
    pub crds: CrdConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    pub workers: usize,
    pub resync_period: Duration,
    /// How long to wait for a created child to show up in the cache
    pub child_sync_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrdConfig {
    pub install: bool,
    pub establish_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    pub sink: EventSinkKind,
    /// Reported as the event source component
    pub component: String,
    /// Reported as the event source host
    pub host: String,
    /// Pretty-print JSON from the stdout sink
    pub pretty: bool,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let secs = |key: &str, default: Duration| -> crate::Result<Duration> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| crate::Error::Config(format!("{} must be a whole number of seconds, got '{}'", key, v))),
                None => Ok(default),
            }
        };

        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(default)
        };

        let config = Config {
            controller: ControllerConfig {
                namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
                workers: match lookup("WORKERS") {
                    Some(v) => v
                        .trim()
                        .parse()
                        .map_err(|_| crate::Error::Config(format!("WORKERS must be a number, got '{}'", v)))?,
                    None => defaults.controller.workers,
                },
                resync_period: secs("RESYNC_PERIOD_SECS", defaults.controller.resync_period)?,
                child_sync_timeout: secs("CHILD_SYNC_TIMEOUT_SECS", defaults.controller.child_sync_timeout)?,
            },
            queue: QueueConfig {
                backoff_min: secs("QUEUE_BACKOFF_MIN_SECS", defaults.queue.backoff_min)?,
                backoff_max: secs("QUEUE_BACKOFF_MAX_SECS", defaults.queue.backoff_max)?,
            },
            crds: CrdConfig {
                install: flag("INSTALL_CRDS", defaults.crds.install),
                establish_timeout: secs("CRD_ESTABLISH_TIMEOUT_SECS", defaults.crds.establish_timeout)?,
            },
            events: EventsConfig {
                sink: match lookup("EVENT_SINK") {
                    Some(v) => v.parse()?,
                    None => defaults.events.sink,
                },
                component: lookup("CONTROLLER_NAME").unwrap_or(defaults.events.component),
                host: lookup("HOSTNAME")
                    .filter(|h| !h.trim().is_empty())
                    .or_else(system_hostname)
                    .unwrap_or(defaults.events.host),
                pretty: flag("EVENT_SINK_PRETTY", defaults.events.pretty),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.controller.workers == 0 {
            return Err(crate::Error::Config("WORKERS must be at least 1".to_string()));
        }
        if self.queue.backoff_min > self.queue.backoff_max {
            return Err(crate::Error::Config(format!(
                "queue backoff minimum ({:?}) exceeds maximum ({:?})",
                self.queue.backoff_min, self.queue.backoff_max
            )));
        }
        if self.controller.resync_period.is_zero() {
            return Err(crate::Error::Config("RESYNC_PERIOD_SECS must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller: ControllerConfig {
                namespace: None,
                workers: 1,
                resync_period: Duration::from_secs(30),
                child_sync_timeout: Duration::from_secs(60),
            },
            queue: QueueConfig {
                backoff_min: DEFAULT_BACKOFF_MIN,
                backoff_max: DEFAULT_BACKOFF_MAX,
            },
            crds: CrdConfig {
                install: true,
                establish_timeout: Duration::from_secs(60),
            },
            events: EventsConfig {
                sink: EventSinkKind::Kubernetes,
                component: "jobbatch-controller".to_string(),
                host: FALLBACK_HOST.to_string(),
                pretty: false,
            },
        }
    }
}

fn system_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .and_then(|contents| parse_hostname(&contents))
}

fn parse_hostname(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(String::from)
}
