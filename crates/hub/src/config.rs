//! Runtime configuration from `HUB_*` environment variables.
//!
//! Unset or unparsable values fall back to the defaults.

use std::time::Duration;

use tracing::warn;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct HubConfig {
    pub retry: RetryPolicy,
    /// Upper bound on one `sync` call; `None` disables the deadline.
    pub sync_timeout: Option<Duration>,
    pub workers: usize,
    pub queue_cap: usize,
    pub prune_membership: bool,
    /// Periodic re-enqueue of every cluster set; `None` disables it.
    pub resync_interval: Option<Duration>,
    pub requeue_base: Duration,
    pub requeue_max: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            sync_timeout: Some(Duration::from_secs(30)),
            workers: 2,
            queue_cap: 4096,
            prune_membership: false,
            resync_interval: Some(Duration::from_secs(300)),
            requeue_base: Duration::from_millis(5),
            requeue_max: Duration::from_secs(300),
        }
    }
}

fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(key, value = %raw, "ignoring unparsable boolean setting");
            None
        }
    }
}

/// Seconds; `0` turns the feature off.
fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Option<Duration>) -> Option<Duration> {
    match parse::<u64>(lookup, key) {
        Some(0) => None,
        Some(s) => Some(Duration::from_secs(s)),
        None => default,
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let retry = RetryPolicy {
            steps: parse::<u32>(&lookup, "HUB_RETRY_STEPS").map(|s| s.max(1)).unwrap_or(d.retry.steps),
            initial_delay: parse::<u64>(&lookup, "HUB_RETRY_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.retry.initial_delay),
            factor: parse::<f64>(&lookup, "HUB_RETRY_FACTOR").filter(|f| f.is_finite() && *f >= 1.0).unwrap_or(d.retry.factor),
            jitter: parse::<f64>(&lookup, "HUB_RETRY_JITTER").filter(|j| j.is_finite() && (0.0..=1.0).contains(j)).unwrap_or(d.retry.jitter),
            max_delay: d.retry.max_delay,
        };
        Self {
            retry,
            sync_timeout: parse_secs(&lookup, "HUB_SYNC_TIMEOUT_SECS", d.sync_timeout),
            workers: parse::<usize>(&lookup, "HUB_WORKERS").map(|w| w.max(1)).unwrap_or(d.workers),
            queue_cap: parse::<usize>(&lookup, "HUB_QUEUE_CAP").map(|c| c.max(1)).unwrap_or(d.queue_cap),
            prune_membership: parse_bool(&lookup, "HUB_PRUNE_MEMBERSHIP").unwrap_or(d.prune_membership),
            resync_interval: parse_secs(&lookup, "HUB_RESYNC_SECS", d.resync_interval),
            requeue_base: parse::<u64>(&lookup, "HUB_REQUEUE_BASE_MS").map(Duration::from_millis).unwrap_or(d.requeue_base),
            requeue_max: parse::<u64>(&lookup, "HUB_REQUEUE_MAX_SECS").map(Duration::from_secs).unwrap_or(d.requeue_max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> HubConfig {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        HubConfig::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(from(&[]), HubConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = from(&[
            ("HUB_RETRY_STEPS", "6"),
            ("HUB_RETRY_INITIAL_MS", "20"),
            ("HUB_WORKERS", "8"),
            ("HUB_PRUNE_MEMBERSHIP", "true"),
            ("HUB_SYNC_TIMEOUT_SECS", "0"),
            ("HUB_RESYNC_SECS", "60"),
        ]);
        assert_eq!(cfg.retry.steps, 6);
        assert_eq!(cfg.retry.initial_delay, Duration::from_millis(20));
        assert_eq!(cfg.workers, 8);
        assert!(cfg.prune_membership);
        assert_eq!(cfg.sync_timeout, None);
        assert_eq!(cfg.resync_interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = from(&[("HUB_RETRY_STEPS", "many"), ("HUB_RETRY_FACTOR", "0.5"), ("HUB_PRUNE_MEMBERSHIP", "maybe"), ("HUB_WORKERS", "0")]);
        let d = HubConfig::default();
        assert_eq!(cfg.retry.steps, d.retry.steps);
        assert_eq!(cfg.retry.factor, d.retry.factor);
        assert!(!cfg.prune_membership);
        assert_eq!(cfg.workers, 1);
    }

    #[test]
    fn non_finite_or_out_of_range_backoff_falls_back() {
        let d = HubConfig::default();
        for jitter in ["inf", "NaN", "1e300", "-0.5", "1.5"] {
            let cfg = from(&[("HUB_RETRY_JITTER", jitter)]);
            assert_eq!(cfg.retry.jitter, d.retry.jitter, "jitter={}", jitter);
            assert!(cfg.retry.delay(1) <= cfg.retry.max_delay);
        }
        for factor in ["inf", "NaN"] {
            let cfg = from(&[("HUB_RETRY_FACTOR", factor)]);
            assert_eq!(cfg.retry.factor, d.retry.factor, "factor={}", factor);
        }
        let cfg = from(&[("HUB_RETRY_JITTER", "1.0"), ("HUB_RETRY_FACTOR", "2.5")]);
        assert_eq!(cfg.retry.jitter, 1.0);
        assert_eq!(cfg.retry.factor, 2.5);
        assert!(cfg.retry.delay(1) <= cfg.retry.base_delay(1) * 2);
    }
}
