//! Worker schedule and retry settings

use std::time::Duration;

use anyhow::Context;

const DEFAULT_RESYNC_SCHEDULE: &str = "0 0 */6 * * *";
const DEFAULT_INVARIANT_SCHEDULE: &str = "0 30 3 * * *";
const DEFAULT_RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Cron expression (with seconds) for the full re-sync
    pub resync_schedule: String,
    /// Cron expression for the invariant check and heal pass
    pub invariant_schedule: String,
    /// Retries after the first attempt for retryable failures
    pub retry_attempts: usize,
    pub log_json: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            resync_schedule: DEFAULT_RESYNC_SCHEDULE.to_string(),
            invariant_schedule: DEFAULT_INVARIANT_SCHEDULE.to_string(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            log_json: false,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let retry_attempts = match lookup("WORKER_RETRY_ATTEMPTS") {
            Some(v) => v
                .parse()
                .with_context(|| format!("WORKER_RETRY_ATTEMPTS must be a number, got {:?}", v))?,
            None => defaults.retry_attempts,
        };

        Ok(Self {
            resync_schedule: lookup("WORKER_RESYNC_CRON").unwrap_or(defaults.resync_schedule),
            invariant_schedule: lookup("WORKER_INVARIANT_CRON")
                .unwrap_or(defaults.invariant_schedule),
            retry_attempts,
            log_json: lookup("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    /// Backoff of 1s, 2s, 4s... capped at 30s, `retry_attempts` long
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        tokio_retry::strategy::ExponentialBackoff::from_millis(2)
            .factor(500)
            .max_delay(Duration::from_secs(30))
            .take(self.retry_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.resync_schedule, DEFAULT_RESYNC_SCHEDULE);
        assert_eq!(config.retry_attempts, 3);
        assert!(!config.log_json);
    }

    #[test]
    fn test_overrides_and_json_logging() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_RESYNC_CRON", "0 */15 * * * *"),
            ("WORKER_RETRY_ATTEMPTS", "5"),
            ("LOG_FORMAT", "JSON"),
        ]))
        .unwrap();
        assert_eq!(config.resync_schedule, "0 */15 * * * *");
        assert_eq!(config.retry_attempts, 5);
        assert!(config.log_json);
    }

    #[test]
    fn test_invalid_retry_count_is_an_error() {
        assert!(WorkerConfig::from_lookup(lookup(&[("WORKER_RETRY_ATTEMPTS", "many")])).is_err());
    }

    #[test]
    fn test_backoff_grows_and_is_bounded() {
        let delays: Vec<Duration> = WorkerConfig::default().backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }
}
