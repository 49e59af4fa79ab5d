use std::env;
use std::time::Duration;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Longest the worker blocks on an empty mailbox before re-checking its status.
    pub poll_interval: Duration,
    /// Deadline for `call`. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Deadline for `stop`. `None` waits forever.
    pub stop_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            call_timeout: None,
            stop_timeout: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unparseable values keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = lookup("GENSERVER_POLL_INTERVAL_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                config.poll_interval = Duration::from_millis(ms).max(MIN_POLL_INTERVAL);
            }
        }

        if let Some(ms) = lookup("GENSERVER_CALL_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                config.call_timeout = Some(Duration::from_millis(ms));
            }
        }

        if let Some(ms) = lookup("GENSERVER_STOP_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse::<u64>() {
                config.stop_timeout = Some(Duration::from_millis(ms));
            }
        }

        config
    }

    /// Clamped to at least 1 ms.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }
}
