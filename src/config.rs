//! Coordinator configuration.

use std::time::Duration;

use crate::observer::DEFAULT_EVENT_CAPACITY;

/// Default interval between connect-deadline checks.
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Shortest accepted interval between connect-deadline checks.
pub const MIN_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Tunables for a [`crate::CentralCoordinator`] and the manager running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Give up on a connect request that has not completed after this long.
    /// `None` waits indefinitely, as the radio itself does.
    pub connect_timeout: Option<Duration>,
    /// How often the manager looks for overdue connect requests. Values
    /// below [`MIN_TIMEOUT_CHECK_INTERVAL`] are raised to it.
    pub timeout_check_interval: Duration,
    /// Re-identify and reconnect persisted peripherals whenever a scan starts.
    pub reacquire_on_scan: bool,
    /// Capacity of the broadcast event mirror.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            timeout_check_interval: DEFAULT_TIMEOUT_CHECK_INTERVAL,
            reacquire_on_scan: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    /// Bound connect requests.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set how often connect deadlines are checked.
    pub fn with_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval.max(MIN_TIMEOUT_CHECK_INTERVAL);
        self
    }

    /// The check interval actually used, never zero.
    pub fn effective_timeout_check_interval(&self) -> Duration {
        self.timeout_check_interval.max(MIN_TIMEOUT_CHECK_INTERVAL)
    }

    /// Enable or disable reacquisition at scan start.
    pub fn with_reacquire_on_scan(mut self, enabled: bool) -> Self {
        self.reacquire_on_scan = enabled;
        self
    }

    /// Set the broadcast mirror capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.connect_timeout, None);
        assert_eq!(config.timeout_check_interval, Duration::from_secs(1));
        assert!(config.reacquire_on_scan);
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_builders() {
        let config = CoordinatorConfig::default()
            .with_connect_timeout(Duration::from_secs(10))
            .with_timeout_check_interval(Duration::from_millis(250))
            .with_reacquire_on_scan(false)
            .with_event_capacity(8);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.timeout_check_interval, Duration::from_millis(250));
        assert!(!config.reacquire_on_scan);
        assert_eq!(config.event_capacity, 8);
    }

    #[test]
    fn test_zero_check_interval_is_raised() {
        let config = CoordinatorConfig::default().with_timeout_check_interval(Duration::ZERO);
        assert_eq!(config.timeout_check_interval, MIN_TIMEOUT_CHECK_INTERVAL);

        let config = CoordinatorConfig {
            timeout_check_interval: Duration::ZERO,
            ..CoordinatorConfig::default()
        };
        assert_eq!(
            config.effective_timeout_check_interval(),
            MIN_TIMEOUT_CHECK_INTERVAL
        );
    }
}
