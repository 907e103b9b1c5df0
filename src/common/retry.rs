//! 重试与指数退避

use crate::config::RetryConfig;
use std::time::Duration;

/// 重试策略
///
/// 延迟序列为 `initial * 2^attempt`，不超过 `max`。被限流时至少等待对方要求的时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    /// 第 `attempt` 次重试（从 0 开始）前的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// 限流时的等待时间
    pub fn delay_rate_limited(&self, attempt: u32, retry_after: Duration) -> Duration {
        self.delay(attempt).max(retry_after)
    }

    /// 是否还能继续重试
    pub fn can_retry(&self, retries_used: u32) -> bool {
        retries_used < self.max_retries
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(5000));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(10), Duration::from_millis(5000));
        assert_eq!(policy.delay(64), Duration::from_millis(5000));
    }

    #[test]
    fn test_rate_limited_waits_longer() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(5000));
        assert_eq!(
            policy.delay_rate_limited(0, Duration::from_secs(10)),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.delay_rate_limited(3, Duration::from_millis(10)),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn test_from_config() {
        let policy: RetryPolicy = RetryConfig::default().into();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert!(policy.can_retry(2));
        assert!(!policy.can_retry(3));
    }
}
