//! 字节速率限制

use std::time::{Duration, Instant};

/// 按字节/秒节流
///
/// 每次传输后调用 `pace`，返回为了不超过速率需要等待的时间
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    started: Instant,
    consumed: u64,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self::starting_at(bytes_per_sec, Instant::now())
    }

    pub fn starting_at(bytes_per_sec: u64, started: Instant) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            started,
            consumed: 0,
        }
    }

    /// 记录 `bytes` 并计算需要等待的时间
    pub fn pace_at(&mut self, bytes: u64, now: Instant) -> Duration {
        self.consumed += bytes;
        let expected = Duration::from_secs_f64(self.consumed as f64 / self.bytes_per_sec as f64);
        let elapsed = now.saturating_duration_since(self.started);
        expected.saturating_sub(elapsed)
    }

    /// 记录 `bytes`，必要时休眠
    pub async fn pace(&mut self, bytes: u64) {
        let wait = self.pace_at(bytes, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pace_delays_when_ahead() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(1000, start);

        // 瞬间发送 500 字节，应等待 0.5 秒
        assert_eq!(limiter.pace_at(500, start), Duration::from_millis(500));

        // 1 秒后累计 1000 字节，刚好不需要等待
        assert_eq!(
            limiter.pace_at(500, start + Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_pace_never_waits_when_behind() {
        let start = Instant::now();
        let mut limiter = RateLimiter::starting_at(1000, start);
        assert_eq!(
            limiter.pace_at(100, start + Duration::from_secs(5)),
            Duration::ZERO
        );
    }
}
