//! 状态消息编辑节流器
//!
//! 控制进度消息的编辑频率，避免触发消息通道自身的防刷限制

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 进度编辑节流器
///
/// 原子时间戳 + CAS，多个上报方共享同一个节流器时也只有一个能通过
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 相对 `origin` 的上次放行时间（纳秒），0 表示从未放行
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
    origin: Instant,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
            origin: Instant::now(),
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距离上次放行已超过间隔时返回 true 并记录本次时间
    ///
    /// 第一次调用总是放行
    pub fn should_emit(&self) -> bool {
        // +1 保证第一次调用时的时间戳不为 0
        let now = self.elapsed_nanos() + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制放行（最后一次更新）
    pub fn force_emit(&self) {
        let now = self.elapsed_nanos() + 1;
        self.last_emit_nanos.store(now, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(0, Ordering::Relaxed);
    }

    fn elapsed_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttler_basic() {
        let throttler = ProgressThrottler::with_millis(100);
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_throttler_after_interval() {
        let throttler = ProgressThrottler::with_millis(50);
        assert!(throttler.should_emit());
        thread::sleep(Duration::from_millis(60));
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_force_emit_restarts_interval() {
        let throttler = ProgressThrottler::with_millis(1000);
        throttler.force_emit();
        assert!(!throttler.should_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_zero_interval_always_emits() {
        let throttler = ProgressThrottler::new(Duration::ZERO);
        assert!(throttler.should_emit());
        assert!(throttler.should_emit());
    }
}
