//! 用户配额模块
//!
//! 每日任务次数与等级判定。计数器的日窗口采用惰性重置：检查时发现已跨过
//! `day_window_start + 24h` 就在原地清零，不依赖后台定时器

mod enforcer;
mod sqlite;
mod store;

pub use enforcer::QuotaEnforcer;
pub use sqlite::SqliteQuotaStore;
pub use store::{MemoryQuotaStore, QuotaStore};

use crate::task::{OwnerId, Tier};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 日窗口长度
pub fn day_window() -> Duration {
    Duration::hours(24)
}

/// 用户每日配额记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub owner_id: OwnerId,
    /// 存储中的等级（高级会员过期后仍可能是 premium）
    pub tier: Tier,
    pub premium_expiry: Option<DateTime<Utc>>,
    pub tasks_used_today: u32,
    pub day_window_start: DateTime<Utc>,
}

impl UserQuota {
    /// 新用户（免费）
    pub fn new(owner_id: OwnerId, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            tier: Tier::Free,
            premium_expiry: None,
            tasks_used_today: 0,
            day_window_start: now,
        }
    }

    /// 当前生效的等级
    ///
    /// premium 只在 `premium_expiry > now` 时有效，没有过期时间视为无效
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        match (self.tier, self.premium_expiry) {
            (Tier::Premium, Some(expiry)) if expiry > now => Tier::Premium,
            _ => Tier::Free,
        }
    }

    /// 跨过日窗口时清零计数，返回是否发生了重置
    pub fn roll_window(&mut self, now: DateTime<Utc>) -> bool {
        if now >= self.day_window_start + day_window() {
            self.tasks_used_today = 0;
            self.day_window_start = now;
            true
        } else {
            false
        }
    }
}

/// 准入凭证
///
/// 记录占用的是哪个日窗口，回滚时只在窗口未变化时归还次数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub owner_id: OwnerId,
    /// 准入时生效的等级，任务处理期间不再变化
    pub tier: Tier,
    pub day_window_start: DateTime<Utc>,
}

/// 用量概览
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub owner_id: OwnerId,
    pub tier: Tier,
    pub premium_expiry: Option<DateTime<Utc>>,
    pub tasks_used_today: u32,
    /// None 表示不限次数
    pub daily_limit: Option<u32>,
    pub remaining: Option<u32>,
    pub max_file_size: u64,
    pub window_resets_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_tier() {
        let now = Utc::now();
        let mut quota = UserQuota::new(1, now);
        assert_eq!(quota.effective_tier(now), Tier::Free);

        quota.tier = Tier::Premium;
        quota.premium_expiry = Some(now + Duration::days(30));
        assert_eq!(quota.effective_tier(now), Tier::Premium);

        quota.premium_expiry = Some(now - Duration::seconds(1));
        assert_eq!(quota.effective_tier(now), Tier::Free);

        quota.premium_expiry = None;
        assert_eq!(quota.effective_tier(now), Tier::Free);
    }

    #[test]
    fn test_roll_window_resets_once() {
        let start = Utc::now();
        let mut quota = UserQuota::new(1, start);
        quota.tasks_used_today = 5;

        assert!(!quota.roll_window(start + Duration::hours(23)));
        assert_eq!(quota.tasks_used_today, 5);

        let later = start + Duration::hours(25);
        assert!(quota.roll_window(later));
        assert_eq!(quota.tasks_used_today, 0);
        assert_eq!(quota.day_window_start, later);

        quota.tasks_used_today = 2;
        assert!(!quota.roll_window(later + Duration::hours(1)));
        assert_eq!(quota.tasks_used_today, 2);
    }
}
