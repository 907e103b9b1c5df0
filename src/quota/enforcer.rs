use super::{day_window, QuotaStore, Reservation, UsageSummary, UserQuota};
use crate::config::QuotaConfig;
use crate::error::AdmissionError;
use crate::task::{OwnerId, Tier};
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// 配额检查器
///
/// 同一用户的读-改-写通过该用户自己的锁串行化，不同用户之间互不阻塞
pub struct QuotaEnforcer {
    store: Arc<dyn QuotaStore>,
    limits: QuotaConfig,
    owner_locks: DashMap<OwnerId, Arc<Mutex<()>>>,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn QuotaStore>, limits: QuotaConfig) -> Self {
        Self {
            store,
            limits,
            owner_locks: DashMap::new(),
        }
    }

    pub fn limits(&self) -> &QuotaConfig {
        &self.limits
    }

    /// 等级对应的单文件上限
    pub fn max_size(&self, tier: Tier) -> u64 {
        self.limits.max_size(tier)
    }

    /// 获取用户锁；最后一个持有者释放时移除该用户的锁
    async fn lock_owner(&self, owner_id: OwnerId) -> OwnerGuard<'_> {
        // 先 clone 出 Arc 再释放分片锁，避免跨 await 持有 DashMap 的引用
        let lock = self.owner_locks.entry(owner_id).or_default().clone();
        OwnerGuard {
            locks: &self.owner_locks,
            owner_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load_or_new(&self, owner_id: OwnerId, now: DateTime<Utc>) -> Result<UserQuota> {
        Ok(self
            .store
            .load(owner_id)
            .await?
            .unwrap_or_else(|| UserQuota::new(owner_id, now)))
    }

    /// 检查并占用一次当日次数
    pub async fn check_and_reserve(&self, owner_id: OwnerId) -> Result<Reservation, AdmissionError> {
        self.check_and_reserve_at(owner_id, Utc::now()).await
    }

    pub async fn check_and_reserve_at(
        &self,
        owner_id: OwnerId,
        now: DateTime<Utc>,
    ) -> Result<Reservation, AdmissionError> {
        let _guard = self.lock_owner(owner_id).await;

        let mut quota = self.load_or_new(owner_id, now).await?;
        if quota.roll_window(now) {
            debug!("用户 {} 日窗口已重置", owner_id);
        }

        let tier = quota.effective_tier(now);
        if tier == Tier::Free && quota.tier == Tier::Premium {
            debug!("用户 {} 高级会员已过期，按免费用户处理", owner_id);
        }

        if let Some(limit) = self.limits.daily_limit(tier) {
            if quota.tasks_used_today >= limit {
                info!(
                    "用户 {} 每日次数已用完: {}/{} ({})",
                    owner_id,
                    quota.tasks_used_today,
                    limit,
                    tier.as_str()
                );
                return Err(AdmissionError::DailyLimitReached {
                    used: quota.tasks_used_today,
                    limit,
                });
            }
        }

        quota.tasks_used_today += 1;
        self.store.save(&quota).await?;

        debug!(
            "用户 {} 准入通过: 今日已用 {} ({})",
            owner_id,
            quota.tasks_used_today,
            tier.as_str()
        );

        Ok(Reservation {
            owner_id,
            tier,
            day_window_start: quota.day_window_start,
        })
    }

    /// 回滚准入占用的次数
    ///
    /// 只有日窗口未变化时才归还，返回是否实际归还
    pub async fn release(&self, reservation: &Reservation) -> Result<bool> {
        let _guard = self.lock_owner(reservation.owner_id).await;

        let Some(mut quota) = self.store.load(reservation.owner_id).await? else {
            return Ok(false);
        };
        if quota.day_window_start != reservation.day_window_start || quota.tasks_used_today == 0 {
            debug!("用户 {} 日窗口已变化，跳过回滚", reservation.owner_id);
            return Ok(false);
        }

        quota.tasks_used_today -= 1;
        self.store.save(&quota).await?;
        info!(
            "用户 {} 准入已回滚: 今日已用 {}",
            reservation.owner_id, quota.tasks_used_today
        );
        Ok(true)
    }

    /// 设置用户等级（管理操作）
    pub async fn set_tier(
        &self,
        owner_id: OwnerId,
        tier: Tier,
        premium_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let _guard = self.lock_owner(owner_id).await;

        let mut quota = self.load_or_new(owner_id, Utc::now()).await?;
        quota.tier = tier;
        quota.premium_expiry = premium_expiry;
        self.store.save(&quota).await?;
        info!(
            "用户 {} 等级已更新: {} (到期: {:?})",
            owner_id,
            tier.as_str(),
            premium_expiry
        );
        Ok(())
    }

    pub async fn usage(&self, owner_id: OwnerId) -> Result<UsageSummary> {
        self.usage_at(owner_id, Utc::now()).await
    }

    /// 用量概览（只读，不写回窗口重置）
    pub async fn usage_at(&self, owner_id: OwnerId, now: DateTime<Utc>) -> Result<UsageSummary> {
        let mut quota = self.load_or_new(owner_id, now).await?;
        quota.roll_window(now);

        let tier = quota.effective_tier(now);
        let daily_limit = self.limits.daily_limit(tier);
        Ok(UsageSummary {
            owner_id,
            tier,
            premium_expiry: quota.premium_expiry,
            tasks_used_today: quota.tasks_used_today,
            daily_limit,
            remaining: daily_limit.map(|l| l.saturating_sub(quota.tasks_used_today)),
            max_file_size: self.limits.max_size(tier),
            window_resets_at: quota.day_window_start + day_window(),
        })
    }
}

/// 用户锁的持有凭证
struct OwnerGuard<'a> {
    locks: &'a DashMap<OwnerId, Arc<Mutex<()>>>,
    owner_id: OwnerId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // 只剩表里的引用时说明没有其他等待者
        self.locks
            .remove_if(&self.owner_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::MemoryQuotaStore;
    use chrono::Duration;

    fn enforcer_with(store: Arc<MemoryQuotaStore>) -> QuotaEnforcer {
        QuotaEnforcer::new(store, QuotaConfig::default())
    }

    async fn seed(store: &MemoryQuotaStore, quota: UserQuota) {
        store.save(&quota).await.unwrap();
    }

    #[tokio::test]
    async fn test_free_limit_boundary() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = enforcer_with(store.clone());
        let now = Utc::now();

        let mut quota = UserQuota::new(1, now);
        quota.tasks_used_today = 4;
        seed(&store, quota).await;

        // limit - 1 时允许，之后计数变为 limit
        let reservation = enforcer.check_and_reserve_at(1, now).await.unwrap();
        assert_eq!(reservation.tier, Tier::Free);
        assert_eq!(store.load(1).await.unwrap().unwrap().tasks_used_today, 5);

        // 达到 limit 时拒绝
        match enforcer.check_and_reserve_at(1, now).await {
            Err(AdmissionError::DailyLimitReached { used, limit }) => {
                assert_eq!(used, 5);
                assert_eq!(limit, 5);
            }
            other => panic!("expected denial, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lazy_reset_after_window() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = enforcer_with(store.clone());
        let start = Utc::now();

        let mut quota = UserQuota::new(1, start);
        quota.tasks_used_today = 5;
        seed(&store, quota).await;

        assert!(enforcer
            .check_and_reserve_at(1, start + Duration::hours(12))
            .await
            .is_err());

        let later = start + Duration::hours(24);
        enforcer.check_and_reserve_at(1, later).await.unwrap();
        let stored = store.load(1).await.unwrap().unwrap();
        assert_eq!(stored.tasks_used_today, 1);
        assert_eq!(stored.day_window_start, later);
    }

    #[tokio::test]
    async fn test_premium_never_denied_on_count() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = enforcer_with(store.clone());
        let now = Utc::now();

        let mut quota = UserQuota::new(2, now);
        quota.tier = Tier::Premium;
        quota.premium_expiry = Some(now + Duration::days(1));
        quota.tasks_used_today = 500;
        seed(&store, quota).await;

        let reservation = enforcer.check_and_reserve_at(2, now).await.unwrap();
        assert_eq!(reservation.tier, Tier::Premium);
    }

    #[tokio::test]
    async fn test_expired_premium_treated_as_free() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = enforcer_with(store.clone());
        let now = Utc::now();

        let mut quota = UserQuota::new(3, now);
        quota.tier = Tier::Premium;
        quota.premium_expiry = Some(now - Duration::minutes(1));
        quota.tasks_used_today = 5;
        seed(&store, quota.clone()).await;

        assert!(matches!(
            enforcer.check_and_reserve_at(3, now).await,
            Err(AdmissionError::DailyLimitReached { .. })
        ));

        quota.tasks_used_today = 0;
        seed(&store, quota).await;
        let reservation = enforcer.check_and_reserve_at(3, now).await.unwrap();
        assert_eq!(reservation.tier, Tier::Free);

        // 不会隐式改写存储中的等级
        assert_eq!(store.load(3).await.unwrap().unwrap().tier, Tier::Premium);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_serialized() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = Arc::new(enforcer_with(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let enforcer = enforcer.clone();
            handles.push(tokio::spawn(async move {
                enforcer.check_and_reserve(9).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 5);
        assert_eq!(store.load(9).await.unwrap().unwrap().tasks_used_today, 5);
        assert!(enforcer.owner_locks.is_empty());
    }

    #[tokio::test]
    async fn test_owner_locks_are_pruned() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = enforcer_with(store);

        for owner in 0..100 {
            let reservation = enforcer.check_and_reserve(owner).await.unwrap();
            enforcer.release(&reservation).await.unwrap();
        }
        enforcer.set_tier(7, Tier::Premium, None).await.unwrap();
        assert!(enforcer.owner_locks.is_empty());

        // 持有期间其他用户的锁互不影响
        let held = enforcer.lock_owner(1).await;
        let _ = enforcer.check_and_reserve(2).await.unwrap();
        assert_eq!(enforcer.owner_locks.len(), 1);
        drop(held);
        assert!(enforcer.owner_locks.is_empty());
    }

    #[tokio::test]
    async fn test_release_only_within_same_window() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = enforcer_with(store.clone());
        let start = Utc::now();

        let reservation = enforcer.check_and_reserve_at(4, start).await.unwrap();
        assert!(enforcer.release(&reservation).await.unwrap());
        assert_eq!(store.load(4).await.unwrap().unwrap().tasks_used_today, 0);

        let stale = enforcer.check_and_reserve_at(4, start).await.unwrap();
        enforcer
            .check_and_reserve_at(4, start + Duration::hours(25))
            .await
            .unwrap();
        assert!(!enforcer.release(&stale).await.unwrap());
        assert_eq!(store.load(4).await.unwrap().unwrap().tasks_used_today, 1);
    }

    #[tokio::test]
    async fn test_usage_summary() {
        let store = Arc::new(MemoryQuotaStore::new());
        let enforcer = enforcer_with(store.clone());
        let now = Utc::now();

        enforcer.check_and_reserve_at(5, now).await.unwrap();
        enforcer.check_and_reserve_at(5, now).await.unwrap();

        let usage = enforcer.usage_at(5, now).await.unwrap();
        assert_eq!(usage.tasks_used_today, 2);
        assert_eq!(usage.daily_limit, Some(5));
        assert_eq!(usage.remaining, Some(3));
        assert_eq!(usage.max_file_size, 200 * 1024 * 1024);

        enforcer
            .set_tier(5, Tier::Premium, Some(now + Duration::days(30)))
            .await
            .unwrap();
        let usage = enforcer.usage_at(5, now).await.unwrap();
        assert_eq!(usage.tier, Tier::Premium);
        assert_eq!(usage.remaining, None);
    }
}
