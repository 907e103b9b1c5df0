use super::UserQuota;
use crate::task::OwnerId;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// 用户配额存储
///
/// 以 owner_id 为键的读-改-写存储，串行化由 `QuotaEnforcer` 负责
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn load(&self, owner_id: OwnerId) -> Result<Option<UserQuota>>;

    async fn save(&self, quota: &UserQuota) -> Result<()>;
}

/// 内存存储（未配置数据库时使用）
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    records: DashMap<OwnerId, UserQuota>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn load(&self, owner_id: OwnerId) -> Result<Option<UserQuota>> {
        Ok(self.records.get(&owner_id).map(|r| r.clone()))
    }

    async fn save(&self, quota: &UserQuota) -> Result<()> {
        self.records.insert(quota.owner_id, quota.clone());
        Ok(())
    }
}
