//! 等待调度的任务集合
//!
//! 先按等级优先级、再按提交顺序排列

use crate::task::{OwnerId, TaskId, Tier};
use std::collections::{BTreeMap, HashMap};

/// (优先级, 提交序号)
type PendingKey = (u8, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub task_id: TaskId,
    pub owner_id: OwnerId,
    pub tier: Tier,
}

#[derive(Debug, Default)]
pub struct PendingSet {
    ordered: BTreeMap<PendingKey, PendingEntry>,
    keys: HashMap<TaskId, PendingKey>,
    next_seq: u64,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: &str, owner_id: OwnerId, tier: Tier) {
        let key = (tier.priority(), self.next_seq);
        self.next_seq += 1;
        self.keys.insert(task_id.to_string(), key);
        self.ordered.insert(
            key,
            PendingEntry {
                task_id: task_id.to_string(),
                owner_id,
                tier,
            },
        );
    }

    pub fn remove(&mut self, task_id: &str) -> Option<PendingEntry> {
        let key = self.keys.remove(task_id)?;
        self.ordered.remove(&key)
    }

    /// 取出第一个满足 `ready` 的任务
    ///
    /// 排在前面但用户槽位已满的任务会被跳过，保持原位置
    pub fn take_first<F>(&mut self, mut ready: F) -> Option<PendingEntry>
    where
        F: FnMut(&PendingEntry) -> bool,
    {
        let key = self
            .ordered
            .iter()
            .find(|(_, entry)| ready(entry))
            .map(|(key, _)| *key)?;
        let entry = self.ordered.remove(&key)?;
        self.keys.remove(&entry.task_id);
        Some(entry)
    }

    /// 清空并返回全部任务
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        self.keys.clear();
        std::mem::take(&mut self.ordered).into_values().collect()
    }

    /// 按调度顺序的位置（从 1 开始）
    pub fn position(&self, task_id: &str) -> Option<usize> {
        let key = self.keys.get(task_id)?;
        Some(self.ordered.range(..*key).count() + 1)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.keys.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
