//! 工作槽位池
//!
//! 全局槽位数即工作池大小，另外按用户、按免费等级分别计数。
//! 只在调度器锁内访问，分配和释放都是同步操作

use crate::task::{OwnerId, TaskId, Tier};
use std::collections::HashMap;
use tracing::{debug, info};

/// 工作槽位
#[derive(Debug, Clone)]
pub struct QueueSlot {
    /// 槽位ID
    pub id: usize,
    /// 占用此位的任务
    pub task_id: Option<TaskId>,
    pub owner_id: Option<OwnerId>,
    pub tier: Option<Tier>,
}

impl QueueSlot {
    fn new(id: usize) -> Self {
        Self {
            id,
            task_id: None,
            owner_id: None,
            tier: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.task_id.is_none()
    }

    fn allocate(&mut self, task_id: &str, owner_id: OwnerId, tier: Tier) {
        self.task_id = Some(task_id.to_string());
        self.owner_id = Some(owner_id);
        self.tier = Some(tier);
    }

    fn release(&mut self) {
        self.task_id = None;
        self.owner_id = None;
        self.tier = None;
    }
}

/// 槽位池
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<QueueSlot>,
    per_owner_cap: usize,
    /// 免费任务合计上限
    free_tier_cap: Option<usize>,
    owner_active: HashMap<OwnerId, usize>,
    free_active: usize,
}

impl SlotPool {
    pub fn new(max_slots: usize, per_owner_cap: usize, free_tier_cap: Option<usize>) -> Self {
        info!(
            "创建工作槽位池: 全局 {}, 每用户 {}, 免费合计 {:?}",
            max_slots, per_owner_cap, free_tier_cap
        );
        Self {
            slots: (0..max_slots).map(QueueSlot::new).collect(),
            per_owner_cap,
            free_tier_cap,
            owner_active: HashMap::new(),
            free_active: 0,
        }
    }

    pub fn max_slots(&self) -> usize {
        self.slots.len()
    }

    /// 该用户 / 等级当前能否再占用一个槽位
    pub fn can_allocate(&self, owner_id: OwnerId, tier: Tier) -> bool {
        if self.available_slots() == 0 {
            return false;
        }
        if self.owner_active(owner_id) >= self.per_owner_cap {
            return false;
        }
        match (tier, self.free_tier_cap) {
            (Tier::Free, Some(cap)) => self.free_active < cap,
            _ => true,
        }
    }

    /// 分配槽位，任一上限已满时返回 None
    pub fn allocate(&mut self, task_id: &str, owner_id: OwnerId, tier: Tier) -> Option<usize> {
        if !self.can_allocate(owner_id, tier) {
            debug!("无可用工作槽位: task_id={}, owner={}", task_id, owner_id);
            return None;
        }

        let slot = self.slots.iter_mut().find(|s| s.is_free())?;
        slot.allocate(task_id, owner_id, tier);
        let slot_id = slot.id;

        *self.owner_active.entry(owner_id).or_insert(0) += 1;
        if tier == Tier::Free {
            self.free_active += 1;
        }

        info!(
            "分配工作槽位: slot_id={}, task_id={}, owner={}, tier={}",
            slot_id,
            task_id,
            owner_id,
            tier.as_str()
        );
        Some(slot_id)
    }

    /// 释放任务占用的槽位，返回槽位ID
    pub fn release(&mut self, task_id: &str) -> Option<usize> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.task_id.as_deref() == Some(task_id))?;

        let owner_id = slot.owner_id;
        let tier = slot.tier;
        let slot_id = slot.id;
        slot.release();

        if let Some(owner_id) = owner_id {
            if let Some(count) = self.owner_active.get_mut(&owner_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.owner_active.remove(&owner_id);
                }
            }
        }
        if tier == Some(Tier::Free) {
            self.free_active = self.free_active.saturating_sub(1);
        }

        info!("释放工作槽位: slot_id={}, task_id={}", slot_id, task_id);
        Some(slot_id)
    }

    pub fn available_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }

    pub fn used_slots(&self) -> usize {
        self.slots.len() - self.available_slots()
    }

    pub fn owner_active(&self, owner_id: OwnerId) -> usize {
        self.owner_active.get(&owner_id).copied().unwrap_or(0)
    }

    /// 任务占用的槽位
    pub fn task_slot(&self, task_id: &str) -> Option<&QueueSlot> {
        self.slots
            .iter()
            .find(|s| s.task_id.as_deref() == Some(task_id))
    }
}
