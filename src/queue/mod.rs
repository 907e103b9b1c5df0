//! 任务队列
//!
//! 准入（配额检查）→ 排队（等级优先，同等级先进先出）→ 分配工作槽位 → 处理流程。
//! 调度状态（等待集合 + 槽位计数）只通过 `TaskQueue` 的方法修改

mod pending;
mod pipeline;
mod slots;
mod stats;

pub use pending::{PendingEntry, PendingSet};
pub use slots::{QueueSlot, SlotPool};
pub use stats::{render_summary, OwnerStats, QueuePosition};

use crate::channel::MessagingChannel;
use crate::config::{AppConfig, QueueConfig};
use crate::downloader::DownloadWorker;
use crate::error::{AdmissionError, TransferError};
use crate::progress::{render_status, ProgressSnapshot, ProgressTracker};
use crate::quota::{QuotaEnforcer, Reservation};
use crate::source::SourceResolver;
use crate::task::{OwnerId, SourceDescriptor, Task, TaskErrorKind, TaskId, TaskSnapshot, TaskState};
use crate::thumbnail::ThumbnailGenerator;
use crate::uploader::UploadWorker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use pipeline::{cancelled_text, failure_text, Pipeline};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 队列中的任务
pub(crate) struct TaskEntry {
    pub task: RwLock<Task>,
    /// 取消令牌（队列关闭令牌的子令牌）
    pub cancel: CancellationToken,
    pub reservation: Reservation,
}

/// 调度状态
struct Scheduler {
    pending: PendingSet,
    slots: SlotPool,
}

impl Scheduler {
    /// 取出下一个可以运行的任务并占用槽位
    fn next_ready(&mut self) -> Option<PendingEntry> {
        let slots = &self.slots;
        let entry = self
            .pending
            .take_first(|e| slots.can_allocate(e.owner_id, e.tier))?;
        self.slots.allocate(&entry.task_id, entry.owner_id, entry.tier)?;
        Some(entry)
    }
}

/// 槽位占用凭证，任何退出路径（包括 panic）都会在 drop 时归还槽位
struct SlotGuard {
    scheduler: Arc<Mutex<Scheduler>>,
    wakeup: Arc<Notify>,
    task_id: TaskId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.scheduler.lock().slots.release(&self.task_id);
        self.wakeup.notify_one();
    }
}

/// 队列依赖的外部组件
pub struct QueueDeps {
    pub quota: Arc<QuotaEnforcer>,
    pub resolver: Arc<dyn SourceResolver>,
    pub channel: Arc<dyn MessagingChannel>,
    /// 默认缩略图下载用
    pub http: reqwest::Client,
}

pub struct TaskQueue {
    tasks: DashMap<TaskId, Arc<TaskEntry>>,
    scheduler: Arc<Mutex<Scheduler>>,
    wakeup: Arc<Notify>,
    pipeline: Arc<Pipeline>,
    quota: Arc<QuotaEnforcer>,
    channel: Arc<dyn MessagingChannel>,
    tracker: Arc<ProgressTracker>,
    config: QueueConfig,
    bar_segments: usize,
    shutdown: CancellationToken,
}

impl TaskQueue {
    /// 创建队列并启动调度和清理后台任务
    ///
    /// 必须在 tokio 运行时中调用
    pub fn new(config: &AppConfig, deps: QueueDeps) -> Arc<Self> {
        let tracker = Arc::new(ProgressTracker::new(config.progress.speed_window()));
        let pipeline = Pipeline {
            quota: deps.quota.clone(),
            resolver: deps.resolver.clone(),
            channel: deps.channel.clone(),
            downloader: DownloadWorker::new(deps.resolver, &config.download),
            uploader: UploadWorker::new(
                deps.channel.clone(),
                &config.upload,
                deps.http,
                config.thumbnail.default_url.clone(),
            ),
            thumbnails: ThumbnailGenerator::new(config.thumbnail.clone()),
            tracker: tracker.clone(),
            download: config.download.clone(),
            progress: config.progress.clone(),
            log_target: config.channel.log_target,
        };

        let queue_config = config.queue.clone();
        let scheduler = Scheduler {
            pending: PendingSet::new(),
            slots: SlotPool::new(
                queue_config.worker_pool_size,
                queue_config.per_owner_cap,
                queue_config.free_tier_cap,
            ),
        };

        let queue = Arc::new(Self {
            tasks: DashMap::new(),
            scheduler: Arc::new(Mutex::new(scheduler)),
            wakeup: Arc::new(Notify::new()),
            pipeline: Arc::new(pipeline),
            quota: deps.quota,
            channel: deps.channel,
            tracker,
            config: queue_config,
            bar_segments: config.progress.bar_segments,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::dispatch_loop(
            Arc::downgrade(&queue),
            queue.wakeup.clone(),
            queue.shutdown.clone(),
        ));
        tokio::spawn(Self::sweep_loop(
            Arc::downgrade(&queue),
            Duration::from_secs(queue.config.sweep_interval_secs.max(1)),
            queue.shutdown.clone(),
        ));

        info!(
            "任务队列已启动: 工作池 {}, 每用户并发 {}",
            queue.config.worker_pool_size, queue.config.per_owner_cap
        );
        queue
    }

    pub fn quota(&self) -> &Arc<QuotaEnforcer> {
        &self.quota
    }

    /// 提交任务
    pub async fn submit(
        &self,
        owner_id: OwnerId,
        source: SourceDescriptor,
    ) -> Result<TaskId, AdmissionError> {
        if self.shutdown.is_cancelled() {
            return Err(AdmissionError::ShuttingDown);
        }

        let reservation = match self.quota.check_and_reserve(owner_id).await {
            Ok(reservation) => reservation,
            Err(e) => {
                info!("用户 {} 提交被拒绝: {}", owner_id, e);
                return Err(e);
            }
        };

        let task = Task::new(owner_id, source, reservation.tier);
        let task_id = task.id.clone();
        let tier = task.tier_at_admission;
        info!(
            "任务已入队: id={}, owner={}, tier={}, url={}",
            task_id,
            owner_id,
            tier.as_str(),
            task.source.url
        );

        self.tasks.insert(
            task_id.clone(),
            Arc::new(TaskEntry {
                task: RwLock::new(task),
                cancel: self.shutdown.child_token(),
                reservation,
            }),
        );
        self.scheduler.lock().pending.push(&task_id, owner_id, tier);
        self.wakeup.notify_one();

        Ok(task_id)
    }

    /// 取消任务
    ///
    /// 只有任务所属用户或管理员可以取消；任务已处于终态时返回 false
    pub async fn cancel(&self, task_id: &str, requester_id: OwnerId) -> bool {
        let Some(entry) = self.entry(task_id) else {
            return false;
        };

        let (owner_id, was_queued) = {
            let mut task = entry.task.write();
            if task.owner_id != requester_id && !self.is_admin(requester_id) {
                warn!(
                    "用户 {} 无权取消任务 {} (owner={})",
                    requester_id, task_id, task.owner_id
                );
                return false;
            }
            let was_queued = task.state == TaskState::Queued;
            if !task.mark_cancelled() {
                debug!("任务 {} 已处于终态，忽略取消", task_id);
                return false;
            }
            (task.owner_id, was_queued)
        };

        entry.cancel.cancel();
        info!("任务已取消: {} (requester={})", task_id, requester_id);

        // 正在处理的任务由处理流程发送确认，排队中的任务在这里确认
        if was_queued {
            self.scheduler.lock().pending.remove(task_id);
            if let Err(e) = self.channel.notify(owner_id, &cancelled_text()).await {
                warn!("发送取消确认失败: owner={}, {}", owner_id, e);
            }
        }
        true
    }

    /// 取消用户的全部未完成任务，返回取消的数量
    pub async fn cancel_all(&self, owner_id: OwnerId, requester_id: OwnerId) -> usize {
        let mut cancelled = 0;
        for snapshot in self.owner_tasks(owner_id) {
            if !snapshot.state.is_terminal() && self.cancel(&snapshot.id, requester_id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn status(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.entry(task_id).map(|entry| entry.task.read().snapshot())
    }

    /// 当前阶段的进度快照
    pub fn progress(&self, task_id: &str) -> Option<ProgressSnapshot> {
        let entry = self.entry(task_id)?;
        let total = entry.task.read().bytes_total;
        Some(
            self.tracker
                .snapshot(task_id)
                .unwrap_or_else(|| ProgressSnapshot::empty(total)),
        )
    }

    /// 渲染后的进度文本
    pub fn render_progress(&self, task_id: &str) -> Option<String> {
        let snapshot = self.progress(task_id)?;
        let (state, file_name) = {
            let entry = self.entry(task_id)?;
            let task = entry.task.read();
            (
                task.state,
                task.file_name
                    .clone()
                    .unwrap_or_else(|| task.source.url.clone()),
            )
        };
        Some(render_status(state, &file_name, &snapshot, self.bar_segments))
    }

    /// 用户的任务（按创建时间排序）
    pub fn owner_tasks(&self, owner_id: OwnerId) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = self
            .tasks
            .iter()
            .filter_map(|entry| {
                let task = entry.value().task.read();
                (task.owner_id == owner_id).then(|| task.snapshot())
            })
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// 排队中任务的位置；已开始或不存在时返回 None
    pub fn queue_position(&self, task_id: &str) -> Option<QueuePosition> {
        let scheduler = self.scheduler.lock();
        let position = scheduler.pending.position(task_id)?;
        Some(QueuePosition {
            position,
            pending: scheduler.pending.len(),
        })
    }

    /// 用户任务统计（保留期内的任务）
    pub fn owner_stats(&self, owner_id: OwnerId) -> OwnerStats {
        OwnerStats::from_tasks(&self.owner_tasks(owner_id))
    }

    /// 用户任务汇总文本
    pub fn owner_summary(&self, owner_id: OwnerId) -> String {
        render_summary(&self.owner_stats(owner_id))
    }

    pub fn is_admin(&self, owner_id: OwnerId) -> bool {
        self.config.admin_ids.contains(&owner_id)
    }

    /// 处于传输阶段的任务数
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| entry.value().task.read().state.is_active())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.scheduler.lock().pending.len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.scheduler.lock().slots.used_slots()
    }

    /// 停止接收任务并取消所有未完成的任务
    pub async fn shutdown(&self) {
        info!("任务队列正在关闭");
        self.shutdown.cancel();

        let drained = self.scheduler.lock().pending.drain();
        for pending in drained {
            let Some(entry) = self.entry(&pending.task_id) else {
                continue;
            };
            if entry.task.write().mark_cancelled() {
                if let Err(e) = self.channel.notify(pending.owner_id, &cancelled_text()).await {
                    warn!("发送取消确认失败: owner={}, {}", pending.owner_id, e);
                }
            }
        }
    }

    /// 移除保留期已过的终态任务，返回移除数量
    pub fn sweep_finished(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(self.config.retention_secs as i64);
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| {
                let task = entry.value().task.read();
                task.state.is_terminal()
                    && task
                        .finished_at
                        .map(|finished| now - finished >= retention)
                        .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for task_id in &expired {
            self.tasks.remove(task_id);
            self.tracker.forget(task_id);
        }
        if !expired.is_empty() {
            debug!("已清理 {} 个过期任务", expired.len());
        }
        expired.len()
    }

    fn entry(&self, task_id: &str) -> Option<Arc<TaskEntry>> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    /// 在槽位允许的范围内启动等待中的任务
    fn dispatch_ready(&self) {
        loop {
            let next = {
                let mut scheduler = self.scheduler.lock();
                if self.shutdown.is_cancelled() {
                    None
                } else {
                    scheduler.next_ready()
                }
            };
            let Some(next) = next else {
                break;
            };

            let guard = SlotGuard {
                scheduler: self.scheduler.clone(),
                wakeup: self.wakeup.clone(),
                task_id: next.task_id.clone(),
            };

            let Some(entry) = self.entry(&next.task_id) else {
                continue;
            };
            // 出队后、启动前被取消
            if !entry.task.write().transition(TaskState::Downloading) {
                continue;
            }

            info!("开始处理任务: {} (owner={})", next.task_id, next.owner_id);
            self.spawn_pipeline(entry, guard);
        }
    }

    fn spawn_pipeline(&self, entry: Arc<TaskEntry>, guard: SlotGuard) {
        let pipeline = self.pipeline.clone();
        let worker_entry = entry.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            pipeline.run(worker_entry).await;
        });

        let channel = self.channel.clone();
        tokio::spawn(async move {
            let Err(e) = handle.await else {
                return;
            };
            if !e.is_panic() {
                return;
            }

            let (task_id, owner_id, failed) = {
                let mut task = entry.task.write();
                let error = match task.state {
                    TaskState::Uploading => TransferError::UploadFailed("处理流程异常退出".into()),
                    _ => TransferError::DownloadFailed("处理流程异常退出".into()),
                };
                let failed = task
                    .mark_failed(error.kind(), error.to_string())
                    .then_some(error);
                (task.id.clone(), task.owner_id, failed)
            };

            error!("任务处理流程 panic: {}", task_id);
            if let Some(error) = failed {
                if let Err(e) = channel.notify(owner_id, &failure_text(&error)).await {
                    warn!("发送失败通知失败: owner={}, {}", owner_id, e);
                }
            }
        });
    }

    async fn dispatch_loop(queue: Weak<Self>, wakeup: Arc<Notify>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wakeup.notified() => {}
            }
            let Some(queue) = queue.upgrade() else {
                break;
            };
            queue.dispatch_ready();
        }
        debug!("调度循环已退出");
    }

    async fn sweep_loop(queue: Weak<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(queue) = queue.upgrade() else {
                break;
            };
            queue.sweep_finished(Utc::now());
        }
    }
}

/// 面向用户的拒绝提示
pub fn admission_message(error: &AdmissionError) -> String {
    match error {
        AdmissionError::DailyLimitReached { used, limit } => format!(
            "{} ({}/{} used today)",
            TaskErrorKind::AdmissionDenied.user_message(),
            used,
            limit
        ),
        AdmissionError::Store(_) => "Service temporarily unavailable.".to_string(),
        AdmissionError::ShuttingDown => "Service is restarting, please retry shortly.".to_string(),
    }
}
