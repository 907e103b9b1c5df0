//! 单个任务的处理流程
//!
//! 解析 → 下载 → 缩略图（可选）→ 上传 → 清理，整个流程在同一个 tokio 任务中执行

use super::TaskEntry;
use crate::channel::{MessageRef, MessagingChannel};
use crate::common::{human_bytes, RetryPolicy};
use crate::config::{DownloadConfig, ProgressConfig};
use crate::downloader::{DownloadRequest, DownloadWorker};
use crate::error::{SourceError, TransferError};
use crate::progress::{
    render_status, stage_label, ProgressSink, ProgressSnapshot, ProgressThrottler, ProgressTracker,
};
use crate::quota::QuotaEnforcer;
use crate::source::{ResolvedSource, SourceResolver};
use crate::task::{
    corrected_file_name, MediaKind, OwnerId, SourceDescriptor, TaskErrorKind, TaskState,
};
use crate::thumbnail::ThumbnailGenerator;
use crate::uploader::{UploadRequest, UploadWorker};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 任务开始处理时发送的状态消息
const STARTING_TEXT: &str = "⏳ Processing your link...";

/// 审计日志中链接的最大长度
const AUDIT_URL_MAX_CHARS: usize = 100;

pub(crate) struct Pipeline {
    pub quota: Arc<QuotaEnforcer>,
    pub resolver: Arc<dyn SourceResolver>,
    pub channel: Arc<dyn MessagingChannel>,
    pub downloader: DownloadWorker,
    pub uploader: UploadWorker,
    pub thumbnails: ThumbnailGenerator,
    pub tracker: Arc<ProgressTracker>,
    pub download: DownloadConfig,
    pub progress: ProgressConfig,
    /// 审计日志接收方
    pub log_target: Option<OwnerId>,
}

/// 任务结束方式
enum Outcome {
    Completed,
    Failed(TransferError),
    Cancelled,
}

impl Pipeline {
    /// 处理任务直到终态
    pub async fn run(&self, entry: Arc<TaskEntry>) {
        let (task_id, owner_id) = {
            let task = entry.task.read();
            (task.id.clone(), task.owner_id)
        };

        let status = match self.channel.notify(owner_id, STARTING_TEXT).await {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("任务 {} 发送状态消息失败: {}", task_id, e);
                None
            }
        };

        let task_dir = self.download.work_dir.join(&task_id);
        let result = self.process(&entry, status.as_ref(), &task_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&task_dir).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("清理任务暂存目录失败: {:?}, {}", task_dir, e);
            }
        }

        self.finish(&entry, result, status.as_ref()).await;
    }

    async fn process(
        &self,
        entry: &Arc<TaskEntry>,
        status: Option<&MessageRef>,
        task_dir: &Path,
    ) -> Result<(), TransferError> {
        let cancel = &entry.cancel;
        let (task_id, owner_id, source, tier) = {
            let task = entry.task.read();
            (
                task.id.clone(),
                task.owner_id,
                task.source.clone(),
                task.tier_at_admission,
            )
        };

        // 解析
        let resolved = match self.resolve(&task_id, &source, cancel).await {
            Ok(resolved) => resolved,
            Err(e) => {
                if !matches!(e, TransferError::Cancelled) {
                    self.rollback_admission(entry).await;
                }
                return Err(e);
            }
        };

        let mut file_name = resolved.file_name.clone();
        let mut media_kind = resolved.media_kind;
        {
            let mut task = entry.task.write();
            task.file_name = Some(file_name.clone());
            task.media_kind = Some(media_kind);
            task.set_total(resolved.declared_size);
        }
        self.tracker.begin(&task_id, resolved.declared_size);

        // 下载
        let reporter = StageReporter::start(self, entry, status, TaskState::Downloading, &file_name);
        let request = DownloadRequest {
            task_id: &task_id,
            source: &source,
            resolved,
            dest: task_dir.join(&file_name),
            max_size: self.quota.max_size(tier),
            rate_limit: self.download.rate_limit(tier),
        };
        let downloaded = self
            .downloader
            .run(request, reporter.sink.as_ref(), cancel)
            .await;
        reporter.finish(self).await;
        let mut downloaded = downloaded?;

        // 按文件头修正扩展名
        if let Some(corrected) = downloaded
            .detected_ext
            .and_then(|ext| corrected_file_name(&file_name, ext))
        {
            let renamed = downloaded.path.with_file_name(&corrected);
            match tokio::fs::rename(&downloaded.path, &renamed).await {
                Ok(()) => {
                    info!("任务 {} 文件名修正: {} -> {}", task_id, file_name, corrected);
                    media_kind = MediaKind::from_file_name(&corrected);
                    file_name = corrected;
                    downloaded.path = renamed;
                    let mut task = entry.task.write();
                    task.file_name = Some(file_name.clone());
                    task.media_kind = Some(media_kind);
                }
                Err(e) => warn!("任务 {} 文件重命名失败，沿用原文件名: {}", task_id, e),
            }
        }

        // 缩略图
        let thumbnail = if media_kind.supports_thumbnail() {
            if !entry.task.write().transition(TaskState::Thumbnailing) {
                return Err(TransferError::Cancelled);
            }
            self.edit_status(status, stage_label(TaskState::Thumbnailing))
                .await;

            let thumbnail = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                thumbnail = self.thumbnails.generate(&downloaded.path, media_kind) => thumbnail,
            };
            debug!("任务 {} 缩略图: {:?}", task_id, thumbnail);
            entry.task.write().thumbnail_ref = thumbnail.clone();
            thumbnail
        } else {
            None
        };

        // 上传
        if !entry
            .task
            .write()
            .begin_stage(TaskState::Uploading, Some(downloaded.size))
        {
            return Err(TransferError::Cancelled);
        }
        self.tracker.begin(&task_id, Some(downloaded.size));

        let caption = format!("📁 {} ({})", file_name, human_bytes(downloaded.size));
        let reporter = StageReporter::start(self, entry, status, TaskState::Uploading, &file_name);
        let request = UploadRequest {
            task_id: &task_id,
            owner_id,
            artifact: &downloaded.path,
            file_name: &file_name,
            media_kind,
            thumbnail: thumbnail.as_deref(),
            caption: &caption,
        };
        let sink: Arc<dyn ProgressSink> = reporter.sink.clone();
        let uploaded = self.uploader.run(request, sink, cancel).await;
        reporter.finish(self).await;

        entry.task.write().message_ref = Some(uploaded?);
        Ok(())
    }

    /// 解析链接，临时错误按退避重试
    async fn resolve(
        &self,
        task_id: &str,
        source: &SourceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ResolvedSource, TransferError> {
        let retry: RetryPolicy = self.download.retry.into();
        let timeout = self.download.resolve_timeout();
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                result = tokio::time::timeout(timeout, self.resolver.resolve(source)) => result,
            };

            let error = match result {
                Ok(Ok(resolved)) => {
                    info!(
                        "任务 {} 解析完成: {} ({:?}, {:?})",
                        task_id, resolved.file_name, resolved.media_kind, resolved.declared_size
                    );
                    return Ok(resolved);
                }
                Ok(Err(e)) => e,
                Err(_) => SourceError::Io(io::Error::new(io::ErrorKind::TimedOut, "解析超时")),
            };

            if !error.is_transient() {
                warn!("任务 {} 链接无法解析: {}", task_id, error);
                return Err(TransferError::Unresolvable(error.to_string()));
            }
            if !retry.can_retry(attempt) {
                warn!("任务 {} 解析重试次数已用尽: {}", task_id, error);
                return Err(TransferError::TransientIo(error.to_string()));
            }

            let delay = retry.delay(attempt);
            attempt += 1;
            warn!(
                "任务 {} 解析失败，{:?} 后重试 (第 {}/{} 次): {}",
                task_id, delay, attempt, retry.max_retries, error
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 传输开始前失败，归还当日次数
    async fn rollback_admission(&self, entry: &TaskEntry) {
        if let Err(e) = self.quota.release(&entry.reservation).await {
            warn!(
                "用户 {} 准入回滚失败: {:#}",
                entry.reservation.owner_id, e
            );
        }
    }

    /// 写入终态并发送唯一的结束通知
    async fn finish(
        &self,
        entry: &TaskEntry,
        result: Result<(), TransferError>,
        status: Option<&MessageRef>,
    ) {
        let (task_id, owner_id, file_name, url, outcome) = {
            let mut task = entry.task.write();
            let outcome = if task.state == TaskState::Cancelled {
                Outcome::Cancelled
            } else {
                match result {
                    Ok(()) if task.mark_completed() => Outcome::Completed,
                    Ok(()) => Outcome::Failed(TransferError::UploadFailed(format!(
                        "非法的完成状态: {:?}",
                        task.state
                    ))),
                    Err(TransferError::Cancelled) => {
                        task.mark_cancelled();
                        Outcome::Cancelled
                    }
                    Err(e) => Outcome::Failed(e),
                }
            };
            if let Outcome::Failed(e) = &outcome {
                task.mark_failed(e.kind(), e.to_string());
            }
            (
                task.id.clone(),
                task.owner_id,
                task.file_name.clone().unwrap_or_default(),
                task.source.url.clone(),
                outcome,
            )
        };

        match outcome {
            Outcome::Completed => {
                info!("✓ 任务完成: {}", task_id);
                let text = format!(
                    "{}\n📁 {}",
                    stage_label(TaskState::Completed),
                    file_name
                );
                self.edit_status(status, &text).await;
                self.audit(&audit_text(owner_id, &file_name, &url, None)).await;
            }
            Outcome::Cancelled => {
                info!("任务已取消: {}", task_id);
                self.notify(owner_id, &cancelled_text()).await;
            }
            Outcome::Failed(e) => {
                error!("✗ 任务失败: {}, 错误: {}", task_id, e);
                self.notify(owner_id, &failure_text(&e)).await;
                self.audit(&audit_text(owner_id, &file_name, &url, Some(&e)))
                    .await;
            }
        }
    }

    /// 写入审计日志，失败只记录日志
    async fn audit(&self, text: &str) {
        let Some(target) = self.log_target else {
            return;
        };
        if let Err(e) = self.channel.notify(target, text).await {
            warn!("写入审计日志失败: target={}, {}", target, e);
        }
    }

    async fn notify(&self, owner_id: OwnerId, text: &str) {
        if let Err(e) = self.channel.notify(owner_id, text).await {
            warn!("发送通知失败: owner={}, {}", owner_id, e);
        }
    }

    async fn edit_status(&self, status: Option<&MessageRef>, text: &str) {
        let Some(message) = status else {
            return;
        };
        if let Err(e) = self.channel.edit(message, text).await {
            debug!("编辑状态消息失败: {}", e);
        }
    }

    fn render(&self, entry: &TaskEntry, stage: TaskState, file_name: &str) -> String {
        let (task_id, total) = {
            let task = entry.task.read();
            (task.id.clone(), task.bytes_total)
        };
        let snapshot = self
            .tracker
            .snapshot(&task_id)
            .unwrap_or_else(|| ProgressSnapshot::empty(total));
        render_status(stage, file_name, &snapshot, self.progress.bar_segments)
    }
}

/// 取消确认文本
pub(crate) fn cancelled_text() -> String {
    format!("🚫 {}", TaskErrorKind::Cancelled.user_message())
}

/// 失败通知文本
pub(crate) fn failure_text(error: &TransferError) -> String {
    let mut text = format!("❌ {}", error.kind().user_message());
    if let TransferError::SizeExceeded { limit, .. } = error {
        text.push_str(&format!(" Limit: {}.", human_bytes(*limit)));
    }
    text
}

/// 审计日志文本；`error` 为 None 表示上传成功
pub(crate) fn audit_text(
    owner_id: OwnerId,
    file_name: &str,
    url: &str,
    error: Option<&TransferError>,
) -> String {
    let mut link: String = url.chars().take(AUDIT_URL_MAX_CHARS).collect();
    if url.chars().count() > AUDIT_URL_MAX_CHARS {
        link.push_str("...");
    }
    let headline = if error.is_some() {
        "❌ File Failed"
    } else {
        "✅ File Uploaded"
    };
    let mut text = format!(
        "{}\n👤 User: {}\n📁 File: {}\n🔗 Link: {}",
        headline, owner_id, file_name, link
    );
    if let Some(e) = error {
        text.push_str(&format!("\n⚠️ Error: {}", e));
    }
    text
}

/// 把进度写入任务和跟踪器，按节流间隔唤醒状态编辑
struct StageSink {
    entry: Arc<TaskEntry>,
    tracker: Arc<ProgressTracker>,
    throttler: ProgressThrottler,
    wake: mpsc::Sender<()>,
}

impl ProgressSink for StageSink {
    fn on_total(&self, total: Option<u64>) {
        let task_id = {
            let mut task = self.entry.task.write();
            task.set_total(total);
            task.id.clone()
        };
        self.tracker.set_total(&task_id, total);
    }

    fn on_progress(&self, bytes_so_far: u64) {
        let (task_id, bytes) = {
            let mut task = self.entry.task.write();
            let bytes = task.advance(bytes_so_far);
            (task.id.clone(), bytes)
        };
        self.tracker.record(&task_id, bytes, Instant::now());

        if self.throttler.should_emit() {
            // 编辑还没发完时丢弃本次唤醒
            let _ = self.wake.try_send(());
        }
    }
}

/// 一个传输阶段的状态消息编辑
///
/// 后台任务串行执行编辑；阶段结束时停止后台任务，再强制刷新最后一次
struct StageReporter {
    sink: Arc<StageSink>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
    entry: Arc<TaskEntry>,
    status: Option<MessageRef>,
    stage: TaskState,
    file_name: String,
}

impl StageReporter {
    fn start(
        pipeline: &Pipeline,
        entry: &Arc<TaskEntry>,
        status: Option<&MessageRef>,
        stage: TaskState,
        file_name: &str,
    ) -> Self {
        let (wake, mut wakeups) = mpsc::channel::<()>(1);
        let sink = Arc::new(StageSink {
            entry: entry.clone(),
            tracker: pipeline.tracker.clone(),
            throttler: ProgressThrottler::new(pipeline.progress.edit_interval()),
            wake,
        });
        let stop = CancellationToken::new();

        let handle = status.cloned().map(|message| {
            let channel = pipeline.channel.clone();
            let tracker = pipeline.tracker.clone();
            let entry = entry.clone();
            let stop = stop.clone();
            let segments = pipeline.progress.bar_segments;
            let file_name = file_name.to_string();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        wakeup = wakeups.recv() => {
                            if wakeup.is_none() {
                                break;
                            }
                        }
                    }

                    let (task_id, total) = {
                        let task = entry.task.read();
                        (task.id.clone(), task.bytes_total)
                    };
                    let snapshot = tracker
                        .snapshot(&task_id)
                        .unwrap_or_else(|| ProgressSnapshot::empty(total));
                    let text = render_status(stage, &file_name, &snapshot, segments);
                    if let Err(e) = channel.edit(&message, &text).await {
                        debug!("编辑进度消息失败: {}", e);
                    }
                }
            })
        });

        Self {
            sink,
            stop,
            handle,
            entry: entry.clone(),
            status: status.cloned(),
            stage,
            file_name: file_name.to_string(),
        }
    }

    /// 停止后台编辑并刷新最后一次进度
    async fn finish(mut self, pipeline: &Pipeline) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                debug!("进度编辑任务异常退出: {}", e);
            }
        }

        self.sink.throttler.force_emit();
        let text = pipeline.render(&self.entry, self.stage, &self.file_name);
        pipeline.edit_status(self.status.as_ref(), &text).await;
    }
}
