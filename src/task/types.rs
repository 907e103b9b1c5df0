use crate::channel::MessageRef;
use crate::task::MediaKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// 用户标识
pub type OwnerId = i64;

/// 任务标识（UUID v4 字符串）
pub type TaskId = String;

/// 用户等级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// 免费用户
    Free,
    /// 高级会员
    Premium,
}

impl Tier {
    /// 调度优先级，数值越小越先调度
    pub fn priority(&self) -> u8 {
        match self {
            Tier::Premium => 0,
            Tier::Free => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

/// 任务状态
///
/// `queued → downloading → (thumbnailing) → uploading → completed`，
/// 任何非终态都可以进入 `cancelled`，传输阶段可以进入 `failed`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// 排队中
    Queued,
    /// 下载中
    Downloading,
    /// 生成缩略图
    Thumbnailing,
    /// 上传中
    Uploading,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// 是否占用工作槽位
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskState::Downloading | TaskState::Thumbnailing | TaskState::Uploading
        )
    }

    /// 状态迁移是否合法
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Queued, Downloading) => true,
            (Downloading, Thumbnailing) | (Downloading, Uploading) => true,
            (Thumbnailing, Uploading) => true,
            (Uploading, Completed) => true,
            (Downloading | Thumbnailing | Uploading, Failed) => true,
            (Queued | Downloading | Thumbnailing | Uploading, Cancelled) => true,
            _ => false,
        }
    }
}

/// 任务失败原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// 每日次数已用完
    AdmissionDenied,
    /// 文件超过等级允许的大小
    SizeExceeded,
    /// 链接无法解析
    Unresolvable,
    /// 临时网络错误（重试耗尽前不会出现在任务上）
    TransientIo,
    /// 下载失败
    DownloadFailed,
    /// 上传失败
    UploadFailed,
    /// 用户取消
    Cancelled,
}

impl TaskErrorKind {
    /// 面向用户的提示文本
    pub fn user_message(&self) -> &'static str {
        match self {
            TaskErrorKind::AdmissionDenied => {
                "Daily limit reached. Upgrade to premium for unlimited tasks."
            }
            TaskErrorKind::SizeExceeded => "The file is larger than your plan allows.",
            TaskErrorKind::Unresolvable => "This link could not be opened or is not supported.",
            TaskErrorKind::TransientIo => "The connection kept dropping. Please try again later.",
            TaskErrorKind::DownloadFailed => "The download failed.",
            TaskErrorKind::UploadFailed => "The upload failed after several attempts.",
            TaskErrorKind::Cancelled => "Task cancelled.",
        }
    }
}

/// 源链接描述（由外部解析器解释）
///
/// 凭证只做透传，不参与日志输出
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// 原始链接
    pub url: String,
    /// 调用方提供的 Cookie
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    /// 调用方提供的 Authorization 头
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<String>,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookie: None,
            authorization: None,
        }
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("url", &self.url)
            .field("cookie", &self.cookie.as_ref().map(|_| "<redacted>"))
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// 传输任务
#[derive(Debug, Clone)]
pub struct Task {
    /// 任务ID
    pub id: TaskId,
    /// 所属用户
    pub owner_id: OwnerId,
    /// 源链接
    pub source: SourceDescriptor,
    /// 任务状态
    pub state: TaskState,
    /// 当前阶段的总字节数（解析前未知）
    pub bytes_total: Option<u64>,
    /// 当前阶段已传输字节数
    pub bytes_transferred: u64,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 开始处理时间
    pub started_at: Option<DateTime<Utc>>,
    /// 进入终态的时间
    pub finished_at: Option<DateTime<Utc>>,
    /// 入队时的用户等级，处理过程中不再变化
    pub tier_at_admission: Tier,
    /// 失败原因
    pub error: Option<TaskErrorKind>,
    /// 失败详情（仅日志/排查用）
    pub error_detail: Option<String>,
    /// 缩略图路径
    pub thumbnail_ref: Option<PathBuf>,
    /// 解析后的文件名
    pub file_name: Option<String>,
    /// 解析后的媒体类型
    pub media_kind: Option<MediaKind>,
    /// 投递成功后的消息引用
    pub message_ref: Option<MessageRef>,
}

impl Task {
    pub fn new(owner_id: OwnerId, source: SourceDescriptor, tier: Tier) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            source,
            state: TaskState::Queued,
            bytes_total: None,
            bytes_transferred: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            tier_at_admission: tier,
            error: None,
            error_detail: None,
            thumbnail_ref: None,
            file_name: None,
            media_kind: None,
            message_ref: None,
        }
    }

    /// 尝试迁移状态，非法迁移返回 false 且不做修改
    pub fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(
                "任务 {} 忽略非法状态迁移: {:?} -> {:?}",
                self.id, self.state, next
            );
            return false;
        }

        if next == TaskState::Downloading && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.state = next;
        true
    }

    /// 进入新的传输阶段，进度按新阶段重新计数
    pub fn begin_stage(&mut self, next: TaskState, total: Option<u64>) -> bool {
        if !self.transition(next) {
            return false;
        }
        self.bytes_total = total;
        self.bytes_transferred = 0;
        true
    }

    /// 设置当前阶段总大小（下载阶段在解析完成后才知道）
    pub fn set_total(&mut self, total: Option<u64>) {
        self.bytes_total = total;
        if let Some(total) = total {
            self.bytes_transferred = self.bytes_transferred.min(total);
        }
    }

    /// 推进已传输字节数
    ///
    /// 只增不减，已知总大小时不会超过总大小。返回更新后的值
    pub fn advance(&mut self, bytes_so_far: u64) -> u64 {
        let capped = match self.bytes_total {
            Some(total) => bytes_so_far.min(total),
            None => bytes_so_far,
        };
        if capped > self.bytes_transferred {
            self.bytes_transferred = capped;
        }
        self.bytes_transferred
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) -> bool {
        self.transition(TaskState::Completed)
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, kind: TaskErrorKind, detail: impl Into<String>) -> bool {
        if !self.transition(TaskState::Failed) {
            return false;
        }
        self.error = Some(kind);
        self.error_detail = Some(detail.into());
        true
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) -> bool {
        if !self.transition(TaskState::Cancelled) {
            return false;
        }
        self.error = Some(TaskErrorKind::Cancelled);
        true
    }

    /// 当前阶段进度百分比，总大小未知时为 None
    pub fn percent(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_transferred as f64 / total as f64 * 100.0),
            None => None,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            owner_id: self.owner_id,
            url: self.source.url.clone(),
            state: self.state,
            bytes_total: self.bytes_total,
            bytes_transferred: self.bytes_transferred,
            percent: self.percent(),
            tier: self.tier_at_admission,
            created_at: self.created_at,
            finished_at: self.finished_at,
            file_name: self.file_name.clone(),
            media_kind: self.media_kind,
            thumbnail_ref: self
                .thumbnail_ref
                .as_ref()
                .map(|p| p.display().to_string()),
            error: self.error,
            error_message: self.error.map(|e| e.user_message().to_string()),
        }
    }
}

/// 任务状态快照（对外只读视图）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub owner_id: OwnerId,
    pub url: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_kind: Option<MediaKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> Task {
        Task::new(42, SourceDescriptor::new("https://example.com/a.mp4"), Tier::Free)
    }

    #[test]
    fn test_task_creation() {
        let task = new_task();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.bytes_transferred, 0);
        assert!(task.bytes_total.is_none());
        assert!(task.percent().is_none());
        assert_eq!(task.tier_at_admission, Tier::Free);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = new_task();

        assert!(task.transition(TaskState::Downloading));
        assert!(task.started_at.is_some());

        // 下载中不能直接完成
        assert!(!task.transition(TaskState::Completed));

        assert!(task.begin_stage(TaskState::Uploading, Some(10)));
        assert!(task.mark_completed());
        assert!(task.finished_at.is_some());

        // 终态之后不能再变化
        assert!(!task.mark_cancelled());
        assert!(!task.mark_failed(TaskErrorKind::UploadFailed, "late"));
        assert_eq!(task.state, TaskState::Completed);
    }

    #[test]
    fn test_queued_cannot_fail() {
        let mut task = new_task();
        assert!(!task.mark_failed(TaskErrorKind::DownloadFailed, "x"));
        assert!(task.mark_cancelled());
        assert_eq!(task.error, Some(TaskErrorKind::Cancelled));
    }

    #[test]
    fn test_advance_is_monotonic_and_capped() {
        let mut task = new_task();
        task.transition(TaskState::Downloading);
        task.set_total(Some(1000));

        assert_eq!(task.advance(300), 300);
        assert_eq!(task.advance(200), 300);
        assert_eq!(task.advance(5000), 1000);
        assert_eq!(task.percent(), Some(100.0));
    }

    #[test]
    fn test_begin_stage_resets_progress() {
        let mut task = new_task();
        task.begin_stage(TaskState::Downloading, Some(100));
        task.advance(100);
        task.begin_stage(TaskState::Uploading, Some(120));
        assert_eq!(task.bytes_transferred, 0);
        assert_eq!(task.bytes_total, Some(120));
    }

    #[test]
    fn test_descriptor_debug_redacts_credentials() {
        let desc = SourceDescriptor::new("https://x").with_cookie("secret=1");
        let printed = format!("{:?}", desc);
        assert!(!printed.contains("secret"));
        assert!(printed.contains("<redacted>"));
    }
}
