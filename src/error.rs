//! 错误类型
//!
//! 领域错误使用 thiserror 枚举，基础设施路径（配置、数据库、启动）使用 anyhow

use crate::task::TaskErrorKind;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 提交任务时的准入错误
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// 每日任务数已达上限
    #[error("daily limit reached: {used}/{limit} tasks used today")]
    DailyLimitReached { used: u32, limit: u32 },

    /// 配额存储不可用
    #[error("quota store error: {0:#}")]
    Store(#[from] anyhow::Error),

    /// 队列已停止接收任务
    #[error("task queue is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    pub fn kind(&self) -> TaskErrorKind {
        TaskErrorKind::AdmissionDenied
    }
}

/// 链接解析 / 读取错误
#[derive(Debug, Error)]
pub enum SourceError {
    /// 链接不受支持或无法解析
    #[error("unresolvable source: {0}")]
    Unresolvable(String),

    /// 资源不存在（404/410）
    #[error("source not found: {0}")]
    NotFound(String),

    /// 源数据不符合预期（例如实际大小超过声明大小）
    #[error("malformed source: {0}")]
    Malformed(String),

    /// 网络 / IO 错误
    #[error("source io error: {0}")]
    Io(#[from] io::Error),

    /// 服务端临时错误（5xx）
    #[error("source temporarily unavailable: {0}")]
    Unavailable(String),
}

impl SourceError {
    /// 是否属于可重试的临时错误
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Io(e) => is_transient_io(e),
            SourceError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// 连接被重置、超时等临时 IO 错误
pub fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// 消息通道错误
#[derive(Debug, Error)]
pub enum ChannelError {
    /// 临时错误，可以重试
    #[error("channel temporarily unavailable: {0}")]
    Transient(String),

    /// 触发通道限流
    #[error("channel rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// 通道拒绝（不可重试）
    #[error("channel rejected request: {0}")]
    Rejected(String),

    /// 上传过程中被取消
    #[error("channel operation cancelled")]
    Cancelled,
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Transient(_) | ChannelError::RateLimited { .. }
        )
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        if is_transient_io(&e) {
            ChannelError::Transient(e.to_string())
        } else {
            ChannelError::Rejected(e.to_string())
        }
    }
}

/// 任务处理错误，与 `TaskErrorKind` 一一对应
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file size {size} exceeds the limit of {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("unresolvable: {0}")]
    Unresolvable(String),

    /// 重试耗尽后的临时错误
    #[error("transient io error persisted: {0}")]
    TransientIo(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            TransferError::SizeExceeded { .. } => TaskErrorKind::SizeExceeded,
            TransferError::Unresolvable(_) => TaskErrorKind::Unresolvable,
            TransferError::TransientIo(_) => TaskErrorKind::TransientIo,
            TransferError::DownloadFailed(_) => TaskErrorKind::DownloadFailed,
            TransferError::UploadFailed(_) => TaskErrorKind::UploadFailed,
            TransferError::Cancelled => TaskErrorKind::Cancelled,
        }
    }
}
