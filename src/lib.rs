// Link Relay
// 链接转存任务编排核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 错误类型
pub mod error;

// 任务模型
pub mod task;

// 进度统计与渲染
pub mod progress;

// 配额模块
pub mod quota;

// 链接解析模块
pub mod source;

// 消息通道模块
pub mod channel;

// 缩略图模块
pub mod thumbnail;

// 下载模块
pub mod downloader;

// 上传模块
pub mod uploader;

// 公共模块（重试、限速、启动清理等）
pub mod common;

// 任务队列
pub mod queue;

// Web服务器模块
pub mod server;

#[cfg(test)]
mod test_support;

// 导出常用类型
pub use config::AppConfig;
pub use error::{AdmissionError, ChannelError, SourceError, TransferError};
pub use queue::{QueueDeps, TaskQueue};
pub use quota::QuotaEnforcer;
pub use server::AppState;
pub use task::{OwnerId, SourceDescriptor, Task, TaskId, TaskSnapshot, TaskState, Tier};
