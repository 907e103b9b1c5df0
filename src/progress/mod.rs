//! 进度模块
//!
//! - `tracker`: 速度 / 剩余时间 / 百分比计算
//! - `render`: 进度条和状态文本
//! - `throttle`: 状态消息编辑节流

pub mod render;
pub mod throttle;
pub mod tracker;

pub use render::{render_bar, render_status, stage_label};
pub use throttle::ProgressThrottler;
pub use tracker::{Eta, ProgressSnapshot, ProgressTracker};

/// 传输进度接收方
///
/// 下载 / 上传在每个分块之后调用，实现方需要足够轻量（不做 IO）
pub trait ProgressSink: Send + Sync {
    /// 当前阶段的总大小（解析完成或开始上传时）
    fn on_total(&self, total: Option<u64>);

    /// 当前阶段已传输的累计字节数
    fn on_progress(&self, bytes_so_far: u64);
}
