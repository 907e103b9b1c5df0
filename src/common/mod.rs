//! 公共模块
//!
//! 提供跨模块使用的通用组件

pub mod format;
mod rate_limit;
mod recovery;
mod retry;

pub use format::{human_bytes, human_duration};
pub use rate_limit::RateLimiter;
pub use recovery::{sweep_staging_dir, SweepReport};
pub use retry::RetryPolicy;
