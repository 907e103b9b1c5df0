//! 下载模块
//!
//! 把解析好的源字节流按固定分块写入暂存目录

mod worker;

pub use worker::{DownloadOutcome, DownloadRequest, DownloadWorker};
