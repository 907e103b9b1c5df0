//! 上传模块
//!
//! 通过消息通道投递暂存文件，失败按退避重试

mod worker;

pub use worker::{UploadRequest, UploadWorker};
