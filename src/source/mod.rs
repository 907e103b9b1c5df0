//! 源链接解析
//!
//! 各托管平台的解析逻辑通过 `SourceResolver` 接入，核心流程只关心
//! "解析 → 字节流 + 声明大小 + 媒体类型"

mod http;
mod registry;

pub use http::HttpSourceResolver;
pub use registry::ResolverRegistry;

use crate::error::SourceError;
use crate::task::{MediaKind, SourceDescriptor};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// 源字节流
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// 解析结果
pub struct ResolvedSource {
    pub stream: ByteStream,
    /// 源声明的总大小（可能缺失）
    pub declared_size: Option<u64>,
    pub media_kind: MediaKind,
    /// 已清理的文件名
    pub file_name: String,
}

impl std::fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSource")
            .field("declared_size", &self.declared_size)
            .field("media_kind", &self.media_kind)
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// 源解析器
#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// 解析器名称（日志用）
    fn name(&self) -> &str;

    async fn resolve(&self, source: &SourceDescriptor) -> Result<ResolvedSource, SourceError>;

    /// 从 `offset` 处重新打开（临时错误后续传）
    ///
    /// 默认实现重新解析后跳过已下载的字节
    async fn reopen(
        &self,
        source: &SourceDescriptor,
        offset: u64,
    ) -> Result<ResolvedSource, SourceError> {
        let mut resolved = self.resolve(source).await?;
        skip_bytes(&mut resolved.stream, offset).await?;
        Ok(resolved)
    }
}

/// 丢弃流开头的 `n` 个字节
pub async fn skip_bytes(stream: &mut ByteStream, n: u64) -> Result<(), SourceError> {
    if n == 0 {
        return Ok(());
    }
    let mut limited = AsyncReadExt::take(&mut *stream, n);
    let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if skipped < n {
        return Err(SourceError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("source ended after {} of {} skipped bytes", skipped, n),
        )));
    }
    Ok(())
}
