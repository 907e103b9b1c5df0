//! 下载工作器
//!
//! - 写入第一个字节之前按声明大小检查等级上限
//! - 每个分块结束后上报进度；分块内每次读取都与取消令牌竞争
//! - 单个分块的累积时间不超过 `read_timeout`，慢速源也会按时上报进度
//! - 临时 IO 错误按指数退避从当前偏移续传，分块成功后重置重试计数
//! - 完成后校验产物：过小的文件和 HTML 错误页视为失败

use crate::common::{RateLimiter, RetryPolicy};
use crate::config::DownloadConfig;
use crate::error::{is_transient_io, TransferError};
use crate::progress::ProgressSink;
use crate::source::{ByteStream, ResolvedSource, SourceResolver};
use crate::task::{detect_extension, SourceDescriptor, SNIFF_LEN};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 一次下载的输入
pub struct DownloadRequest<'a> {
    pub task_id: &'a str,
    /// 续传时重新打开用
    pub source: &'a SourceDescriptor,
    pub resolved: ResolvedSource,
    /// 暂存文件路径
    pub dest: PathBuf,
    /// 等级允许的最大字节数
    pub max_size: u64,
    /// 字节/秒上限
    pub rate_limit: Option<u64>,
}

/// 下载结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub size: u64,
    /// 按文件头识别出的扩展名
    pub detected_ext: Option<&'static str>,
}

/// 分块读取的结束方式
enum ChunkEnd {
    /// 缓冲区已填满或分块时间已到
    More,
    /// 流结束
    Eof,
    Cancelled,
    Failed(io::Error),
}

pub struct DownloadWorker {
    resolver: Arc<dyn SourceResolver>,
    chunk_size: usize,
    read_timeout: Duration,
    retry: RetryPolicy,
    /// 小于该大小的产物视为错误页
    min_size: u64,
}

impl DownloadWorker {
    pub fn new(resolver: Arc<dyn SourceResolver>, config: &DownloadConfig) -> Self {
        Self::with_settings(
            resolver,
            config.chunk_size,
            config.read_timeout(),
            config.retry.into(),
        )
        .with_min_size(config.min_valid_size)
    }

    pub fn with_settings(
        resolver: Arc<dyn SourceResolver>,
        chunk_size: usize,
        read_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            resolver,
            chunk_size: chunk_size.max(1),
            read_timeout,
            retry,
            min_size: 0,
        }
    }

    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    /// 执行下载
    ///
    /// 失败时暂存文件可能残留，由调用方清理任务目录
    pub async fn run(
        &self,
        request: DownloadRequest<'_>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, TransferError> {
        let DownloadRequest {
            task_id,
            source,
            resolved,
            dest,
            max_size,
            rate_limit,
        } = request;

        let declared = resolved.declared_size;
        sink.on_total(declared);

        if let Some(size) = declared {
            if size > max_size {
                warn!(
                    "任务 {} 声明大小超过上限: {} > {}",
                    task_id, size, max_size
                );
                return Err(TransferError::SizeExceeded {
                    size,
                    limit: max_size,
                });
            }
        }

        if cancel.is_cancelled() {
            warn!("任务 {} 在下载开始前被取消", task_id);
            return Err(TransferError::Cancelled);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TransferError::DownloadFailed(format!("创建暂存目录失败: {}", e))
            })?;
        }
        let mut file = File::create(&dest)
            .await
            .map_err(|e| TransferError::DownloadFailed(format!("创建暂存文件失败: {}", e)))?;

        info!(
            "开始下载: task={}, 文件={:?}, 声明大小={:?}",
            task_id, dest, declared
        );

        let mut stream = resolved.stream;
        let mut limiter = rate_limit.map(RateLimiter::new);
        let mut buf = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;
        let mut retries_used: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                info!("任务 {} 下载已取消 (已写入 {} bytes)", task_id, written);
                return Err(TransferError::Cancelled);
            }

            let (filled, end) = self.fill_chunk(&mut stream, &mut buf, cancel).await;
            if matches!(end, ChunkEnd::Cancelled) {
                info!("任务 {} 下载已取消 (已写入 {} bytes)", task_id, written);
                return Err(TransferError::Cancelled);
            }

            if filled > 0 {
                let next = written + filled as u64;
                if next > max_size {
                    warn!("任务 {} 实际大小超过上限: > {}", task_id, max_size);
                    return Err(TransferError::SizeExceeded {
                        size: next,
                        limit: max_size,
                    });
                }
                if let Some(size) = declared {
                    if next > size {
                        return Err(TransferError::DownloadFailed(format!(
                            "源数据超过声明大小: {} > {}",
                            next, size
                        )));
                    }
                }

                file.write_all(&buf[..filled]).await.map_err(|e| {
                    TransferError::DownloadFailed(format!("写入暂存文件失败: {}", e))
                })?;
                written = next;
                retries_used = 0;
                sink.on_progress(written);

                if let Some(limiter) = limiter.as_mut() {
                    limiter.pace(filled as u64).await;
                }
            }

            let error = match end {
                ChunkEnd::More => continue,
                ChunkEnd::Cancelled => return Err(TransferError::Cancelled),
                ChunkEnd::Eof => match declared {
                    Some(size) if written < size => io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("源在 {} / {} bytes 处提前结束", written, size),
                    ),
                    _ => break,
                },
                ChunkEnd::Failed(e) => e,
            };

            if !is_transient_io(&error) {
                return Err(TransferError::DownloadFailed(error.to_string()));
            }

            stream = self
                .resume(task_id, source, written, &mut retries_used, error, cancel)
                .await?;
        }

        file.flush()
            .await
            .map_err(|e| TransferError::DownloadFailed(format!("写入暂存文件失败: {}", e)))?;

        drop(file);

        let detected_ext = self.validate(task_id, &dest, written).await?;
        info!("✓ 任务 {} 下载完成: {} bytes", task_id, written);
        Ok(DownloadOutcome {
            path: dest,
            size: written,
            detected_ext,
        })
    }

    /// 读取一个分块
    ///
    /// 单次读取受 `read_timeout` 约束，超时视为临时错误。收到第一个字节后，
    /// 分块最多再累积 `read_timeout`，到时提前结束分块
    async fn fill_chunk(
        &self,
        stream: &mut ByteStream,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> (usize, ChunkEnd) {
        let mut filled = 0;
        let mut chunk_deadline: Option<Instant> = None;

        while filled < buf.len() {
            let deadline = chunk_deadline.unwrap_or_else(|| Instant::now() + self.read_timeout);
            let read = tokio::select! {
                _ = cancel.cancelled() => return (filled, ChunkEnd::Cancelled),
                read = tokio::time::timeout_at(deadline, stream.read(&mut buf[filled..])) => read,
            };

            match read {
                Err(_) if filled > 0 => return (filled, ChunkEnd::More),
                Err(_) => {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "读取源数据超时");
                    return (filled, ChunkEnd::Failed(e));
                }
                Ok(Err(e)) => return (filled, ChunkEnd::Failed(e)),
                Ok(Ok(0)) => return (filled, ChunkEnd::Eof),
                Ok(Ok(n)) => {
                    filled += n;
                    if chunk_deadline.is_none() {
                        chunk_deadline = Some(Instant::now() + self.read_timeout);
                    }
                }
            }
        }
        (filled, ChunkEnd::More)
    }

    /// 校验下载产物，返回按文件头识别出的扩展名
    async fn validate(
        &self,
        task_id: &str,
        path: &Path,
        size: u64,
    ) -> Result<Option<&'static str>, TransferError> {
        if size < self.min_size {
            warn!("任务 {} 下载产物过小: {} bytes", task_id, size);
            return Err(TransferError::DownloadFailed(format!(
                "file too small ({} bytes), likely an error page",
                size
            )));
        }

        let mut header = Vec::with_capacity(SNIFF_LEN);
        let file = File::open(path)
            .await
            .map_err(|e| TransferError::DownloadFailed(format!("读取暂存文件失败: {}", e)))?;
        file.take(SNIFF_LEN as u64)
            .read_to_end(&mut header)
            .await
            .map_err(|e| TransferError::DownloadFailed(format!("读取暂存文件失败: {}", e)))?;

        match detect_extension(&header) {
            Some("html") => {
                warn!("任务 {} 下载到的是 HTML 页面", task_id);
                Err(TransferError::DownloadFailed(
                    "received an HTML page instead of the file".to_string(),
                ))
            }
            detected => Ok(detected),
        }
    }

    /// 退避后从 `offset` 重新打开源
    async fn resume(
        &self,
        task_id: &str,
        source: &SourceDescriptor,
        offset: u64,
        retries_used: &mut u32,
        mut last_error: io::Error,
        cancel: &CancellationToken,
    ) -> Result<ByteStream, TransferError> {
        loop {
            if !self.retry.can_retry(*retries_used) {
                warn!(
                    "任务 {} 重试次数已用尽 ({}): {}",
                    task_id, self.retry.max_retries, last_error
                );
                return Err(TransferError::TransientIo(last_error.to_string()));
            }

            let delay = self.retry.delay(*retries_used);
            *retries_used += 1;
            warn!(
                "任务 {} 读取失败，{:?} 后从 {} 处续传 (第 {}/{} 次): {}",
                task_id, delay, offset, retries_used, self.retry.max_retries, last_error
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            // 重新打开包含不支持 Range 时的跳过，同样受超时和取消约束
            let reopened = tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                reopened = tokio::time::timeout(
                    self.read_timeout,
                    self.resolver.reopen(source, offset),
                ) => reopened,
            };

            match reopened {
                Ok(Ok(resolved)) => {
                    debug!("任务 {} 已重新打开源: offset={}", task_id, offset);
                    return Ok(resolved.stream);
                }
                Ok(Err(e)) if e.is_transient() => {
                    last_error = io::Error::new(io::ErrorKind::ConnectionReset, e.to_string());
                }
                Ok(Err(e)) => return Err(TransferError::DownloadFailed(e.to_string())),
                Err(_) => {
                    last_error = io::Error::new(io::ErrorKind::TimedOut, "重新打开源超时");
                }
            }
        }
    }
}
