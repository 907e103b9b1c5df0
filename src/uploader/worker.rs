//! 上传工作器

use crate::channel::{MessageRef, MessagingChannel, OutgoingArtifact};
use crate::common::RetryPolicy;
use crate::config::UploadConfig;
use crate::error::{ChannelError, TransferError};
use crate::progress::ProgressSink;
use crate::task::{MediaKind, OwnerId};
use crate::thumbnail::fetch_default_thumbnail;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 默认缩略图在暂存目录中的文件名（带任务 ID，不会与下载文件重名）
fn default_thumbnail_name(task_id: &str) -> String {
    format!(".{}.default_thumb.jpg", task_id)
}

/// 一次上传的输入
pub struct UploadRequest<'a> {
    pub task_id: &'a str,
    pub owner_id: OwnerId,
    pub artifact: &'a Path,
    pub file_name: &'a str,
    pub media_kind: MediaKind,
    /// 已生成的缩略图
    pub thumbnail: Option<&'a Path>,
    pub caption: &'a str,
}

/// 读取时上报进度并响应取消
struct ProgressReader<R> {
    inner: R,
    read: u64,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "上传已取消")));
        }

        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.read += n as u64;
                    this.sink.on_progress(this.read);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

pub struct UploadWorker {
    channel: Arc<dyn MessagingChannel>,
    retry: RetryPolicy,
    read_chunk_size: usize,
    http: reqwest::Client,
    default_thumbnail_url: Option<String>,
}

impl UploadWorker {
    pub fn new(
        channel: Arc<dyn MessagingChannel>,
        config: &UploadConfig,
        http: reqwest::Client,
        default_thumbnail_url: Option<String>,
    ) -> Self {
        Self {
            channel,
            retry: config.retry.into(),
            read_chunk_size: config.read_chunk_size.max(1),
            http,
            default_thumbnail_url,
        }
    }

    /// 投递文件
    ///
    /// 进度以本次上传的大小为准；每次重试都重新打开文件，进度从 0 重新计数，
    /// 由接收方保证对外展示的值不回退
    pub async fn run(
        &self,
        request: UploadRequest<'_>,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<MessageRef, TransferError> {
        let size = tokio::fs::metadata(request.artifact)
            .await
            .map_err(|e| TransferError::UploadFailed(format!("读取暂存文件失败: {}", e)))?
            .len();
        sink.on_total(Some(size));

        let thumbnail = match request.thumbnail {
            Some(path) => Some(path.to_path_buf()),
            None => {
                self.default_thumbnail(request.task_id, request.artifact)
                    .await
            }
        };

        info!(
            "开始上传: task={}, 文件={}, 大小={} bytes, 缩略图={:?}",
            request.task_id, request.file_name, size, thumbnail
        );

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let file = File::open(request.artifact)
                .await
                .map_err(|e| TransferError::UploadFailed(format!("打开暂存文件失败: {}", e)))?;
            let reader = ProgressReader {
                inner: BufReader::with_capacity(self.read_chunk_size, file),
                read: 0,
                sink: sink.clone(),
                cancel: cancel.clone(),
            };
            let artifact = OutgoingArtifact {
                reader: Box::new(reader),
                size,
                file_name: request.file_name.to_string(),
                media_kind: request.media_kind,
            };

            let result = self
                .channel
                .send(
                    request.owner_id,
                    artifact,
                    thumbnail.as_deref(),
                    request.caption,
                )
                .await;

            let error = match result {
                Ok(message) => {
                    sink.on_progress(size);
                    info!("✓ 任务 {} 上传完成", request.task_id);
                    return Ok(message);
                }
                Err(_) if cancel.is_cancelled() => return Err(TransferError::Cancelled),
                Err(ChannelError::Cancelled) => return Err(TransferError::Cancelled),
                Err(e) => e,
            };

            if !error.is_transient() || !self.retry.can_retry(attempt) {
                warn!(
                    "✗ 任务 {} 上传失败 (已重试 {} 次): {}",
                    request.task_id, attempt, error
                );
                return Err(TransferError::UploadFailed(error.to_string()));
            }

            let delay = match &error {
                ChannelError::RateLimited { retry_after } => {
                    self.retry.delay_rate_limited(attempt, *retry_after)
                }
                _ => self.retry.delay(attempt),
            };
            attempt += 1;
            warn!(
                "任务 {} 上传失败，{:?} 后重试 (第 {}/{} 次): {}",
                request.task_id, delay, attempt, self.retry.max_retries, error
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 没有生成缩略图时下载配置的默认缩略图
    async fn default_thumbnail(&self, task_id: &str, artifact: &Path) -> Option<PathBuf> {
        let url = self.default_thumbnail_url.as_deref()?;
        let dest = artifact
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(default_thumbnail_name(task_id));
        debug!("使用默认缩略图: {}", url);
        fetch_default_thumbnail(&self.http, url, &dest).await
    }
}
