//! 测试替身：脚本化的源解析器、消息通道和进度接收方

use crate::channel::{MessageRef, MessagingChannel, OutgoingArtifact};
use crate::error::{ChannelError, SourceError};
use crate::progress::ProgressSink;
use crate::source::{ResolvedSource, SourceResolver};
use crate::task::{MediaKind, OwnerId, SourceDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// 每次读取返回的最大字节数
const READ_PIECE: usize = 64;

/// 解析阶段的脚本化失败
#[derive(Debug, Clone, Copy)]
pub enum ResolveFailure {
    Unresolvable,
    NotFound,
    Transient,
}

impl ResolveFailure {
    fn into_error(self) -> SourceError {
        match self {
            ResolveFailure::Unresolvable => SourceError::Unresolvable("scripted".into()),
            ResolveFailure::NotFound => SourceError::NotFound("scripted".into()),
            ResolveFailure::Transient => SourceError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "scripted reset",
            )),
        }
    }
}

/// 脚本化字节流
struct ScriptedStream {
    data: Vec<u8>,
    pos: usize,
    /// 读到该位置时返回连接重置
    fail_at: Option<usize>,
    delay: Option<Duration>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Some(delay) = this.delay {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
            if sleep.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            this.sleep = None;
        }

        if let Some(fail_at) = this.fail_at {
            if this.pos >= fail_at {
                this.fail_at = None;
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "scripted reset",
                )));
            }
        }

        let limit = this.fail_at.unwrap_or(usize::MAX).min(this.data.len());
        let end = (this.pos + READ_PIECE).min(limit).min(this.pos + buf.remaining());
        buf.put_slice(&this.data[this.pos..end]);
        this.pos = end;
        Poll::Ready(Ok(()))
    }
}

/// 脚本化源解析器
pub struct ScriptedResolver {
    name: String,
    body: Vec<u8>,
    declared_size: Option<u64>,
    file_name: String,
    delay: Option<Duration>,
    resolve_failures: Mutex<VecDeque<ResolveFailure>>,
    /// 每次打开后在第 N 个字节处断开（相对本次打开的起点）
    breaks: Mutex<VecDeque<usize>>,
    /// 重新打开时永不返回
    hang_reopen: bool,
    pub resolves: AtomicUsize,
    pub reopen_offsets: Mutex<Vec<u64>>,
    /// 已经交出的字节数（所有打开累计）
    pub bytes_served: AtomicU64,
}

impl ScriptedResolver {
    pub fn named(name: &str) -> Self {
        Self::with_body(Vec::new(), "file.bin").renamed(name)
    }

    /// 声明大小等于实际大小
    pub fn with_body(body: Vec<u8>, file_name: &str) -> Self {
        let declared = Some(body.len() as u64);
        Self {
            name: "scripted".to_string(),
            body,
            declared_size: declared,
            file_name: file_name.to_string(),
            delay: None,
            resolve_failures: Mutex::new(VecDeque::new()),
            breaks: Mutex::new(VecDeque::new()),
            hang_reopen: false,
            resolves: AtomicUsize::new(0),
            reopen_offsets: Mutex::new(Vec::new()),
            bytes_served: AtomicU64::new(0),
        }
    }

    /// 指定大小的零字节内容
    pub fn sized(size: usize, file_name: &str) -> Self {
        Self::with_body(vec![0u8; size], file_name)
    }

    pub fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn declared(mut self, size: Option<u64>) -> Self {
        self.declared_size = size;
        self
    }

    /// 每次读取前等待
    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_resolve(self, failure: ResolveFailure) -> Self {
        self.resolve_failures.lock().push_back(failure);
        self
    }

    pub fn break_after(self, bytes: usize) -> Self {
        self.breaks.lock().push_back(bytes);
        self
    }

    pub fn hang_on_reopen(mut self) -> Self {
        self.hang_reopen = true;
        self
    }

    fn open(&self, offset: u64) -> ResolvedSource {
        let start = (offset as usize).min(self.body.len());
        let data = self.body[start..].to_vec();
        self.bytes_served
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let fail_at = self.breaks.lock().pop_front();
        ResolvedSource {
            stream: Box::new(ScriptedStream {
                data,
                pos: 0,
                fail_at,
                delay: self.delay,
                sleep: None,
            }),
            declared_size: self.declared_size,
            media_kind: MediaKind::from_file_name(&self.file_name),
            file_name: self.file_name.clone(),
        }
    }
}

#[async_trait]
impl SourceResolver for ScriptedResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, _source: &SourceDescriptor) -> Result<ResolvedSource, SourceError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.resolve_failures.lock().pop_front() {
            return Err(failure.into_error());
        }
        Ok(self.open(0))
    }

    async fn reopen(
        &self,
        _source: &SourceDescriptor,
        offset: u64,
    ) -> Result<ResolvedSource, SourceError> {
        self.reopen_offsets.lock().push(offset);
        if self.hang_reopen {
            std::future::pending::<()>().await;
        }
        Ok(self.open(offset))
    }
}

/// 多个链接各自对应一个解析器（按 URL 完整匹配）
#[derive(Default)]
pub struct UrlMapResolver {
    routes: HashMap<String, std::sync::Arc<ScriptedResolver>>,
}

impl UrlMapResolver {
    pub fn insert(&mut self, url: &str, resolver: ScriptedResolver) -> std::sync::Arc<ScriptedResolver> {
        let resolver = std::sync::Arc::new(resolver);
        self.routes.insert(url.to_string(), resolver.clone());
        resolver
    }

    fn get(&self, url: &str) -> Result<&std::sync::Arc<ScriptedResolver>, SourceError> {
        self.routes
            .get(url)
            .ok_or_else(|| SourceError::Unresolvable(url.to_string()))
    }
}

#[async_trait]
impl SourceResolver for UrlMapResolver {
    fn name(&self) -> &str {
        "url-map"
    }

    async fn resolve(&self, source: &SourceDescriptor) -> Result<ResolvedSource, SourceError> {
        self.get(&source.url)?.resolve(source).await
    }

    async fn reopen(
        &self,
        source: &SourceDescriptor,
        offset: u64,
    ) -> Result<ResolvedSource, SourceError> {
        self.get(&source.url)?.reopen(source, offset).await
    }
}

/// 已投递的文件
#[derive(Debug, Clone)]
pub struct SentArtifact {
    pub owner_id: OwnerId,
    pub file_name: String,
    pub size: u64,
    pub bytes_read: u64,
    pub thumbnail: Option<PathBuf>,
    pub caption: String,
}

/// 脚本化消息通道
#[derive(Default)]
pub struct ScriptedChannel {
    next_id: AtomicUsize,
    send_failures: Mutex<VecDeque<ChannelError>>,
    /// 投递失败前先读取的字节数
    read_before_failure: usize,
    pub notifications: Mutex<Vec<(OwnerId, String)>>,
    pub edits: Mutex<Vec<(String, String)>>,
    pub sent: Mutex<Vec<SentArtifact>>,
    pub send_attempts: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_send(self, error: ChannelError) -> Self {
        self.send_failures.lock().push_back(error);
        self
    }

    pub fn read_before_failure(mut self, bytes: usize) -> Self {
        self.read_before_failure = bytes;
        self
    }

    pub fn notifications_for(&self, owner_id: OwnerId) -> Vec<String> {
        self.notifications
            .lock()
            .iter()
            .filter(|(owner, _)| *owner == owner_id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn edit_texts(&self) -> Vec<String> {
        self.edits.lock().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl MessagingChannel for ScriptedChannel {
    async fn notify(&self, owner_id: OwnerId, text: &str) -> Result<MessageRef, ChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.notifications.lock().push((owner_id, text.to_string()));
        Ok(MessageRef {
            owner_id,
            message_id: format!("m{}", id),
        })
    }

    async fn edit(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError> {
        self.edits
            .lock()
            .push((message.message_id.clone(), text.to_string()));
        Ok(())
    }

    async fn send(
        &self,
        owner_id: OwnerId,
        mut artifact: OutgoingArtifact,
        thumbnail: Option<&Path>,
        caption: &str,
    ) -> Result<MessageRef, ChannelError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);

        let failure = self.send_failures.lock().pop_front();
        if let Some(error) = failure {
            let mut partial = vec![0u8; self.read_before_failure];
            let _ = artifact.reader.read_exact(&mut partial).await;
            return Err(error);
        }

        let mut data = Vec::new();
        artifact.reader.read_to_end(&mut data).await?;

        self.sent.lock().push(SentArtifact {
            owner_id,
            file_name: artifact.file_name,
            size: artifact.size,
            bytes_read: data.len() as u64,
            thumbnail: thumbnail.map(Path::to_path_buf),
            caption: caption.to_string(),
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(MessageRef {
            owner_id,
            message_id: format!("m{}", id),
        })
    }
}

/// 记录所有进度上报
#[derive(Default)]
pub struct RecordingSink {
    pub totals: Mutex<Vec<Option<u64>>>,
    pub samples: Mutex<Vec<u64>>,
}

impl RecordingSink {
    pub fn last(&self) -> Option<u64> {
        self.samples.lock().last().copied()
    }
}

impl ProgressSink for RecordingSink {
    fn on_total(&self, total: Option<u64>) {
        self.totals.lock().push(total);
    }

    fn on_progress(&self, bytes_so_far: u64) {
        self.samples.lock().push(bytes_so_far);
    }
}
