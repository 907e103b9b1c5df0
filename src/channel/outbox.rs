//! 本地目录投递通道

use super::{MessageRef, MessagingChannel, OutgoingArtifact};
use crate::error::ChannelError;
use crate::task::OwnerId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// 内存中保留的消息条数，更早的消息会被淘汰
const DEFAULT_MESSAGE_CAPACITY: u64 = 4096;

/// 单条消息的记录
#[derive(Debug, Clone, Default)]
struct MessageLog {
    /// 当前文本
    text: String,
    edits: u32,
}

/// 本地目录投递通道
///
/// 文件写入 `outbox_dir/<owner_id>/`，缩略图和说明文字写在同名的旁路文件中，
/// 状态消息只保留在内存里，最多保留最近的 `capacity` 条
pub struct OutboxChannel {
    outbox_dir: PathBuf,
    next_id: AtomicU64,
    messages: DashMap<u64, MessageLog>,
    capacity: u64,
}

impl OutboxChannel {
    pub fn new(outbox_dir: impl Into<PathBuf>) -> Self {
        Self::with_message_capacity(outbox_dir, DEFAULT_MESSAGE_CAPACITY)
    }

    pub fn with_message_capacity(outbox_dir: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
            next_id: AtomicU64::new(1),
            messages: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 记录消息并淘汰滑出窗口的旧消息
    fn remember(&self, id: u64, text: &str) {
        self.messages.insert(
            id,
            MessageLog {
                text: text.to_string(),
                edits: 0,
            },
        );
        if id > self.capacity {
            self.messages.remove(&(id - self.capacity));
        }
    }

    fn lookup_key(message: &MessageRef) -> Option<u64> {
        message.message_id.parse().ok()
    }

    /// 消息当前文本
    pub fn message_text(&self, message: &MessageRef) -> Option<String> {
        let key = Self::lookup_key(message)?;
        self.messages.get(&key).map(|m| m.text.clone())
    }

    /// 消息被编辑的次数
    pub fn edit_count(&self, message: &MessageRef) -> u32 {
        Self::lookup_key(message)
            .and_then(|key| self.messages.get(&key).map(|m| m.edits))
            .unwrap_or(0)
    }

    /// 内存中保留的消息数
    pub fn tracked_messages(&self) -> usize {
        self.messages.len()
    }

    /// 投递后的文件路径
    pub fn delivered_path(&self, owner_id: OwnerId, file_name: &str) -> PathBuf {
        self.outbox_dir.join(owner_id.to_string()).join(file_name)
    }

    async fn unique_target(&self, owner_dir: &Path, file_name: &str, id: u64) -> PathBuf {
        let target = owner_dir.join(file_name);
        if fs::metadata(&target).await.is_err() {
            return target;
        }
        owner_dir.join(format!("{}_{}", id, file_name))
    }

    async fn write_artifact(
        &self,
        mut artifact: OutgoingArtifact,
        partial: &Path,
    ) -> Result<u64, ChannelError> {
        let mut file = fs::File::create(partial).await?;
        let written = tokio::io::copy(&mut artifact.reader, &mut file).await?;
        file.flush().await?;
        if written != artifact.size {
            return Err(ChannelError::Transient(format!(
                "short upload: {} of {} bytes",
                written, artifact.size
            )));
        }
        Ok(written)
    }
}

#[async_trait]
impl MessagingChannel for OutboxChannel {
    async fn notify(&self, owner_id: OwnerId, text: &str) -> Result<MessageRef, ChannelError> {
        let id = self.allocate_id();
        self.remember(id, text);
        debug!("[outbox] -> {}: {}", owner_id, text.lines().next().unwrap_or(""));
        Ok(MessageRef {
            owner_id,
            message_id: id.to_string(),
        })
    }

    async fn edit(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError> {
        let mut entry = Self::lookup_key(message)
            .and_then(|key| self.messages.get_mut(&key))
            .ok_or_else(|| ChannelError::Rejected(format!("unknown message {}", message.message_id)))?;
        entry.text = text.to_string();
        entry.edits += 1;
        Ok(())
    }

    async fn send(
        &self,
        owner_id: OwnerId,
        artifact: OutgoingArtifact,
        thumbnail: Option<&Path>,
        caption: &str,
    ) -> Result<MessageRef, ChannelError> {
        let owner_dir = self.outbox_dir.join(owner_id.to_string());
        fs::create_dir_all(&owner_dir).await?;

        let id = self.allocate_id();
        let file_name = artifact.file_name.clone();
        let partial = owner_dir.join(format!(".{}.partial", id));

        let written = match self.write_artifact(artifact, &partial).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(rm) = fs::remove_file(&partial).await {
                    debug!("清理未完成的投递文件失败: {:?}, {}", partial, rm);
                }
                return Err(e);
            }
        };

        let target = self.unique_target(&owner_dir, &file_name, id).await;
        if let Err(e) = fs::rename(&partial, &target).await {
            if let Err(rm) = fs::remove_file(&partial).await {
                debug!("清理未完成的投递文件失败: {:?}, {}", partial, rm);
            }
            return Err(e.into());
        }

        if let Some(thumb) = thumbnail {
            let thumb_target = target.with_file_name(format!(
                "{}.thumb.jpg",
                target.file_name().and_then(|n| n.to_str()).unwrap_or(&file_name)
            ));
            if let Err(e) = fs::copy(thumb, &thumb_target).await {
                warn!("缩略图投递失败: {:?}, {}", thumb, e);
            }
        }

        let caption_target = target.with_file_name(format!(
            "{}.caption.txt",
            target.file_name().and_then(|n| n.to_str()).unwrap_or(&file_name)
        ));
        fs::write(&caption_target, caption).await?;

        self.remember(id, caption);

        info!(
            "[outbox] 已投递给 {}: {:?} ({} bytes)",
            owner_id, target, written
        );
        Ok(MessageRef {
            owner_id,
            message_id: id.to_string(),
        })
    }
}
