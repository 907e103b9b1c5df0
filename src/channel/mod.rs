//! 消息通道
//!
//! 核心流程通过 `MessagingChannel` 发送状态消息、编辑进度、投递文件。
//! 具体的消息协议不在这里定义，内置的 `OutboxChannel` 把文件投递到本地目录

mod outbox;

pub use outbox::OutboxChannel;

use crate::error::ChannelError;
use crate::source::ByteStream;
use crate::task::{MediaKind, OwnerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 已发送消息的引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub owner_id: OwnerId,
    pub message_id: String,
}

/// 待投递的文件
pub struct OutgoingArtifact {
    pub reader: ByteStream,
    /// 上传大小（可能与下载大小不同）
    pub size: u64,
    pub file_name: String,
    pub media_kind: MediaKind,
}

#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// 发送文本消息
    async fn notify(&self, owner_id: OwnerId, text: &str) -> Result<MessageRef, ChannelError>;

    /// 编辑已发送的消息
    async fn edit(&self, message: &MessageRef, text: &str) -> Result<(), ChannelError>;

    /// 投递文件，可附带缩略图
    ///
    /// 失败时实现方负责丢弃已经上传的部分
    async fn send(
        &self,
        owner_id: OwnerId,
        artifact: OutgoingArtifact,
        thumbnail: Option<&Path>,
        caption: &str,
    ) -> Result<MessageRef, ChannelError>;
}
