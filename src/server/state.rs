// 应用状态

use crate::channel::OutboxChannel;
use crate::config::AppConfig;
use crate::quota::{MemoryQuotaStore, QuotaEnforcer, QuotaStore, SqliteQuotaStore};
use crate::queue::{QueueDeps, TaskQueue};
use crate::source::{HttpSourceResolver, ResolverRegistry};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 任务队列
    pub queue: Arc<TaskQueue>,
    /// 应用配置
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(queue: Arc<TaskQueue>, config: AppConfig) -> Self {
        Self {
            queue,
            config: Arc::new(config),
        }
    }

    /// 按配置组装配额存储、解析器、投递通道和任务队列
    ///
    /// 必须在 tokio 运行时中调用
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn QuotaStore> = match &config.storage.quota_db_path {
            Some(path) => {
                info!("使用 SQLite 配额存储: {:?}", path);
                Arc::new(SqliteQuotaStore::open(path).context("打开配额数据库失败")?)
            }
            None => {
                info!("未配置配额数据库，使用内存存储");
                Arc::new(MemoryQuotaStore::new())
            }
        };
        let quota = Arc::new(QuotaEnforcer::new(store, config.quota.clone()));

        let connect_timeout = Duration::from_secs(config.download.resolve_timeout_secs.max(1));
        let direct = Arc::new(HttpSourceResolver::new(connect_timeout)?);
        let resolver = Arc::new(
            ResolverRegistry::from_config(direct, &config.source.routes, connect_timeout)
                .context("创建链接解析器失败")?,
        );

        let channel = Arc::new(OutboxChannel::new(config.channel.outbox_dir.clone()));
        info!("投递目录: {:?}", config.channel.outbox_dir);

        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;

        let queue = TaskQueue::new(
            &config,
            QueueDeps {
                quota,
                resolver,
                channel,
                http,
            },
        );

        Ok(Self::new(queue, config))
    }

    /// 停止接收任务并取消进行中的任务
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
